//! Safe in-place editing of the appliance configuration files
//!
//! The iSCSI service rewrites its files on shutdown, so edits only stick
//! while it is stopped. [`SafeMutator::apply`] runs every edit of a plan
//! inside one stop/start window:
//!
//! 1. stop the service and let it settle
//! 2. read each file and drop the selected blocks
//! 3. stage the result in a temp file (chunked base64, checked with MD5)
//! 4. back up every original
//! 5. copy the staged files over the originals
//! 6. start the service and count the surviving blocks
//!
//! A failure before step 4 leaves every original untouched. The service is
//! then left stopped and the error says so.

use crate::block::{self, Selector};
use crate::config::{ConfLocation, ServiceSettings, TransferSettings};
use crate::error::{ReconcileError, Result};
use crate::objects::ObjectKind;
use crate::transport::{quote, RemoteShell};
use base64::prelude::*;
use rand::Rng;

/// Blocks to drop from one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEdit {
    /// Kind of object the file holds
    pub kind: ObjectKind,
    pub location: ConfLocation,
    pub selectors: Vec<Selector>,
    /// Number of blocks the plan expects the selectors to match
    pub expected: usize,
}

/// One file that was rewritten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFile {
    pub kind: ObjectKind,
    pub path: String,
    pub backup: String,
    /// Headers of the removed blocks
    pub removed: Vec<String>,
    pub kept: usize,
    /// Blocks counted on the appliance after the restart
    pub verified: Option<usize>,
}

/// What [`SafeMutator::apply`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Nothing to change; no remote command was issued
    NoOp,
    Applied {
        files: Vec<AppliedFile>,
        /// Files skipped because their content no longer matched the plan
        integrity_errors: Vec<String>,
    },
}

impl ApplyOutcome {
    pub fn removed_count(&self) -> usize {
        match self {
            ApplyOutcome::NoOp => 0,
            ApplyOutcome::Applied { files, .. } => files.iter().map(|f| f.removed.len()).sum(),
        }
    }
}

/// A filtered file waiting on the appliance in a temp location
struct Staged {
    kind: ObjectKind,
    location: ConfLocation,
    temp: String,
    temp_b64: String,
    removed: Vec<String>,
    kept: usize,
}

/// Applies [`FileEdit`]s through a [`RemoteShell`]
pub struct SafeMutator<'a> {
    shell: &'a dyn RemoteShell,
    service: ServiceSettings,
    transfer: TransferSettings,
}

impl<'a> SafeMutator<'a> {
    pub fn new(
        shell: &'a dyn RemoteShell,
        service: ServiceSettings,
        transfer: TransferSettings,
    ) -> Self {
        SafeMutator {
            shell,
            service,
            transfer,
        }
    }

    /// Apply all edits in a single service stop/start window.
    pub fn apply(&self, edits: &[FileEdit]) -> Result<ApplyOutcome> {
        if edits.iter().all(|e| e.expected == 0) {
            log::info!("Nothing to change; leaving the appliance alone");
            return Ok(ApplyOutcome::NoOp);
        }

        self.stop_service()?;
        if !self.service.settle.is_zero() {
            log::debug!("Waiting {:?} for the service to settle", self.service.settle);
            std::thread::sleep(self.service.settle);
        }

        let token = format!("{:016x}", rand::thread_rng().gen::<u64>());
        let mut staged: Vec<Staged> = Vec::new();
        let mut integrity_errors = Vec::new();

        for (index, edit) in edits.iter().enumerate() {
            match self.stage(edit, &token, index) {
                Ok(Some(s)) => staged.push(s),
                Ok(None) => {}
                Err(ReconcileError::Integrity(msg)) => {
                    log::error!("Skipping {}: {}", edit.location.path, msg);
                    integrity_errors.push(msg);
                }
                Err(e) => {
                    self.cleanup(&staged);
                    let (temp, temp_b64) = self.temp_paths(&token, index);
                    self.remove_temps(&temp, &temp_b64);
                    return Err(ReconcileError::ServiceStopped(format!(
                        "aborted before changing {}: {}",
                        edit.location.path, e
                    )));
                }
            }
        }

        let mut backups = Vec::with_capacity(staged.len());
        for s in &staged {
            match self.backup(&s.location.path) {
                Ok(backup) => backups.push(backup),
                Err(e) => {
                    // Originals are still untouched
                    self.cleanup(&staged);
                    log::info!("Starting {} after failed backup", self.service.name);
                    if let Err(restart) = self.service_action("start", "--start") {
                        return Err(ReconcileError::ServiceStopped(format!(
                            "backup of {} failed: {}; restart failed: {}",
                            s.location.path, e, restart
                        )));
                    }
                    return Err(e);
                }
            }
        }

        let mut files: Vec<AppliedFile> = Vec::with_capacity(staged.len());
        for (s, backup) in staged.iter().zip(backups) {
            if let Err(e) = self.swap(s) {
                return Err(ReconcileError::PartialApply {
                    path: s.location.path.clone(),
                    backup,
                    reason: format!("{}; service left stopped", e),
                    swapped: files.iter().map(|f| (f.path.clone(), f.backup.clone())).collect(),
                });
            }
            log::info!(
                "Rewrote {} ({} blocks removed, backup at {})",
                s.location.path,
                s.removed.len(),
                backup
            );
            files.push(AppliedFile {
                kind: s.kind,
                path: s.location.path.clone(),
                backup,
                removed: s.removed.clone(),
                kept: s.kept,
                verified: None,
            });
        }

        self.start_service()?;

        for (file, s) in files.iter_mut().zip(&staged) {
            file.verified = self.verify(&s.location, s.kept);
        }
        self.cleanup(&staged);

        Ok(ApplyOutcome::Applied {
            files,
            integrity_errors,
        })
    }

    /// Read, filter and upload one file. `None` when it needs no change.
    fn stage(&self, edit: &FileEdit, token: &str, index: usize) -> Result<Option<Staged>> {
        let path = &edit.location.path;
        if edit.expected == 0 {
            return Ok(None);
        }

        let raw = self.shell.read_file(path)?;
        let parsed = block::parse(&raw, &edit.location.prefix);
        let filtered = parsed.render_filtered(&edit.selectors);

        if filtered.removed.is_empty() {
            return Err(ReconcileError::Integrity(format!(
                "{}: expected to remove {} blocks but none matched",
                path, edit.expected
            )));
        }
        if filtered.removed.len() != edit.expected {
            log::warn!(
                "{}: expected to remove {} blocks, matched {}",
                path,
                edit.expected,
                filtered.removed.len()
            );
        }

        let (temp, temp_b64) = self.temp_paths(token, index);
        self.upload(&filtered.content, &temp, &temp_b64)?;

        Ok(Some(Staged {
            kind: edit.kind,
            location: edit.location.clone(),
            temp,
            temp_b64,
            removed: filtered.removed,
            kept: filtered.kept,
        }))
    }

    fn temp_paths(&self, token: &str, index: usize) -> (String, String) {
        let temp = format!("{}/iscsi_reconcile_{}_{}", self.transfer.temp_dir, token, index);
        let temp_b64 = format!("{}.b64", temp);
        (temp, temp_b64)
    }

    fn upload(&self, content: &str, temp: &str, temp_b64: &str) -> Result<()> {
        let encoded = BASE64_STANDARD.encode(content.as_bytes());

        self.shell.check(&format!("rm -f {} {}", quote(temp), quote(temp_b64)))?;
        self.shell.check(&format!("touch {}", quote(temp_b64)))?;
        for chunk in encoded.as_bytes().chunks(self.transfer.chunk_size) {
            let chunk = String::from_utf8_lossy(chunk);
            self.shell.check(&format!("echo '{}' >> {}", chunk, quote(temp_b64)))?;
        }
        self.shell.check(&format!("base64 -d {} > {}", quote(temp_b64), quote(temp)))?;

        let local = hex::encode(md5::compute(content.as_bytes()).0);
        let listing = self.shell.check(&format!("md5sum {}", quote(temp)))?;
        let remote = listing.split_whitespace().next().unwrap_or("");
        if remote != local {
            return Err(ReconcileError::Transport(format!(
                "checksum mismatch on {}: local {}, remote {}",
                temp, local, remote
            )));
        }
        log::debug!("Staged {} bytes at {} (md5 {})", content.len(), temp, local);
        Ok(())
    }

    fn backup(&self, path: &str) -> Result<String> {
        let backup = format!("{}{}", path, self.transfer.backup_suffix);
        self.shell
            .check_privileged(&format!("cp {} {}", quote(path), quote(&backup)))?;
        Ok(backup)
    }

    fn swap(&self, staged: &Staged) -> Result<()> {
        let path = quote(&staged.location.path);
        self.shell
            .check_privileged(&format!("cp {} {}", quote(&staged.temp), path))?;
        self.shell.check_privileged(&format!("chmod 644 {}", path))?;
        Ok(())
    }

    fn stop_service(&self) -> Result<()> {
        log::info!("Stopping {}", self.service.name);
        self.service_action("stop", "--stop")
    }

    fn start_service(&self) -> Result<()> {
        log::info!("Starting {}", self.service.name);
        self.service_action("start", "--start")
            .map_err(|e| ReconcileError::ServiceStopped(format!("restart failed: {}", e)))
    }

    fn service_action(&self, verb: &str, flag: &str) -> Result<()> {
        let primary = format!("systemctl {} {}", verb, quote(&self.service.name));
        if self.shell.run_privileged(&primary)?.success() {
            return Ok(());
        }
        log::warn!("`{}` failed, trying {}", primary, self.service.fallback_tool);
        let fallback = format!(
            "{} {} {}",
            self.service.fallback_tool,
            flag,
            quote(&self.service.name)
        );
        self.shell.check_privileged(&fallback).map(|_| ())
    }

    /// Advisory block count after the restart
    fn verify(&self, location: &ConfLocation, expected: usize) -> Option<usize> {
        let pattern = format!("^\\[{}", location.prefix);
        let command = format!("grep -c {} {}", quote(&pattern), quote(&location.path));
        let count = match self.shell.run_privileged(&command) {
            Ok(out) => out.stdout.trim().parse::<usize>().ok(),
            Err(e) => {
                log::warn!("Could not verify {}: {}", location.path, e);
                None
            }
        };
        match count {
            Some(n) if n == expected => log::info!("{}: {} blocks present", location.path, n),
            Some(n) => log::warn!(
                "{}: {} blocks present after restart, expected {}",
                location.path,
                n,
                expected
            ),
            None => {}
        }
        count
    }

    fn cleanup(&self, staged: &[Staged]) {
        for s in staged {
            self.remove_temps(&s.temp, &s.temp_b64);
        }
    }

    fn remove_temps(&self, temp: &str, temp_b64: &str) {
        let command = format!("rm -f {} {}", quote(temp), quote(temp_b64));
        if let Err(e) = self.shell.exec(&command) {
            log::debug!("Temp cleanup failed: {}", e);
        }
    }
}
