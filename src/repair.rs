//! Repair through the appliance management API
//!
//! Two passes share the same bookkeeping:
//!
//! - [`rebind`] walks every Target and reattaches LUNs to Targets that lost
//!   their mapping, recreating the Target when a plain map is refused.
//! - [`cleanup`] deletes orphaned Targets and then orphaned LUNs.
//! - [`enable_targets`] switches disabled Targets back on with the
//!   appliance's `synoiscsiwebapi` tool.
//!
//! A failure on one object is logged and recorded; the pass moves on to the
//! next object. Only failing to list objects aborts a pass.

use crate::api::{ApiLun, ApiTarget, ApplianceApi};
use crate::error::{ReconcileError, Result};
use crate::inventory::ExternalVolumeRecord;
pub use crate::objects::ObjectKind;
use crate::objects::Target;
use crate::reconcile::{bound_conflict, bound_ids, is_known_bad, MarkerPolicy, NamingRules};
use crate::transport::{quote, RemoteShell};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// What a successful repair did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Mapped,
    Recreated,
    Deleted,
    Enabled,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Mapped => "mapped",
            Action::Recreated => "recreated",
            Action::Deleted => "deleted",
            Action::Enabled => "enabled",
        }
    }
}

/// Terminal state of one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Fixed(Action),
    Skipped(String),
    Failed {
        error: String,
        conflict: bool,
        /// The object is in a worse state than before the attempt
        critical: bool,
    },
}

impl Outcome {
    fn failed(err: &ReconcileError) -> Self {
        Outcome::Failed {
            error: err.to_string(),
            conflict: err.is_conflict(),
            critical: false,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Fixed(action) => write!(f, "fixed ({})", action.as_str()),
            Outcome::Skipped(why) => write!(f, "skipped: {}", why),
            Outcome::Failed { error, critical: true, .. } => write!(f, "CRITICAL: {}", error),
            Outcome::Failed { error, .. } => write!(f, "failed: {}", error),
        }
    }
}

/// Result for one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairResult {
    pub kind: ObjectKind,
    pub id: String,
    pub name: String,
    pub outcome: Outcome,
}

/// Per-run counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub attempted: usize,
    pub fixed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub critical: usize,
}

impl Tally {
    pub fn record(&mut self, outcome: &Outcome) {
        self.attempted += 1;
        match outcome {
            Outcome::Fixed(_) => self.fixed += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Failed {
                conflict, critical, ..
            } => {
                self.failed += 1;
                if *conflict {
                    self.conflicts += 1;
                }
                if *critical {
                    self.critical += 1;
                }
            }
        }
    }

    pub fn add(&mut self, other: &Tally) {
        self.attempted += other.attempted;
        self.fixed += other.fixed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.conflicts += other.conflicts;
        self.critical += other.critical;
    }
}

/// One [`Tally`] per object category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tallies {
    pub targets: Tally,
    pub luns: Tally,
    pub mappings: Tally,
}

impl Tallies {
    pub fn get(&self, kind: ObjectKind) -> &Tally {
        match kind {
            ObjectKind::Target => &self.targets,
            ObjectKind::Lun => &self.luns,
            ObjectKind::Mapping => &self.mappings,
        }
    }

    pub fn get_mut(&mut self, kind: ObjectKind) -> &mut Tally {
        match kind {
            ObjectKind::Target => &mut self.targets,
            ObjectKind::Lun => &mut self.luns,
            ObjectKind::Mapping => &mut self.mappings,
        }
    }

    pub fn record(&mut self, kind: ObjectKind, outcome: &Outcome) {
        self.get_mut(kind).record(outcome);
    }

    /// Sum over all categories
    pub fn total(&self) -> Tally {
        let mut total = Tally::default();
        for kind in [ObjectKind::Target, ObjectKind::Lun, ObjectKind::Mapping] {
            total.add(self.get(kind));
        }
        total
    }
}

/// All results of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub results: Vec<RepairResult>,
    /// Counters over every object
    pub tally: Tally,
    pub by_kind: Tallies,
}

impl RepairReport {
    fn push(&mut self, kind: ObjectKind, id: &str, name: &str, outcome: Outcome) {
        match &outcome {
            Outcome::Fixed(action) => {
                log::info!("{} {} ({}): {}", kind.as_str(), name, id, action.as_str())
            }
            Outcome::Skipped(why) => log::info!("{} {} ({}) skipped: {}", kind.as_str(), name, id, why),
            Outcome::Failed {
                critical: true,
                error,
                ..
            } => log::error!("CRITICAL: {} {} ({}): {}", kind.as_str(), name, id, error),
            Outcome::Failed { error, .. } => {
                log::error!("{} {} ({}) failed: {}", kind.as_str(), name, id, error)
            }
        }
        self.tally.record(&outcome);
        self.by_kind.record(kind, &outcome);
        self.results.push(RepairResult {
            kind,
            id: id.to_string(),
            name: name.to_string(),
            outcome,
        });
    }
}

/// Options shared by both passes
#[derive(Debug, Clone)]
pub struct RepairOptions<'a> {
    pub rules: &'a NamingRules,
    pub marker_policy: MarkerPolicy,
    pub dry_run: bool,
}

/// Steps of the per-Target rebind machine
enum Step {
    Map { lun_id: String },
    Delete { recreate_with: Option<String> },
    Create { lun_id: String },
    Done(Outcome),
}

fn run_rebind(api: &dyn ApplianceApi, target: &ApiTarget, first: Step) -> Outcome {
    let mut step = first;
    loop {
        step = match step {
            Step::Map { lun_id } => match api.map_lun(&target.id, &lun_id) {
                Ok(()) => Step::Done(Outcome::Fixed(Action::Mapped)),
                Err(e) if e.is_conflict() => Step::Done(Outcome::failed(&e)),
                Err(e) => {
                    log::warn!("Map of {} failed ({}); recreating the Target", target.name, e);
                    Step::Delete {
                        recreate_with: Some(lun_id),
                    }
                }
            },
            Step::Delete { recreate_with } => match api.delete_target(&target.id) {
                Ok(()) => match recreate_with {
                    Some(lun_id) => Step::Create { lun_id },
                    None => Step::Done(Outcome::Fixed(Action::Deleted)),
                },
                Err(e) => Step::Done(Outcome::failed(&e)),
            },
            Step::Create { lun_id } => {
                match api.create_target(&target.name, target.iqn.as_deref(), &lun_id) {
                    Ok(()) => Step::Done(Outcome::Fixed(Action::Recreated)),
                    Err(e) => Step::Done(Outcome::Failed {
                        error: format!("target deleted but not recreated: {}", e),
                        conflict: e.is_conflict(),
                        critical: true,
                    }),
                }
            }
            Step::Done(outcome) => return outcome,
        };
    }
}

/// Reattach LUNs to unmapped Targets and drop marker-matched Targets.
///
/// `bound` holds the ids of volumes in use; it only matters for the marker
/// rule under [`MarkerPolicy::Guarded`].
pub fn rebind(
    api: &dyn ApplianceApi,
    bound: &BTreeSet<String>,
    options: &RepairOptions<'_>,
) -> Result<RepairReport> {
    let targets = api.list_targets()?;
    let luns = api.list_luns()?;
    log::info!("Rebind: {} Targets, {} LUNs", targets.len(), luns.len());

    let lun_by_name: HashMap<&str, &ApiLun> = luns.iter().map(|l| (l.name.as_str(), l)).collect();
    let mut report = RepairReport::default();

    for target in &targets {
        let first = if is_known_bad(target, &options.rules.marker) {
            let veto = match options.marker_policy {
                MarkerPolicy::Guarded => bound_conflict(
                    options.rules,
                    bound,
                    &target.name,
                    target.iqn.as_deref(),
                ),
                MarkerPolicy::Unconditional => None,
            };
            match veto {
                Some(detail) => Step::Done(Outcome::Skipped(format!("protected: {}", detail))),
                None => Step::Delete {
                    recreate_with: None,
                },
            }
        } else if !target.is_unmapped() {
            continue;
        } else if let Some(lun) = lun_by_name.get(target.name.as_str()) {
            Step::Map {
                lun_id: lun.id.clone(),
            }
        } else {
            log::debug!("Unmapped Target {} has no LUN of the same name", target.name);
            continue;
        };

        let outcome = match first {
            Step::Done(outcome) => outcome,
            Step::Delete { .. } if options.dry_run => {
                Outcome::Skipped("dry run: would delete".to_string())
            }
            Step::Map { .. } if options.dry_run => {
                Outcome::Skipped("dry run: would map (recreate on failure)".to_string())
            }
            step => run_rebind(api, target, step),
        };
        report.push(ObjectKind::Target, &target.id, &target.name, outcome);
    }

    Ok(report)
}

/// Delete orphaned Targets, then orphaned LUNs.
///
/// A LUN is orphaned when it carries the provisioning prefix and its uuid is
/// no volume handle the inventory knows. A LUN or Target whose derived id is
/// Bound is never deleted.
pub fn cleanup(
    api: &dyn ApplianceApi,
    external: &[ExternalVolumeRecord],
    options: &RepairOptions<'_>,
) -> Result<RepairReport> {
    let handles: HashSet<&str> = external
        .iter()
        .filter_map(|r| r.volume_handle.as_deref())
        .collect();
    if handles.is_empty() {
        return Err(ReconcileError::Integrity(
            "inventory lists no volume handles; refusing to judge LUNs as orphaned".into(),
        ));
    }
    let bound = bound_ids(external);
    let rules = options.rules;

    let luns = api.list_luns()?;
    let targets = api.list_targets()?;

    let (orphan_luns, active_luns): (Vec<&ApiLun>, Vec<&ApiLun>) = luns
        .iter()
        .filter(|l| rules.is_provisioned(&l.name))
        .partition(|l| l.uuid.as_deref().map(|u| !handles.contains(u)).unwrap_or(false));
    let active_names: HashSet<&str> = active_luns.iter().map(|l| l.name.as_str()).collect();

    let orphan_targets: Vec<&ApiTarget> = targets
        .iter()
        .filter(|t| rules.is_provisioned(&t.name) && !active_names.contains(t.name.as_str()))
        .collect();

    log::info!(
        "Cleanup: {} of {} LUNs and {} of {} Targets orphaned",
        orphan_luns.len(),
        luns.len(),
        orphan_targets.len(),
        targets.len()
    );

    let mut report = RepairReport::default();

    for target in orphan_targets {
        let outcome = match bound_conflict(rules, &bound, &target.name, target.iqn.as_deref()) {
            Some(detail) => Outcome::Skipped(format!("protected: {}", detail)),
            None if options.dry_run => Outcome::Skipped("dry run: would delete".to_string()),
            None => match api.delete_target(&target.id) {
                Ok(()) => Outcome::Fixed(Action::Deleted),
                Err(e) => Outcome::failed(&e),
            },
        };
        report.push(ObjectKind::Target, &target.id, &target.name, outcome);
    }

    for lun in orphan_luns {
        let outcome = match bound_conflict(rules, &bound, &lun.name, None) {
            Some(detail) => {
                log::error!(
                    "CRITICAL: refusing to delete LUN {} ({}): {}",
                    lun.name,
                    lun.id,
                    detail
                );
                Outcome::Skipped(format!("protected: {}", detail))
            }
            None if options.dry_run => Outcome::Skipped("dry run: would delete".to_string()),
            None => match api.delete_lun(&lun.id) {
                Ok(()) => Outcome::Fixed(Action::Deleted),
                Err(e) => Outcome::failed(&e),
            },
        };
        report.push(ObjectKind::Lun, &lun.id, &lun.name, outcome);
    }

    if report.tally.conflicts > 0 {
        log::warn!(
            "{} objects are busy (active iSCSI sessions); restart the iSCSI service and run again",
            report.tally.conflicts
        );
    }
    Ok(report)
}

/// Enable each Target in `disabled` with `<tool> target enable <tid>`.
///
/// Enabling does not touch the configuration files directly, so the iSCSI
/// service keeps running.
pub fn enable_targets(
    shell: &dyn RemoteShell,
    tool: &str,
    disabled: &[Target],
    dry_run: bool,
) -> RepairReport {
    log::info!("Enable: {} disabled Targets", disabled.len());
    let mut report = RepairReport::default();

    for target in disabled {
        let command = format!("{} target enable {}", tool, quote(&target.tid));
        let outcome = if dry_run {
            Outcome::Skipped("dry run: would enable".to_string())
        } else {
            match shell.check_privileged(&command) {
                Ok(_) => Outcome::Fixed(Action::Enabled),
                Err(e) => Outcome::failed(&e),
            }
        };
        report.push(ObjectKind::Target, &target.tid, &target.name, outcome);
    }

    report
}
