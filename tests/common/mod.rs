//! Shared fixtures and in-memory fakes for the integration tests
#![allow(dead_code)]

use base64::prelude::*;
use iscsi_reconcile::api::{ApiLun, ApiTarget, ApplianceApi, UNMAPPED_INDEX};
use iscsi_reconcile::config::{ApplianceFiles, Settings};
use iscsi_reconcile::inventory::{parse_pv_list, ExternalVolumeRecord};
use iscsi_reconcile::{CommandOutput, ReconcileError, RemoteShell, Result};
use once_cell::sync::Lazy;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};

// ============================================================================
// Fixture
// ============================================================================

#[derive(Debug)]
pub struct Fixture {
    pub raw: String,
    pub luns: String,
    pub targets: String,
    pub mappings: String,
    pub pv_json: String,
}

pub static FIXTURE: Lazy<Fixture> = Lazy::new(|| {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/appliance.toml");
    let raw = std::fs::read_to_string(path).expect("Failed to read tests/fixtures/appliance.toml");

    let doc = raw
        .parse::<toml::Value>()
        .expect("Failed to parse appliance.toml - invalid TOML syntax");

    let text = |section: &str, key: &str| -> String {
        doc.get(section)
            .and_then(|s| s.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| panic!("Missing '{}' in [{}] section", key, section))
            .to_string()
    };

    Fixture {
        luns: text("conf", "luns"),
        targets: text("conf", "targets"),
        mappings: text("conf", "mappings"),
        pv_json: text("inventory", "pv_json"),
        raw,
    }
});

/// Settings from the fixture with a test password
pub fn settings() -> Settings {
    Settings::builder()
        .apply_toml(&FIXTURE.raw)
        .expect("fixture settings")
        .credentials("manager", "not-a-real-password")
        .build()
        .expect("valid settings")
}

pub fn volumes() -> Vec<ExternalVolumeRecord> {
    parse_pv_list(&FIXTURE.pv_json).expect("fixture inventory")
}

// ============================================================================
// Fake remote shell
// ============================================================================

/// Split a command line into words, honouring single quotes and backslashes
fn words(command: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    out.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        out.push(current);
    }
    out
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        status: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn fail(stderr: &str) -> CommandOutput {
    CommandOutput {
        status: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// An appliance whose file system is a map and whose shell understands just
/// the commands the tool issues
pub struct FakeShell {
    pub files: RefCell<BTreeMap<String, String>>,
    /// Every command run, prefixed with `$ ` or `# ` (privileged)
    pub log: RefCell<Vec<String>>,
    pub service_running: Cell<bool>,
    pub deny_plain_reads: bool,
    pub corrupt_md5: bool,
    fail_on: Vec<(String, usize, Cell<usize>)>,
}

impl FakeShell {
    pub fn new() -> Self {
        FakeShell {
            files: RefCell::new(BTreeMap::new()),
            log: RefCell::new(Vec::new()),
            service_running: Cell::new(true),
            deny_plain_reads: false,
            corrupt_md5: false,
            fail_on: Vec::new(),
        }
    }

    /// Shell holding the fixture's three configuration files
    pub fn with_fixture(files: &ApplianceFiles) -> Self {
        let shell = FakeShell::new();
        shell.put(&files.luns.path, &FIXTURE.luns);
        shell.put(&files.targets.path, &FIXTURE.targets);
        shell.put(&files.mappings.path, &FIXTURE.mappings);
        shell
    }

    /// Fail the `nth` (1-based) command containing `pattern`. May be
    /// chained to inject several failures.
    pub fn fail_on(mut self, pattern: &str, nth: usize) -> Self {
        self.fail_on.push((pattern.to_string(), nth, Cell::new(0)));
        self
    }

    pub fn put(&self, path: &str, content: &str) {
        self.files.borrow_mut().insert(path.to_string(), content.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.borrow().get(path).cloned()
    }

    pub fn commands_containing(&self, pattern: &str) -> usize {
        self.log.borrow().iter().filter(|c| c.contains(pattern)).count()
    }

    fn injected_failure(&self, command: &str) -> bool {
        let mut failed = false;
        for (pattern, nth, seen) in &self.fail_on {
            if command.contains(pattern.as_str()) {
                seen.set(seen.get() + 1);
                failed |= seen.get() == *nth;
            }
        }
        failed
    }

    fn run(&self, command: &str, privileged: bool) -> CommandOutput {
        let marker = if privileged { "# " } else { "$ " };
        self.log.borrow_mut().push(format!("{}{}", marker, command));

        if self.injected_failure(command) {
            return fail("injected failure");
        }

        let w = words(command);
        let arg = |i: usize| w.get(i).map(String::as_str).unwrap_or("");
        let mut files = self.files.borrow_mut();

        match arg(0) {
            "cat" => {
                if self.deny_plain_reads && !privileged {
                    return fail("Permission denied");
                }
                match files.get(arg(1)) {
                    Some(content) => ok(content.clone()),
                    None => fail("No such file or directory"),
                }
            }
            "rm" => {
                for path in w.iter().skip(2) {
                    files.remove(path);
                }
                ok("")
            }
            "touch" => {
                files.entry(arg(1).to_string()).or_default();
                ok("")
            }
            "echo" if arg(2) == ">>" => {
                let entry = files.entry(arg(3).to_string()).or_default();
                entry.push_str(arg(1));
                entry.push('\n');
                ok("")
            }
            "base64" if arg(1) == "-d" && arg(3) == ">" => {
                let encoded: String = match files.get(arg(2)) {
                    Some(s) => s.chars().filter(|c| !c.is_whitespace()).collect(),
                    None => return fail("base64: No such file or directory"),
                };
                match BASE64_STANDARD.decode(encoded) {
                    Ok(bytes) => {
                        files.insert(arg(4).to_string(), String::from_utf8_lossy(&bytes).into_owned());
                        ok("")
                    }
                    Err(_) => fail("base64: invalid input"),
                }
            }
            "md5sum" => match files.get(arg(1)) {
                Some(content) => {
                    let digest = if self.corrupt_md5 {
                        "0".repeat(32)
                    } else {
                        hex::encode(md5::compute(content.as_bytes()).0)
                    };
                    ok(format!("{}  {}\n", digest, arg(1)))
                }
                None => fail("md5sum: No such file or directory"),
            },
            "cp" if privileged => {
                let source = files.get(arg(1)).cloned();
                match source {
                    Some(content) => {
                        files.insert(arg(2).to_string(), content);
                        ok("")
                    }
                    None => fail("cp: cannot stat"),
                }
            }
            "chmod" if privileged => ok(""),
            "systemctl" if privileged => {
                match arg(1) {
                    "stop" => self.service_running.set(false),
                    "start" => self.service_running.set(true),
                    _ => return fail("unknown verb"),
                }
                ok("")
            }
            "grep" if arg(1) == "-c" => {
                let prefix = arg(2).trim_start_matches('^').replace("\\[", "[");
                match files.get(arg(3)) {
                    Some(content) => {
                        let n = content.lines().filter(|l| l.starts_with(prefix.as_str())).count();
                        CommandOutput {
                            status: if n == 0 { 1 } else { 0 },
                            stdout: format!("{}\n", n),
                            stderr: String::new(),
                        }
                    }
                    None => fail("grep: No such file or directory"),
                }
            }
            tool if privileged
                && tool.ends_with("synoiscsiwebapi")
                && arg(1) == "target"
                && arg(2) == "enable" =>
            {
                ok("")
            }
            _ => fail("permission denied or unknown command"),
        }
    }
}

impl RemoteShell for FakeShell {
    fn exec(&self, command: &str) -> Result<CommandOutput> {
        Ok(self.run(command, false))
    }

    fn run_privileged(&self, command: &str) -> Result<CommandOutput> {
        Ok(self.run(command, true))
    }
}

// ============================================================================
// Fake management API
// ============================================================================

pub struct FakeApi {
    pub targets: RefCell<Vec<ApiTarget>>,
    pub luns: RefCell<Vec<ApiLun>>,
    /// Mutating calls in order, e.g. `delete_target:3`
    pub calls: RefCell<Vec<String>>,
    /// Error code to answer for a given call key
    failures: HashMap<String, i64>,
    next_id: Cell<u32>,
}

impl FakeApi {
    pub fn new(targets: Vec<ApiTarget>, luns: Vec<ApiLun>) -> Self {
        FakeApi {
            targets: RefCell::new(targets),
            luns: RefCell::new(luns),
            calls: RefCell::new(Vec::new()),
            failures: HashMap::new(),
            next_id: Cell::new(100),
        }
    }

    pub fn failing(mut self, call: &str, code: i64) -> Self {
        self.failures.insert(call.to_string(), code);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn record(&self, key: String, object: &str) -> Result<()> {
        self.calls.borrow_mut().push(key.clone());
        match self.failures.get(&key) {
            Some(code) => Err(ReconcileError::from_api(
                object,
                *code,
                format!(r#"{{"success":false,"error":{{"code":{}}}}}"#, code),
            )),
            None => Ok(()),
        }
    }
}

pub fn api_target(id: &str, name: &str, mapping_index: i64) -> ApiTarget {
    ApiTarget {
        id: id.to_string(),
        name: name.to_string(),
        iqn: Some(format!("iqn.2000-01.com.synology:{}", name)),
        mapping_index,
        mapped_lun_ids: Vec::new(),
    }
}

pub fn unmapped_target(id: &str, name: &str) -> ApiTarget {
    api_target(id, name, UNMAPPED_INDEX)
}

pub fn api_lun(id: &str, name: &str, uuid: &str) -> ApiLun {
    ApiLun {
        id: id.to_string(),
        name: name.to_string(),
        uuid: Some(uuid.to_string()),
    }
}

impl ApplianceApi for FakeApi {
    fn list_targets(&self) -> Result<Vec<ApiTarget>> {
        Ok(self.targets.borrow().clone())
    }

    fn list_luns(&self) -> Result<Vec<ApiLun>> {
        Ok(self.luns.borrow().clone())
    }

    fn create_target(&self, name: &str, iqn: Option<&str>, lun_id: &str) -> Result<()> {
        self.record(format!("create_target:{}", name), name)?;
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.targets.borrow_mut().push(ApiTarget {
            id: id.to_string(),
            name: name.to_string(),
            iqn: iqn.map(str::to_string),
            mapping_index: 0,
            mapped_lun_ids: vec![lun_id.to_string()],
        });
        Ok(())
    }

    fn delete_target(&self, id: &str) -> Result<()> {
        self.record(format!("delete_target:{}", id), &format!("target {}", id))?;
        self.targets.borrow_mut().retain(|t| t.id != id);
        Ok(())
    }

    fn map_lun(&self, target_id: &str, lun_id: &str) -> Result<()> {
        self.record(format!("map_lun:{}", target_id), &format!("target {}", target_id))?;
        if let Some(t) = self.targets.borrow_mut().iter_mut().find(|t| t.id == target_id) {
            t.mapping_index = 0;
            t.mapped_lun_ids.push(lun_id.to_string());
        }
        Ok(())
    }

    fn delete_lun(&self, id: &str) -> Result<()> {
        self.record(format!("delete_lun:{}", id), &format!("LUN {}", id))?;
        self.luns.borrow_mut().retain(|l| l.id != id);
        Ok(())
    }
}
