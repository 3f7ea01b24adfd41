//! Run configuration
//!
//! All settings are gathered once at startup into a [`Settings`] value and
//! handed to each component. Sources, lowest precedence first: built-in
//! defaults, an optional TOML file, then an [`EnvSnapshot`] captured by the
//! binary. Components never look at the process environment themselves.

use crate::error::{ReconcileError, Result};
use crate::reconcile::{MarkerPolicy, NamingRules, ZombieMatch};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Login credentials for the appliance (SSH, sudo and management API)
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    /// Never logged; see the `Debug` impl
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Where one configuration file lives and which headers start its blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfLocation {
    pub path: String,
    pub prefix: String,
}

impl ConfLocation {
    pub fn new(path: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
        }
    }
}

/// The three iSCSI configuration files of one appliance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplianceFiles {
    pub luns: ConfLocation,
    pub targets: ConfLocation,
    pub mappings: ConfLocation,
}

impl Default for ApplianceFiles {
    fn default() -> Self {
        ApplianceFiles {
            luns: ConfLocation::new("/usr/syno/etc/iscsi_lun.conf", "iSCSI_LUN"),
            targets: ConfLocation::new("/usr/syno/etc/iscsi_target.conf", "iSCSI_T"),
            mappings: ConfLocation::new("/usr/syno/etc/iscsi_mapping.conf", "iSCSI_M"),
        }
    }
}

/// Storage service control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    /// systemd unit of the iSCSI service
    pub name: String,
    /// Legacy service tool tried when `systemctl` fails
    pub fallback_tool: String,
    /// Pause after stopping so the service flushes its own writes
    pub settle: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        ServiceSettings {
            name: "pkg-iscsi".to_string(),
            fallback_tool: "/usr/syno/sbin/synoservice".to_string(),
            settle: Duration::from_secs(5),
        }
    }
}

/// Content transfer through the remote shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSettings {
    /// Maximum base64 bytes per appended chunk
    pub chunk_size: usize,
    pub temp_dir: String,
    pub backup_suffix: String,
}

impl Default for TransferSettings {
    fn default() -> Self {
        TransferSettings {
            chunk_size: 1000,
            temp_dir: "/tmp".to_string(),
            backup_suffix: ".bak_reconcile".to_string(),
        }
    }
}

/// Upper bound for `chunk_size`; the appliance shell rejects long command lines
pub const MAX_CHUNK_SIZE: usize = 4096;

/// Snapshot of the environment variables the tool understands
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub port: Option<String>,
    pub api_url: Option<String>,
}

impl EnvSnapshot {
    /// Read `SYNOLOGY_HOST`, `SYNOLOGY_USER`, `SYNOLOGY_PASSWORD`,
    /// `SYNOLOGY_PORT` and `SYNOLOGY_API_URL`. Empty values count as unset.
    pub fn capture() -> Self {
        fn var(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        }
        EnvSnapshot {
            host: var("SYNOLOGY_HOST"),
            user: var("SYNOLOGY_USER"),
            password: var("SYNOLOGY_PASSWORD"),
            port: var("SYNOLOGY_PORT"),
            api_url: var("SYNOLOGY_API_URL"),
        }
    }
}

/// Complete run configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub ssh_port: u16,
    pub credentials: Credentials,
    pub ssh_program: String,
    /// Authenticate SSH with the password (via `sshpass -e`) instead of keys
    pub ssh_password_auth: bool,
    pub command_timeout: Duration,
    pub files: ApplianceFiles,
    pub service: ServiceSettings,
    pub transfer: TransferSettings,
    /// Base URL of the management API, e.g. `http://nas:5000/webapi`
    pub api_url: String,
    pub api_timeout: Duration,
    pub kubectl: String,
    /// Appliance command-line front end to the iSCSI service
    pub webapi_tool: String,
    pub naming: NamingRules,
    pub marker_policy: MarkerPolicy,
}

impl Settings {
    /// Create a new builder with defaults
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// Defaults, then `file` (if any), then `env`.
    pub fn load(file: Option<&Path>, env: &EnvSnapshot) -> Result<Self> {
        let mut builder = Settings::builder();
        if let Some(path) = file {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                ReconcileError::Config(format!("cannot read {}: {}", path.display(), e))
            })?;
            builder = builder.apply_toml(&contents)?;
        }
        builder.apply_env(env)?.build()
    }
}

/// Builder for [`Settings`]
#[derive(Default)]
pub struct SettingsBuilder {
    host: Option<String>,
    ssh_port: Option<u16>,
    username: Option<String>,
    secret: Option<String>,
    ssh_program: Option<String>,
    ssh_password_auth: bool,
    command_timeout: Option<Duration>,
    files: ApplianceFiles,
    service: ServiceSettings,
    transfer: TransferSettings,
    api_url: Option<String>,
    api_timeout: Option<Duration>,
    kubectl: Option<String>,
    webapi_tool: Option<String>,
    naming: NamingRules,
    marker_policy: MarkerPolicy,
}

impl fmt::Debug for SettingsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsBuilder")
            .field("host", &self.host)
            .field("ssh_port", &self.ssh_port)
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("files", &self.files)
            .field("service", &self.service)
            .field("transfer", &self.transfer)
            .field("api_url", &self.api_url)
            .field("naming", &self.naming)
            .field("marker_policy", &self.marker_policy)
            .finish_non_exhaustive()
    }
}

fn section<'a>(root: &'a toml::Value, name: &str) -> Option<&'a toml::Value> {
    root.get(name)
}

fn get_str(root: &toml::Value, sect: &str, key: &str) -> Result<Option<String>> {
    match section(root, sect).and_then(|s| s.get(key)) {
        None => Ok(None),
        Some(v) => v.as_str().map(|s| Some(s.to_string())).ok_or_else(|| {
            ReconcileError::Config(format!("[{}] {} must be a string", sect, key))
        }),
    }
}

fn get_int(root: &toml::Value, sect: &str, key: &str) -> Result<Option<i64>> {
    match section(root, sect).and_then(|s| s.get(key)) {
        None => Ok(None),
        Some(v) => v.as_integer().map(Some).ok_or_else(|| {
            ReconcileError::Config(format!("[{}] {} must be an integer", sect, key))
        }),
    }
}

fn get_bool(root: &toml::Value, sect: &str, key: &str) -> Result<Option<bool>> {
    match section(root, sect).and_then(|s| s.get(key)) {
        None => Ok(None),
        Some(v) => v.as_bool().map(Some).ok_or_else(|| {
            ReconcileError::Config(format!("[{}] {} must be a boolean", sect, key))
        }),
    }
}

fn seconds(value: i64, what: &str) -> Result<Duration> {
    u64::try_from(value)
        .map(Duration::from_secs)
        .map_err(|_| ReconcileError::Config(format!("{} must not be negative", what)))
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .map_err(|_| ReconcileError::Config(format!("invalid SSH port: {}", value)))
}

impl SettingsBuilder {
    /// Set the appliance host name or address
    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = Some(port);
        self
    }

    pub fn credentials(mut self, username: &str, secret: &str) -> Self {
        self.username = Some(username.to_string());
        self.secret = Some(secret.to_string());
        self
    }

    pub fn api_url(mut self, url: &str) -> Self {
        self.api_url = Some(url.to_string());
        self
    }

    pub fn files(mut self, files: ApplianceFiles) -> Self {
        self.files = files;
        self
    }

    pub fn service(mut self, service: ServiceSettings) -> Self {
        self.service = service;
        self
    }

    pub fn transfer(mut self, transfer: TransferSettings) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn naming(mut self, naming: NamingRules) -> Self {
        self.naming = naming;
        self
    }

    pub fn marker_policy(mut self, policy: MarkerPolicy) -> Self {
        self.marker_policy = policy;
        self
    }

    /// Overlay values from a TOML document.
    ///
    /// Recognised sections: `[appliance]`, `[api]`, `[paths]`, `[prefixes]`,
    /// `[service]`, `[transfer]`, `[naming]`, `[safety]`. Unknown keys are
    /// ignored; keys of the wrong type are an error.
    pub fn apply_toml(mut self, contents: &str) -> Result<Self> {
        let root = contents
            .parse::<toml::Value>()
            .map_err(|e| ReconcileError::Config(format!("invalid TOML: {}", e)))?;

        if let Some(host) = get_str(&root, "appliance", "host")? {
            self.host = Some(host);
        }
        if let Some(port) = get_int(&root, "appliance", "ssh_port")? {
            self.ssh_port = Some(parse_port(&port.to_string())?);
        }
        if let Some(user) = get_str(&root, "appliance", "user")? {
            self.username = Some(user);
        }
        if let Some(program) = get_str(&root, "appliance", "ssh_program")? {
            self.ssh_program = Some(program);
        }
        if let Some(flag) = get_bool(&root, "appliance", "ssh_password_auth")? {
            self.ssh_password_auth = flag;
        }
        if let Some(secs) = get_int(&root, "appliance", "command_timeout_secs")? {
            self.command_timeout = Some(seconds(secs, "command_timeout_secs")?);
        }
        if let Some(kubectl) = get_str(&root, "appliance", "kubectl")? {
            self.kubectl = Some(kubectl);
        }
        if let Some(tool) = get_str(&root, "appliance", "webapi_tool")? {
            self.webapi_tool = Some(tool);
        }

        if let Some(url) = get_str(&root, "api", "url")? {
            self.api_url = Some(url);
        }
        if let Some(secs) = get_int(&root, "api", "timeout_secs")? {
            self.api_timeout = Some(seconds(secs, "api.timeout_secs")?);
        }

        if let Some(p) = get_str(&root, "paths", "luns")? {
            self.files.luns.path = p;
        }
        if let Some(p) = get_str(&root, "paths", "targets")? {
            self.files.targets.path = p;
        }
        if let Some(p) = get_str(&root, "paths", "mappings")? {
            self.files.mappings.path = p;
        }
        if let Some(p) = get_str(&root, "prefixes", "luns")? {
            self.files.luns.prefix = p;
        }
        if let Some(p) = get_str(&root, "prefixes", "targets")? {
            self.files.targets.prefix = p;
        }
        if let Some(p) = get_str(&root, "prefixes", "mappings")? {
            self.files.mappings.prefix = p;
        }

        if let Some(name) = get_str(&root, "service", "name")? {
            self.service.name = name;
        }
        if let Some(tool) = get_str(&root, "service", "fallback_tool")? {
            self.service.fallback_tool = tool;
        }
        if let Some(secs) = get_int(&root, "service", "settle_secs")? {
            self.service.settle = seconds(secs, "service.settle_secs")?;
        }

        if let Some(size) = get_int(&root, "transfer", "chunk_size")? {
            self.transfer.chunk_size = usize::try_from(size)
                .map_err(|_| ReconcileError::Config("chunk_size must not be negative".into()))?;
        }
        if let Some(dir) = get_str(&root, "transfer", "temp_dir")? {
            self.transfer.temp_dir = dir;
        }
        if let Some(suffix) = get_str(&root, "transfer", "backup_suffix")? {
            self.transfer.backup_suffix = suffix;
        }

        if let Some(prefix) = get_str(&root, "naming", "lun_prefix")? {
            self.naming.lun_prefix = prefix;
        }
        if let Some(marker) = get_str(&root, "naming", "marker")? {
            self.naming.marker = marker;
        }
        if let Some(token) = get_str(&root, "naming", "zombie_token")? {
            self.naming.zombie_token = token;
        }

        if let Some(mode) = get_str(&root, "safety", "zombie_match")? {
            self.naming.zombie_match = match mode.as_str() {
                "containment" => ZombieMatch::Containment,
                "exact" => ZombieMatch::Exact,
                other => {
                    return Err(ReconcileError::Config(format!(
                        "safety.zombie_match must be \"containment\" or \"exact\", got {:?}",
                        other
                    )))
                }
            };
        }
        if let Some(policy) = get_str(&root, "safety", "marker_policy")? {
            self.marker_policy = match policy.as_str() {
                "guarded" => MarkerPolicy::Guarded,
                "unconditional" => MarkerPolicy::Unconditional,
                other => {
                    return Err(ReconcileError::Config(format!(
                        "safety.marker_policy must be \"guarded\" or \"unconditional\", got {:?}",
                        other
                    )))
                }
            };
        }

        Ok(self)
    }

    /// Overlay connection parameters captured from the environment
    pub fn apply_env(mut self, env: &EnvSnapshot) -> Result<Self> {
        if let Some(host) = &env.host {
            self.host = Some(host.clone());
        }
        if let Some(user) = &env.user {
            self.username = Some(user.clone());
        }
        if let Some(password) = &env.password {
            self.secret = Some(password.clone());
        }
        if let Some(port) = &env.port {
            self.ssh_port = Some(parse_port(port)?);
        }
        if let Some(url) = &env.api_url {
            self.api_url = Some(url.clone());
        }
        Ok(self)
    }

    /// Validate and build the settings
    pub fn build(self) -> Result<Settings> {
        let host = self.host.unwrap_or_else(|| "192.168.5.8".to_string());
        if host.trim().is_empty() {
            return Err(ReconcileError::Config("appliance host must not be empty".into()));
        }

        let secret = self.secret.filter(|s| !s.is_empty()).ok_or_else(|| {
            ReconcileError::Config("SYNOLOGY_PASSWORD must be set".to_string())
        })?;
        let username = self.username.unwrap_or_else(|| "manager".to_string());

        let chunk = self.transfer.chunk_size;
        if chunk == 0 || chunk > MAX_CHUNK_SIZE {
            return Err(ReconcileError::Config(format!(
                "transfer.chunk_size must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, chunk
            )));
        }
        if self.transfer.backup_suffix.is_empty() {
            return Err(ReconcileError::Config(
                "transfer.backup_suffix must not be empty; it is the only recovery copy".into(),
            ));
        }
        for loc in [&self.files.luns, &self.files.targets, &self.files.mappings] {
            if loc.path.is_empty() || loc.prefix.is_empty() {
                return Err(ReconcileError::Config(format!(
                    "config file location incomplete: {:?}",
                    loc
                )));
            }
        }

        let api_url = self
            .api_url
            .unwrap_or_else(|| format!("http://{}:5000/webapi", host));

        Ok(Settings {
            ssh_port: self.ssh_port.unwrap_or(22),
            credentials: Credentials::new(username, secret),
            ssh_program: self.ssh_program.unwrap_or_else(|| "ssh".to_string()),
            ssh_password_auth: self.ssh_password_auth,
            command_timeout: self.command_timeout.unwrap_or(Duration::from_secs(60)),
            files: self.files,
            service: self.service,
            transfer: self.transfer,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_timeout: self.api_timeout.unwrap_or(Duration::from_secs(30)),
            kubectl: self.kubectl.unwrap_or_else(|| "kubectl".to_string()),
            webapi_tool: self
                .webapi_tool
                .unwrap_or_else(|| "/usr/local/bin/synoiscsiwebapi".to_string()),
            naming: self.naming,
            marker_policy: self.marker_policy,
            host,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with_password() -> EnvSnapshot {
        EnvSnapshot {
            password: Some("s3cret".to_string()),
            ..EnvSnapshot::default()
        }
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::builder().apply_env(&env_with_password()).unwrap().build().unwrap();
        assert_eq!(settings.host, "192.168.5.8");
        assert_eq!(settings.credentials.username, "manager");
        assert_eq!(settings.ssh_port, 22);
        assert_eq!(settings.transfer.chunk_size, 1000);
        assert_eq!(settings.api_url, "http://192.168.5.8:5000/webapi");
        assert_eq!(settings.marker_policy, MarkerPolicy::Guarded);
        assert_eq!(settings.webapi_tool, "/usr/local/bin/synoiscsiwebapi");
    }

    #[test]
    fn test_password_required() {
        let err = Settings::builder().build().unwrap_err();
        assert!(err.to_string().contains("SYNOLOGY_PASSWORD"));
    }

    #[test]
    fn test_env_overrides_toml() {
        let toml = r#"
            [appliance]
            host = "nas.lan"
            user = "admin"
            ssh_port = 2222

            [safety]
            zombie_match = "exact"
            marker_policy = "unconditional"
        "#;
        let env = EnvSnapshot {
            host: Some("10.0.0.9".to_string()),
            ..env_with_password()
        };
        let settings = Settings::builder()
            .apply_toml(toml)
            .unwrap()
            .apply_env(&env)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(settings.host, "10.0.0.9");
        assert_eq!(settings.credentials.username, "admin");
        assert_eq!(settings.ssh_port, 2222);
        assert_eq!(settings.naming.zombie_match, ZombieMatch::Exact);
        assert_eq!(settings.marker_policy, MarkerPolicy::Unconditional);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let err = Settings::builder().apply_toml("[transfer]\nchunk_size = \"big\"\n").unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn test_chunk_size_bounds() {
        let transfer = TransferSettings {
            chunk_size: MAX_CHUNK_SIZE + 1,
            ..TransferSettings::default()
        };
        let result = Settings::builder()
            .credentials("u", "p")
            .transfer(transfer)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_secret_not_in_debug() {
        let creds = Credentials::new("manager", "hunter2");
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("manager"));

        let builder = Settings::builder().credentials("manager", "hunter2");
        let shown = format!("{:?}", builder);
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("<redacted>"));
    }

    #[test]
    fn test_invalid_marker_policy_rejected() {
        match Settings::builder().apply_toml("[safety]\nmarker_policy = \"sometimes\"\n") {
            Err(ReconcileError::Config(msg)) => assert!(msg.contains("marker_policy")),
            other => panic!("expected config error, got {other:?}"),
        }
    }
}
