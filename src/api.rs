//! Appliance management API
//!
//! The RPC repair path talks to the appliance's HTTP management API instead
//! of editing files. Every response is wrapped in the same envelope:
//!
//! ```text
//! {"success": true,  "data": {...}}
//! {"success": false, "error": {"code": 18990710}}
//! ```
//!
//! A failed call becomes [`ReconcileError::Api`], or
//! [`ReconcileError::Conflict`] for the busy code.

use crate::config::Settings;
use crate::error::{ReconcileError, Result};
use crate::objects::StorageObject;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// `mapping_index` of a Target with no LUN attached
pub const UNMAPPED_INDEX: i64 = -1;

/// A Target as reported by the management API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiTarget {
    pub id: String,
    pub name: String,
    pub iqn: Option<String>,
    pub mapping_index: i64,
    pub mapped_lun_ids: Vec<String>,
}

impl ApiTarget {
    pub fn is_unmapped(&self) -> bool {
        self.mapping_index == UNMAPPED_INDEX
    }
}

impl StorageObject for ApiTarget {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> Vec<&str> {
        let mut labels = vec![self.name.as_str()];
        if let Some(iqn) = &self.iqn {
            labels.push(iqn);
        }
        labels
    }
}

/// A LUN as reported by the management API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiLun {
    pub id: String,
    pub name: String,
    pub uuid: Option<String>,
}

impl StorageObject for ApiLun {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Operations the repair path needs from the appliance
pub trait ApplianceApi {
    fn list_targets(&self) -> Result<Vec<ApiTarget>>;

    fn list_luns(&self) -> Result<Vec<ApiLun>>;

    fn create_target(&self, name: &str, iqn: Option<&str>, lun_id: &str) -> Result<()>;

    fn delete_target(&self, id: &str) -> Result<()>;

    /// Attach a LUN to an existing Target
    fn map_lun(&self, target_id: &str, lun_id: &str) -> Result<()>;

    fn delete_lun(&self, id: &str) -> Result<()>;
}

/// Ids arrive as numbers on some firmware and strings on others
#[derive(Deserialize)]
#[serde(untagged)]
enum IdValue {
    Number(i64),
    Text(String),
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Number(n) => write!(f, "{}", n),
            IdValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    data: Option<Value>,
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: i64,
}

#[derive(Deserialize)]
struct RawTarget {
    target_id: IdValue,
    name: String,
    iqn: Option<String>,
    #[serde(default = "unmapped")]
    mapping_index: i64,
    #[serde(default)]
    mapped_lun_list: Vec<RawMappedLun>,
}

fn unmapped() -> i64 {
    UNMAPPED_INDEX
}

#[derive(Deserialize)]
struct RawMappedLun {
    lun_id: IdValue,
}

#[derive(Deserialize)]
struct RawLun {
    lun_id: IdValue,
    name: String,
    uuid: Option<String>,
}

#[derive(Deserialize, Default)]
struct TargetList {
    #[serde(default)]
    targets: Vec<RawTarget>,
}

#[derive(Deserialize, Default)]
struct LunList {
    #[serde(default)]
    luns: Vec<RawLun>,
}

/// Unwrap a response envelope; `object` names what the call acted on
pub fn parse_envelope(object: &str, body: &str) -> Result<Option<Value>> {
    let envelope: Envelope = serde_json::from_str(body)?;
    if envelope.success {
        return Ok(envelope.data);
    }
    let code = envelope.error.map(|e| e.code).unwrap_or(0);
    Err(ReconcileError::from_api(object, code, body))
}

pub fn parse_targets(body: &str) -> Result<Vec<ApiTarget>> {
    let list: TargetList = match parse_envelope("target list", body)? {
        Some(data) => serde_json::from_value(data)?,
        None => TargetList::default(),
    };
    Ok(list
        .targets
        .into_iter()
        .map(|t| ApiTarget {
            id: t.target_id.to_string(),
            name: t.name,
            iqn: t.iqn.filter(|s| !s.is_empty()),
            mapping_index: t.mapping_index,
            mapped_lun_ids: t.mapped_lun_list.iter().map(|m| m.lun_id.to_string()).collect(),
        })
        .collect())
}

pub fn parse_luns(body: &str) -> Result<Vec<ApiLun>> {
    let list: LunList = match parse_envelope("LUN list", body)? {
        Some(data) => serde_json::from_value(data)?,
        None => LunList::default(),
    };
    Ok(list
        .luns
        .into_iter()
        .map(|l| ApiLun {
            id: l.lun_id.to_string(),
            name: l.name,
            uuid: l.uuid.filter(|s| !s.is_empty()),
        })
        .collect())
}

const TARGET_API: &str = "SYNO.Core.ISCSI.Target";
const LUN_API: &str = "SYNO.Core.ISCSI.LUN";

/// [`ApplianceApi`] over the appliance's `webapi` endpoints
pub struct WebApiClient {
    agent: ureq::Agent,
    base_url: String,
    sid: String,
}

impl WebApiClient {
    /// Log in and keep the session id for later calls
    pub fn login(settings: &Settings) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout(settings.api_timeout)
            .build();
        let base_url = settings.api_url.clone();
        let url = format!("{}/auth.cgi", base_url);

        log::info!("Logging in to {} as {}", base_url, settings.credentials.username);
        let form = [
            ("api", "SYNO.API.Auth"),
            ("version", "3"),
            ("method", "login"),
            ("account", settings.credentials.username.as_str()),
            ("passwd", settings.credentials.secret.as_str()),
            ("session", "Core"),
            ("format", "sid"),
        ];
        let body = read_body(&url, agent.post(&url).send_form(&form))?;

        let sid = parse_envelope("login", &body)?
            .and_then(|data| data.get("sid").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| ReconcileError::Transport("login response carries no sid".into()))?;

        Ok(WebApiClient {
            agent,
            base_url,
            sid,
        })
    }

    fn call(&self, params: &[(&str, &str)]) -> Result<String> {
        let url = format!("{}/entry.cgi", self.base_url);
        let mut form: Vec<(&str, &str)> = params.to_vec();
        form.push(("_sid", self.sid.as_str()));
        read_body(&url, self.agent.post(&url).send_form(&form))
    }

    fn act(&self, object: &str, params: &[(&str, &str)]) -> Result<()> {
        let body = self.call(params)?;
        parse_envelope(object, &body).map(|_| ())
    }
}

fn read_body(
    url: &str,
    response: std::result::Result<ureq::Response, ureq::Error>,
) -> Result<String> {
    match response {
        Ok(resp) => Ok(resp.into_string()?),
        Err(ureq::Error::Status(code, _)) => Err(ReconcileError::Transport(format!(
            "{} returned HTTP {}",
            url, code
        ))),
        Err(e) => Err(ReconcileError::Transport(format!("{}: {}", url, e))),
    }
}

impl ApplianceApi for WebApiClient {
    fn list_targets(&self) -> Result<Vec<ApiTarget>> {
        let body = self.call(&[("api", TARGET_API), ("version", "1"), ("method", "list")])?;
        parse_targets(&body)
    }

    fn list_luns(&self) -> Result<Vec<ApiLun>> {
        let body = self.call(&[("api", LUN_API), ("version", "1"), ("method", "list")])?;
        parse_luns(&body)
    }

    fn create_target(&self, name: &str, iqn: Option<&str>, lun_id: &str) -> Result<()> {
        let lun_list = format!("[{}]", lun_id);
        let mut params = vec![
            ("api", TARGET_API),
            ("version", "1"),
            ("method", "create"),
            ("name", name),
            ("auth_type", "0"),
            ("max_sessions", "1"),
            ("lun_id_list", lun_list.as_str()),
        ];
        if let Some(iqn) = iqn {
            params.push(("iqn", iqn));
        }
        self.act(&format!("target {}", name), &params)
    }

    fn delete_target(&self, id: &str) -> Result<()> {
        self.act(
            &format!("target {}", id),
            &[("api", TARGET_API), ("version", "1"), ("method", "delete"), ("target_id", id)],
        )
    }

    fn map_lun(&self, target_id: &str, lun_id: &str) -> Result<()> {
        let lun_list = format!("[{}]", lun_id);
        self.act(
            &format!("target {}", target_id),
            &[
                ("api", TARGET_API),
                ("version", "1"),
                ("method", "set"),
                ("target_id", target_id),
                ("lun_id_list", lun_list.as_str()),
            ],
        )
    }

    fn delete_lun(&self, id: &str) -> Result<()> {
        self.act(
            &format!("LUN {}", id),
            &[("api", LUN_API), ("version", "1"), ("method", "delete"), ("lun_id", id)],
        )
    }
}
