//! Typed storage objects extracted from parsed configuration blocks

use crate::block::{Block, ConfigFile};
use crate::error::{ReconcileError, Result};

/// Keys under which a Mapping block may reference its LUN
pub const MAPPING_LUN_KEYS: [&str; 2] = ["lun_uuid", "uuid"];

/// A LUN entry from the LUN configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lun {
    pub uuid: String,
    pub name: String,
    pub lun_id: Option<String>,
    pub size_bytes: Option<u64>,
    pub enabled: Option<bool>,
    pub header: String,
}

/// A Target entry from the target configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub tid: String,
    pub name: String,
    pub iqn: Option<String>,
    pub enabled: Option<bool>,
    pub header: String,
}

/// A Target ↔ LUN wiring entry from the mapping configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub tid: Option<String>,
    pub target_iqn: Option<String>,
    pub lun_uuid: Option<String>,
    pub lun_id: Option<String>,
    pub header: String,
}

/// Category of appliance object, used to group results and counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Target,
    Lun,
    Mapping,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Target => "Target",
            ObjectKind::Lun => "LUN",
            ObjectKind::Mapping => "Mapping",
        }
    }
}

/// Anything the known-bad marker rule can inspect
pub trait StorageObject {
    /// Stable identifier (`uuid` for LUNs, `tid` for Targets)
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Every human-readable label the object carries
    fn labels(&self) -> Vec<&str> {
        vec![self.name()]
    }
}

impl StorageObject for Lun {
    fn id(&self) -> &str {
        &self.uuid
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl StorageObject for Target {
    fn id(&self) -> &str {
        &self.tid
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

fn required<'a>(block: &'a Block, key: &str, kind: &str) -> Result<&'a str> {
    block
        .get(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ReconcileError::Parse(format!(
                "{} block [{}] has no `{}` field",
                kind, block.header, key
            ))
        })
}

fn parse_enabled(block: &Block) -> Option<bool> {
    match block.get("enabled")? {
        "yes" | "true" | "1" => Some(true),
        "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

impl Lun {
    pub fn from_block(block: &Block) -> Result<Self> {
        Ok(Lun {
            uuid: required(block, "uuid", "LUN")?.to_string(),
            name: required(block, "name", "LUN")?.to_string(),
            lun_id: block.get("lun_id").map(str::to_string),
            size_bytes: block.get("size").and_then(|s| s.parse().ok()),
            enabled: parse_enabled(block),
            header: block.header.clone(),
        })
    }

    /// Size in GiB for reports
    pub fn size_gib(&self) -> f64 {
        self.size_bytes
            .map(|b| b as f64 / (1024.0 * 1024.0 * 1024.0))
            .unwrap_or(0.0)
    }
}

impl Target {
    pub fn from_block(block: &Block) -> Result<Self> {
        Ok(Target {
            tid: required(block, "tid", "Target")?.to_string(),
            name: required(block, "name", "Target")?.to_string(),
            iqn: block.get("iqn").map(str::to_string),
            enabled: parse_enabled(block),
            header: block.header.clone(),
        })
    }
}

impl Mapping {
    pub fn from_block(block: &Block) -> Result<Self> {
        let mapping = Mapping {
            tid: block.get("tid").map(str::to_string),
            target_iqn: block.get("target_iqn").map(str::to_string),
            lun_uuid: block.get_any(&MAPPING_LUN_KEYS).map(str::to_string),
            lun_id: block.get("lun_id").map(str::to_string),
            header: block.header.clone(),
        };

        if mapping.tid.is_none() && mapping.target_iqn.is_none() {
            return Err(ReconcileError::Parse(format!(
                "Mapping block [{}] references no target (tid/target_iqn)",
                block.header
            )));
        }
        if mapping.lun_uuid.is_none() && mapping.lun_id.is_none() {
            return Err(ReconcileError::Parse(format!(
                "Mapping block [{}] references no LUN (lun_uuid/uuid/lun_id)",
                block.header
            )));
        }
        Ok(mapping)
    }
}

/// Extract every LUN; any block lacking `uuid` or `name` is fatal
pub fn luns(file: &ConfigFile) -> Result<Vec<Lun>> {
    file.blocks.iter().map(Lun::from_block).collect()
}

pub fn targets(file: &ConfigFile) -> Result<Vec<Target>> {
    file.blocks.iter().map(Target::from_block).collect()
}

pub fn mappings(file: &ConfigFile) -> Result<Vec<Mapping>> {
    file.blocks.iter().map(Mapping::from_block).collect()
}
