//! Orchestrator volume inventory
//!
//! The orchestrator (Kubernetes) is the authority on which volumes are in
//! use. It is consumed read-only as a list of [`ExternalVolumeRecord`]s, in
//! the shape produced by `kubectl get pv -o json`.

use crate::error::{ReconcileError, Result};
use crate::transport::run_with_timeout;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

/// Lifecycle phase of an external volume
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VolumePhase {
    Bound,
    Released,
    Available,
    Pending,
    Failed,
    Other(String),
}

impl VolumePhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Bound" => VolumePhase::Bound,
            "Released" => VolumePhase::Released,
            "Available" => VolumePhase::Available,
            "Pending" => VolumePhase::Pending,
            "Failed" => VolumePhase::Failed,
            other => VolumePhase::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            VolumePhase::Bound => "Bound",
            VolumePhase::Released => "Released",
            VolumePhase::Available => "Available",
            VolumePhase::Pending => "Pending",
            VolumePhase::Failed => "Failed",
            VolumePhase::Other(s) => s,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, VolumePhase::Bound)
    }
}

/// One volume as seen by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalVolumeRecord {
    pub name: String,
    pub phase: VolumePhase,
    pub namespace: Option<String>,
    pub claim: Option<String>,
    /// Driver-specific handle (`spec.csi.volumeHandle`)
    pub volume_handle: Option<String>,
}

impl ExternalVolumeRecord {
    pub fn new(name: impl Into<String>, phase: VolumePhase) -> Self {
        Self {
            name: name.into(),
            phase,
            namespace: None,
            claim: None,
            volume_handle: None,
        }
    }

    /// `namespace/claim` when both are known
    pub fn claim_ref(&self) -> Option<String> {
        match (&self.namespace, &self.claim) {
            (Some(ns), Some(claim)) => Some(format!("{}/{}", ns, claim)),
            _ => None,
        }
    }
}

/// Source of external volume records
pub trait VolumeInventory {
    fn volumes(&self) -> Result<Vec<ExternalVolumeRecord>>;
}

#[derive(Deserialize)]
struct PvList {
    #[serde(default)]
    items: Vec<PvItem>,
}

#[derive(Deserialize)]
struct PvItem {
    metadata: PvMetadata,
    #[serde(default)]
    spec: PvSpec,
    #[serde(default)]
    status: PvStatus,
}

#[derive(Deserialize)]
struct PvMetadata {
    name: String,
}

#[derive(Deserialize, Default)]
struct PvSpec {
    #[serde(rename = "claimRef")]
    claim_ref: Option<ClaimRef>,
    csi: Option<CsiSource>,
}

#[derive(Deserialize)]
struct ClaimRef {
    namespace: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct CsiSource {
    #[serde(rename = "volumeHandle")]
    volume_handle: Option<String>,
}

#[derive(Deserialize, Default)]
struct PvStatus {
    phase: Option<String>,
}

/// Parse the JSON document printed by `kubectl get pv -o json`
pub fn parse_pv_list(json: &str) -> Result<Vec<ExternalVolumeRecord>> {
    let list: PvList = serde_json::from_str(json)?;

    Ok(list
        .items
        .into_iter()
        .map(|item| {
            let (namespace, claim) = match item.spec.claim_ref {
                Some(c) => (c.namespace, c.name),
                None => (None, None),
            };
            ExternalVolumeRecord {
                name: item.metadata.name,
                phase: VolumePhase::parse(item.status.phase.as_deref().unwrap_or("")),
                namespace,
                claim,
                volume_handle: item.spec.csi.and_then(|c| c.volume_handle),
            }
        })
        .collect())
}

/// Inventory backed by the `kubectl` binary
#[derive(Debug, Clone)]
pub struct KubectlInventory {
    program: String,
    timeout: Duration,
}

impl KubectlInventory {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl VolumeInventory for KubectlInventory {
    fn volumes(&self) -> Result<Vec<ExternalVolumeRecord>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["get", "pv", "-o", "json"]);

        let output = run_with_timeout(cmd, None, self.timeout)
            .map_err(|e| ReconcileError::Transport(format!("{} get pv: {}", self.program, e)))?;
        if !output.success() {
            return Err(ReconcileError::Transport(format!(
                "{} get pv exited with status {}: {}",
                self.program,
                output.status,
                output.stderr.trim()
            )));
        }

        let records = parse_pv_list(&output.stdout)?;
        log::info!("Loaded {} volumes from {}", records.len(), self.program);
        Ok(records)
    }
}

/// Inventory read from a saved `kubectl get pv -o json` document
#[derive(Debug, Clone)]
pub struct FileInventory {
    path: PathBuf,
}

impl FileInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl VolumeInventory for FileInventory {
    fn volumes(&self) -> Result<Vec<ExternalVolumeRecord>> {
        let json = std::fs::read_to_string(&self.path)?;
        let records = parse_pv_list(&json)?;
        log::info!("Loaded {} volumes from {}", records.len(), self.path.display());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PV_JSON: &str = r#"{
        "items": [
            {
                "metadata": {"name": "pvc-1111"},
                "spec": {
                    "claimRef": {"namespace": "media", "name": "data"},
                    "csi": {"driver": "csi.san.synology.com", "volumeHandle": "6f1c-aa"}
                },
                "status": {"phase": "Bound"}
            },
            {
                "metadata": {"name": "pvc-2222"},
                "spec": {},
                "status": {"phase": "Released"}
            },
            {
                "metadata": {"name": "pvc-3333"},
                "status": {"phase": "Terminating"}
            }
        ]
    }"#;

    #[test]
    fn test_parse_pv_list() {
        let records = parse_pv_list(PV_JSON).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].phase, VolumePhase::Bound);
        assert_eq!(records[0].claim_ref().as_deref(), Some("media/data"));
        assert_eq!(records[0].volume_handle.as_deref(), Some("6f1c-aa"));
        assert_eq!(records[1].phase, VolumePhase::Released);
        assert_eq!(records[1].claim_ref(), None);
        assert_eq!(records[2].phase, VolumePhase::Other("Terminating".to_string()));
    }

    #[test]
    fn test_parse_empty_list() {
        assert!(parse_pv_list("{}").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(matches!(parse_pv_list("not json"), Err(ReconcileError::Json(_))));
    }
}
