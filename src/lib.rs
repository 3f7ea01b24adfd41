//! Reconcile and repair iSCSI objects on a block-storage appliance
//!
//! The appliance keeps its LUNs, Targets and Mappings in block-structured
//! configuration files. This crate compares those objects with the volumes
//! an orchestrator reports in use, and removes or repairs what has drifted:
//!
//! - [`block`] parses the files and re-emits them byte-for-byte
//! - [`reconcile`] classifies objects and builds a removal [`Plan`]
//! - [`mutator`] applies a plan through a [`RemoteShell`] while the iSCSI
//!   service is stopped
//! - [`repair`] fixes Targets through the management API instead, and
//!   re-enables disabled Targets
//!
//! # Example
//!
//! ```no_run
//! use iscsi_reconcile::{
//!     block, objects, plan, classify, EnvSnapshot, FileInventory, MarkerPolicy, PruneScope,
//!     RemoteShell, SafeMutator, Settings, SshShell, VolumeInventory,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load(None, &EnvSnapshot::capture())?;
//! let shell = SshShell::new(&settings);
//! let files = &settings.files;
//!
//! let luns = objects::luns(&block::parse(&shell.read_file(&files.luns.path)?, &files.luns.prefix))?;
//! let targets = objects::targets(&block::parse(&shell.read_file(&files.targets.path)?, &files.targets.prefix))?;
//! let mappings = objects::mappings(&block::parse(&shell.read_file(&files.mappings.path)?, &files.mappings.prefix))?;
//! let volumes = FileInventory::new("pv.json").volumes()?;
//!
//! let classification = classify(&luns, &targets, &mappings, &volumes, &settings.naming);
//! let plan = plan(&classification, PruneScope::all(), &settings.naming, MarkerPolicy::Guarded)?;
//!
//! let mutator = SafeMutator::new(&shell, settings.service.clone(), settings.transfer.clone());
//! mutator.apply(&plan.file_edits(files))?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod block;
pub mod config;
pub mod error;
pub mod inventory;
pub mod mutator;
pub mod objects;
pub mod reconcile;
pub mod repair;
pub mod report;
pub mod transport;

pub use api::{ApiLun, ApiTarget, ApplianceApi, WebApiClient};
pub use block::{ConfigFile, Selector};
pub use config::{ApplianceFiles, ConfLocation, Credentials, EnvSnapshot, Settings};
pub use error::{ReconcileError, Result};
pub use inventory::{ExternalVolumeRecord, FileInventory, KubectlInventory, VolumeInventory, VolumePhase};
pub use mutator::{ApplyOutcome, FileEdit, SafeMutator};
pub use objects::{Lun, Mapping, ObjectKind, StorageObject, Target};
pub use reconcile::{
    classify, plan, plan_forced_target, Classification, MarkerPolicy, NamingRules, Plan, PruneScope,
};
pub use repair::{RepairOptions, RepairReport, Tallies, Tally};
pub use transport::{CommandOutput, RemoteShell, SshShell};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
