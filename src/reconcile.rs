//! Reconciliation of appliance objects against the external volume inventory
//!
//! Everything here is pure computation over already-loaded inputs so it can
//! be exercised without a remote shell or an orchestrator.
//!
//! Two independent rules decide what may be removed:
//!
//! - identifier reconciliation: a LUN name is `<lun_prefix><external-id>`;
//!   the stripped id is looked up by exact string equality.
//! - the known-bad marker rule ([`is_known_bad`]): transient recovery
//!   objects are recognised by a literal substring of their name or iqn.
//!
//! Whatever rule nominates a candidate, [`plan`] runs the Bound-safety gate
//! over it before it reaches the removal set.

use crate::block::Selector;
use crate::config::ApplianceFiles;
use crate::error::{ReconcileError, Result};
use crate::inventory::{ExternalVolumeRecord, VolumePhase};
use crate::mutator::FileEdit;
use crate::objects::{Lun, Mapping, ObjectKind, StorageObject, Target, MAPPING_LUN_KEYS};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// How zombie detection compares a Target iqn with external ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZombieMatch {
    /// Some external id occurs anywhere inside the iqn
    #[default]
    Containment,
    /// The `<token><id>` run extracted from the iqn equals an external id
    Exact,
}

/// Whether the marker rule is subject to the Bound-safety gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkerPolicy {
    /// Marker matches whose id resolves to a Bound volume are kept
    #[default]
    Guarded,
    /// Marker matches are removed regardless of inventory state
    Unconditional,
}

/// Naming conventions of the volume provisioner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingRules {
    /// Prefix the provisioner puts in front of the external id (`k8s-csi-`)
    pub lun_prefix: String,
    /// Substring that marks transient recovery objects (`recovery`)
    pub marker: String,
    /// Token that introduces an external id inside a Target iqn (`pvc-`)
    pub zombie_token: String,
    pub zombie_match: ZombieMatch,
}

impl Default for NamingRules {
    fn default() -> Self {
        NamingRules {
            lun_prefix: "k8s-csi-".to_string(),
            marker: "recovery".to_string(),
            zombie_token: "pvc-".to_string(),
            zombie_match: ZombieMatch::Containment,
        }
    }
}

impl NamingRules {
    /// External id embedded in an object name
    pub fn external_id<'a>(&self, name: &'a str) -> &'a str {
        name.strip_prefix(self.lun_prefix.as_str()).unwrap_or(name)
    }

    pub fn is_provisioned(&self, name: &str) -> bool {
        name.starts_with(self.lun_prefix.as_str())
    }

    /// `<token><id>` run inside an iqn, if any
    pub fn embedded_id<'a>(&self, iqn: &'a str) -> Option<&'a str> {
        let start = iqn.find(self.zombie_token.as_str())?;
        let rest = &iqn[start..];
        let end = rest[self.zombie_token.len()..]
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
            .map(|i| i + self.zombie_token.len())
            .unwrap_or(rest.len());
        Some(&rest[..end])
    }
}

/// Known-bad pattern rule: the object is a transient recovery leftover.
///
/// This is a literal substring match on the object's labels and is
/// independent of the inventory.
pub fn is_known_bad(object: &dyn StorageObject, marker: &str) -> bool {
    !marker.is_empty() && object.labels().iter().any(|label| label.contains(marker))
}

/// A LUN together with the inventory record it resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunVerdict {
    pub lun: Lun,
    pub external_id: String,
    pub record: Option<ExternalVolumeRecord>,
}

impl LunVerdict {
    pub fn phase(&self) -> Option<&VolumePhase> {
        self.record.as_ref().map(|r| &r.phase)
    }
}

/// Outcome of [`classify`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub bound: Vec<LunVerdict>,
    pub released: Vec<LunVerdict>,
    pub orphaned: Vec<LunVerdict>,
    /// Targets whose name matches no LUN name
    pub unmapped_targets: Vec<Target>,
    pub zombie_targets: Vec<Target>,
    pub known_bad_luns: Vec<Lun>,
    pub known_bad_targets: Vec<Target>,
    /// LUNs no Mapping entry references
    pub unreferenced_luns: Vec<Lun>,
    /// Targets no Mapping entry references
    pub unreferenced_targets: Vec<Target>,
    pub disabled_targets: Vec<Target>,
    pub integrity_errors: Vec<String>,
    pub targets: Vec<Target>,
    pub mappings: Vec<Mapping>,
    bound_ids: BTreeSet<String>,
    duplicate_ids: BTreeSet<String>,
    inventory_size: usize,
    /// LUNs and Targets carrying the provisioning prefix
    provisioned: usize,
}

impl Classification {
    pub fn lun_count(&self) -> usize {
        self.bound.len() + self.released.len() + self.orphaned.len()
    }

    /// External ids that resolved to a Bound volume
    pub fn bound_ids(&self) -> &BTreeSet<String> {
        &self.bound_ids
    }

    pub fn has_integrity_errors(&self) -> bool {
        !self.integrity_errors.is_empty()
    }
}

/// Names of the volumes currently in use
pub fn bound_ids(external: &[ExternalVolumeRecord]) -> BTreeSet<String> {
    external
        .iter()
        .filter(|r| r.phase.is_bound())
        .map(|r| r.name.clone())
        .collect()
}

/// Classify every LUN and Target against the external inventory.
pub fn classify(
    luns: &[Lun],
    targets: &[Target],
    mappings: &[Mapping],
    external: &[ExternalVolumeRecord],
    rules: &NamingRules,
) -> Classification {
    let mut out = Classification {
        targets: targets.to_vec(),
        mappings: mappings.to_vec(),
        ..Classification::default()
    };

    let external_by_id: HashMap<&str, &ExternalVolumeRecord> =
        external.iter().map(|r| (r.name.as_str(), r)).collect();
    out.bound_ids = bound_ids(external);
    out.inventory_size = external.len();
    out.provisioned = luns.iter().filter(|l| rules.is_provisioned(&l.name)).count()
        + targets.iter().filter(|t| rules.is_provisioned(&t.name)).count();

    let mut mapped_lun_ids: HashSet<&str> = HashSet::new();
    let mut mapped_target_ids: HashSet<&str> = HashSet::new();
    for m in mappings {
        mapped_target_ids.extend(m.tid.as_deref());
        mapped_target_ids.extend(m.target_iqn.as_deref());
        mapped_lun_ids.extend(m.lun_uuid.as_deref());
        mapped_lun_ids.extend(m.lun_id.as_deref());
    }

    let mut seen: HashMap<&str, &str> = HashMap::new();
    for lun in luns {
        let id = rules.external_id(&lun.name);
        if let Some(first) = seen.insert(id, lun.uuid.as_str()) {
            out.integrity_errors.push(format!(
                "external id {} is claimed by LUNs {} and {}",
                id, first, lun.uuid
            ));
            out.duplicate_ids.insert(id.to_string());
        }

        let record = external_by_id.get(id).map(|r| (*r).clone());
        let verdict = LunVerdict {
            lun: lun.clone(),
            external_id: id.to_string(),
            record,
        };
        match verdict.phase().map(VolumePhase::is_bound) {
            Some(true) => out.bound.push(verdict),
            Some(false) => out.released.push(verdict),
            None => out.orphaned.push(verdict),
        }

        let referenced = mapped_lun_ids.contains(lun.uuid.as_str())
            || lun.lun_id.as_deref().map(|id| mapped_lun_ids.contains(id)).unwrap_or(false);
        if !referenced {
            out.unreferenced_luns.push(lun.clone());
        }
        if is_known_bad(lun, &rules.marker) {
            out.known_bad_luns.push(lun.clone());
        }
    }

    let lun_names: HashSet<&str> = luns.iter().map(|l| l.name.as_str()).collect();
    let known_ids: Vec<&str> = external
        .iter()
        .flat_map(|r| std::iter::once(r.name.as_str()).chain(r.volume_handle.as_deref()))
        .filter(|id| !id.is_empty())
        .collect();

    for target in targets {
        if !lun_names.contains(target.name.as_str()) {
            out.unmapped_targets.push(target.clone());
        }

        let referenced = mapped_target_ids.contains(target.tid.as_str())
            || target.iqn.as_deref().map(|iqn| mapped_target_ids.contains(iqn)).unwrap_or(false);
        if !referenced {
            out.unreferenced_targets.push(target.clone());
        }

        if is_zombie(target, &known_ids, rules) {
            out.zombie_targets.push(target.clone());
        }
        if is_known_bad(target, &rules.marker) {
            out.known_bad_targets.push(target.clone());
        }
        if target.enabled == Some(false) {
            out.disabled_targets.push(target.clone());
        }
    }

    for err in &out.integrity_errors {
        log::error!("Data integrity: {}", err);
    }

    out
}

/// A Target is a zombie when its iqn carries an external id that no
/// currently known volume accounts for.
fn is_zombie(target: &Target, known_ids: &[&str], rules: &NamingRules) -> bool {
    let iqn = match target.iqn.as_deref() {
        Some(iqn) if iqn.contains(rules.zombie_token.as_str()) => iqn,
        _ => return false,
    };

    match rules.zombie_match {
        ZombieMatch::Containment => !known_ids.iter().any(|id| iqn.contains(id)),
        ZombieMatch::Exact => match rules.embedded_id(iqn) {
            Some(embedded) => !known_ids.iter().any(|id| *id == embedded),
            None => false,
        },
    }
}

/// Categories a plan may remove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PruneScope {
    pub orphans: bool,
    pub zombies: bool,
    pub markers: bool,
    pub unreferenced: bool,
}

impl PruneScope {
    pub fn all() -> Self {
        PruneScope {
            orphans: true,
            zombies: true,
            markers: true,
            unreferenced: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.orphans || self.zombies || self.markers || self.unreferenced)
    }
}

/// Why an object is in the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reason {
    Orphaned,
    OrphanTarget,
    Zombie,
    KnownBad,
    Unreferenced,
    /// Named by the operator
    Forced,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Orphaned => "orphaned",
            Reason::OrphanTarget => "orphan-target",
            Reason::Zombie => "zombie",
            Reason::KnownBad => "known-bad",
            Reason::Unreferenced => "unreferenced",
            Reason::Forced => "forced",
        }
    }
}

/// One object selected for removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub id: String,
    pub name: String,
    pub reason: Reason,
}

/// A candidate the safety gate refused to remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protected {
    pub kind: ObjectKind,
    pub id: String,
    pub name: String,
    pub reason: Reason,
    pub detail: String,
}

/// Objects to remove from the appliance configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Keyed by LUN uuid
    pub luns: BTreeMap<String, Removal>,
    /// Keyed by Target tid
    pub targets: BTreeMap<String, Removal>,
    /// Headers of Mapping blocks that reference removed objects
    pub mappings: Vec<String>,
    pub protected: Vec<Protected>,
    target_iqns: BTreeSet<String>,
    /// `lun_id`s of removed LUNs that carry one
    lun_ids: BTreeSet<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.luns.is_empty() && self.targets.is_empty()
    }

    /// Number of planned removals of one kind
    pub fn count(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::Target => self.targets.len(),
            ObjectKind::Lun => self.luns.len(),
            ObjectKind::Mapping => self.mappings.len(),
        }
    }

    fn mapping_selectors(&self) -> Vec<Selector> {
        let mut selectors = vec![
            Selector::new("tid", self.targets.keys().cloned()),
            Selector::new("target_iqn", self.target_iqns.iter().cloned()),
            Selector::new("lun_id", self.lun_ids.iter().cloned()),
        ];
        for key in MAPPING_LUN_KEYS {
            selectors.push(Selector::new(key, self.luns.keys().cloned()));
        }
        selectors.retain(|s| !s.is_empty());
        selectors
    }

    fn references(&self, mapping: &Mapping) -> bool {
        mapping.tid.as_ref().map(|t| self.targets.contains_key(t)).unwrap_or(false)
            || mapping
                .target_iqn
                .as_ref()
                .map(|i| self.target_iqns.contains(i))
                .unwrap_or(false)
            || mapping
                .lun_uuid
                .as_ref()
                .map(|u| self.luns.contains_key(u))
                .unwrap_or(false)
            || mapping
                .lun_id
                .as_ref()
                .map(|id| self.lun_ids.contains(id))
                .unwrap_or(false)
    }

    /// Per-file edits for the safe mutator; files with nothing to remove
    /// are left out.
    pub fn file_edits(&self, files: &ApplianceFiles) -> Vec<FileEdit> {
        let mut edits = Vec::new();
        if !self.targets.is_empty() {
            edits.push(FileEdit {
                kind: ObjectKind::Target,
                location: files.targets.clone(),
                selectors: vec![Selector::new("tid", self.targets.keys().cloned())],
                expected: self.targets.len(),
            });
        }
        if !self.luns.is_empty() {
            edits.push(FileEdit {
                kind: ObjectKind::Lun,
                location: files.luns.clone(),
                selectors: vec![Selector::new("uuid", self.luns.keys().cloned())],
                expected: self.luns.len(),
            });
        }
        if !self.mappings.is_empty() {
            edits.push(FileEdit {
                kind: ObjectKind::Mapping,
                location: files.mappings.clone(),
                selectors: self.mapping_selectors(),
                expected: self.mappings.len(),
            });
        }
        edits
    }
}

/// Why an object named `name` (with optional `iqn`) belongs to a Bound
/// volume, if it does
pub fn bound_conflict(
    rules: &NamingRules,
    bound: &BTreeSet<String>,
    name: &str,
    iqn: Option<&str>,
) -> Option<String> {
    let id = rules.external_id(name);
    if bound.contains(id) {
        return Some(format!("external id {} is Bound", id));
    }
    let iqn = iqn?;
    bound
        .iter()
        .find(|b| iqn.contains(b.as_str()))
        .map(|hit| format!("iqn references Bound volume {}", hit))
}

/// Refuse to plan against an inventory that cannot tell live volumes apart.
///
/// An empty inventory, or one without a single Bound volume while the
/// appliance holds provisioned objects, would make everything look orphaned.
fn check_inventory(classification: &Classification) -> Result<()> {
    if classification.inventory_size == 0 {
        return Err(ReconcileError::Integrity(
            "volume inventory is empty; refusing to plan removals".into(),
        ));
    }
    if classification.bound_ids.is_empty() && classification.provisioned > 0 {
        return Err(ReconcileError::Integrity(format!(
            "volume inventory lists {} volumes but none is Bound while the appliance holds {} \
             provisioned objects; refusing to plan removals",
            classification.inventory_size, classification.provisioned
        )));
    }
    Ok(())
}

/// Collects removals, running every candidate through the safety gate
struct Planner<'a> {
    rules: &'a NamingRules,
    bound: &'a BTreeSet<String>,
    duplicates: &'a BTreeSet<String>,
    plan: Plan,
}

impl<'a> Planner<'a> {
    fn new(classification: &'a Classification, rules: &'a NamingRules) -> Self {
        Planner {
            rules,
            bound: &classification.bound_ids,
            duplicates: &classification.duplicate_ids,
            plan: Plan::default(),
        }
    }

    /// Reason an object must be kept, if any
    fn veto(&self, name: &str, iqn: Option<&str>) -> Option<String> {
        if let Some(detail) = bound_conflict(self.rules, self.bound, name, iqn) {
            return Some(detail);
        }
        let id = self.rules.external_id(name);
        if self.duplicates.contains(id) {
            return Some(format!("external id {} is claimed by several LUNs", id));
        }
        None
    }

    fn lun(&mut self, lun: &Lun, reason: Reason, gated: bool) {
        if self.plan.luns.contains_key(&lun.uuid) {
            return;
        }
        match self.veto(&lun.name, None) {
            Some(detail) if gated => {
                log::warn!("Keeping LUN {} ({}): {}", lun.name, lun.uuid, detail);
                self.plan.protected.push(Protected {
                    kind: ObjectKind::Lun,
                    id: lun.uuid.clone(),
                    name: lun.name.clone(),
                    reason,
                    detail,
                });
            }
            veto => {
                if let Some(detail) = veto {
                    log::warn!(
                        "Removing LUN {} ({}) unconditionally despite: {}",
                        lun.name,
                        lun.uuid,
                        detail
                    );
                }
                if let Some(id) = &lun.lun_id {
                    self.plan.lun_ids.insert(id.clone());
                }
                self.plan.luns.insert(
                    lun.uuid.clone(),
                    Removal {
                        id: lun.uuid.clone(),
                        name: lun.name.clone(),
                        reason,
                    },
                );
            }
        }
    }

    fn target(&mut self, target: &Target, reason: Reason, gated: bool) {
        if self.plan.targets.contains_key(&target.tid) {
            return;
        }
        match self.veto(&target.name, target.iqn.as_deref()) {
            Some(detail) if gated => {
                log::warn!("Keeping Target {} (tid={}): {}", target.name, target.tid, detail);
                self.plan.protected.push(Protected {
                    kind: ObjectKind::Target,
                    id: target.tid.clone(),
                    name: target.name.clone(),
                    reason,
                    detail,
                });
            }
            veto => {
                if let Some(detail) = veto {
                    log::warn!(
                        "Removing Target {} (tid={}) unconditionally despite: {}",
                        target.name,
                        target.tid,
                        detail
                    );
                }
                if let Some(iqn) = &target.iqn {
                    self.plan.target_iqns.insert(iqn.clone());
                }
                self.plan.targets.insert(
                    target.tid.clone(),
                    Removal {
                        id: target.tid.clone(),
                        name: target.name.clone(),
                        reason,
                    },
                );
            }
        }
    }

    /// Add the Mappings that reference removed objects
    fn finish(self, classification: &Classification) -> Plan {
        let mut plan = self.plan;
        plan.mappings = classification
            .mappings
            .iter()
            .filter(|m| plan.references(m))
            .map(|m| m.header.clone())
            .collect();

        log::info!(
            "Plan: {} LUNs, {} Targets, {} Mappings to remove; {} protected",
            plan.luns.len(),
            plan.targets.len(),
            plan.mappings.len(),
            plan.protected.len()
        );
        plan
    }
}

/// Build the removal plan for `scope`.
///
/// No object whose external id resolves to a Bound volume is ever placed in
/// the plan, except marker matches under [`MarkerPolicy::Unconditional`].
/// Fails with [`ReconcileError::Integrity`] when the inventory cannot
/// distinguish live volumes.
pub fn plan(
    classification: &Classification,
    scope: PruneScope,
    rules: &NamingRules,
    marker_policy: MarkerPolicy,
) -> Result<Plan> {
    check_inventory(classification)?;
    let mut planner = Planner::new(classification, rules);

    if scope.markers {
        let gated = marker_policy == MarkerPolicy::Guarded;
        for lun in &classification.known_bad_luns {
            planner.lun(lun, Reason::KnownBad, gated);
        }
        for target in &classification.known_bad_targets {
            planner.target(target, Reason::KnownBad, gated);
        }
    }

    if scope.orphans {
        for verdict in &classification.orphaned {
            planner.lun(&verdict.lun, Reason::Orphaned, true);
        }
        for target in &classification.unmapped_targets {
            if rules.is_provisioned(&target.name) {
                planner.target(target, Reason::OrphanTarget, true);
            }
        }
    }

    if scope.zombies {
        for target in &classification.zombie_targets {
            planner.target(target, Reason::Zombie, true);
        }
    }

    if scope.unreferenced {
        for lun in &classification.unreferenced_luns {
            planner.lun(lun, Reason::Unreferenced, true);
        }
        for target in &classification.unreferenced_targets {
            planner.target(target, Reason::Unreferenced, true);
        }
    }

    if scope.orphans {
        let orphan_names: Vec<&str> = classification
            .orphaned
            .iter()
            .filter(|v| planner.plan.luns.contains_key(&v.lun.uuid))
            .map(|v| v.lun.name.as_str())
            .collect();
        // Targets named after an orphaned LUN go with it
        for name in orphan_names {
            for target in classification.targets.iter().filter(|t| t.name == name) {
                planner.target(target, Reason::OrphanTarget, true);
            }
        }
    }

    Ok(planner.finish(classification))
}

/// Plan the removal of the Targets whose name or iqn contains `pattern`.
///
/// Used for stuck Targets the management API refuses to delete. The
/// Bound-safety gate still applies; a pattern that matches nothing is an
/// error.
pub fn plan_forced_target(
    classification: &Classification,
    pattern: &str,
    rules: &NamingRules,
) -> Result<Plan> {
    if pattern.trim().is_empty() {
        return Err(ReconcileError::Config("target pattern must not be empty".into()));
    }
    check_inventory(classification)?;

    let matches: Vec<&Target> = classification
        .targets
        .iter()
        .filter(|t| t.labels().iter().any(|label| label.contains(pattern)))
        .collect();
    if matches.is_empty() {
        return Err(ReconcileError::Integrity(format!(
            "no Target name or iqn contains {:?}",
            pattern
        )));
    }

    let mut planner = Planner::new(classification, rules);
    for target in matches {
        planner.target(target, Reason::Forced, true);
    }
    Ok(planner.finish(classification))
}
