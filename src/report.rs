//! Operator-facing text output
//!
//! Everything here renders to a `String`; the binary decides where it goes.

use crate::mutator::ApplyOutcome;
use crate::objects::ObjectKind;
use crate::reconcile::{Classification, LunVerdict, Plan};
use crate::repair::{RepairReport, Tallies, Tally};
use std::fmt::Write;

fn verdict_row(out: &mut String, state: &str, v: &LunVerdict) {
    let claim = v
        .record
        .as_ref()
        .and_then(|r| r.claim_ref())
        .unwrap_or_else(|| "-".to_string());
    let _ = writeln!(
        out,
        "  {:<9} {:<48} {:>8.1} GiB  {}",
        state,
        v.lun.name,
        v.lun.size_gib(),
        claim
    );
}

/// Full audit of one appliance
pub fn audit_table(c: &Classification) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "LUNs ({}):", c.lun_count());
    for v in &c.bound {
        verdict_row(&mut out, "BOUND", v);
    }
    for v in &c.released {
        let phase = v.phase().map(|p| p.as_str()).unwrap_or("?");
        verdict_row(&mut out, &phase.to_uppercase(), v);
    }
    for v in &c.orphaned {
        verdict_row(&mut out, "ORPHANED", v);
    }

    let sections = [
        ("Targets without a LUN of the same name", &c.unmapped_targets),
        ("Zombie Targets", &c.zombie_targets),
        ("Known-bad Targets", &c.known_bad_targets),
        ("Targets without a mapping", &c.unreferenced_targets),
        ("Disabled Targets", &c.disabled_targets),
    ];
    for (title, targets) in sections {
        if targets.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{} ({}):", title, targets.len());
        for t in targets.iter() {
            let _ = writeln!(
                out,
                "  tid={:<5} {:<48} {}",
                t.tid,
                t.name,
                t.iqn.as_deref().unwrap_or("-")
            );
        }
    }

    if !c.known_bad_luns.is_empty() {
        let _ = writeln!(out, "Known-bad LUNs ({}):", c.known_bad_luns.len());
        for l in &c.known_bad_luns {
            let _ = writeln!(out, "  {} ({})", l.name, l.uuid);
        }
    }
    if !c.unreferenced_luns.is_empty() {
        let _ = writeln!(out, "LUNs without a mapping ({}):", c.unreferenced_luns.len());
        for l in &c.unreferenced_luns {
            let _ = writeln!(out, "  {} ({})", l.name, l.uuid);
        }
    }
    for err in &c.integrity_errors {
        let _ = writeln!(out, "INTEGRITY: {}", err);
    }

    let _ = writeln!(
        out,
        "Summary: {} bound, {} released, {} orphaned, {} zombie Targets",
        c.bound.len(),
        c.released.len(),
        c.orphaned.len(),
        c.zombie_targets.len()
    );
    out
}

/// What a prune would remove
pub fn plan_listing(plan: &Plan) -> String {
    let mut out = String::new();
    if plan.is_empty() {
        out.push_str("Nothing to remove.\n");
    }
    for r in plan.targets.values() {
        let _ = writeln!(out, "  remove Target tid={} {} [{}]", r.id, r.name, r.reason.as_str());
    }
    for r in plan.luns.values() {
        let _ = writeln!(out, "  remove LUN {} ({}) [{}]", r.name, r.id, r.reason.as_str());
    }
    for header in &plan.mappings {
        let _ = writeln!(out, "  remove Mapping [{}]", header);
    }
    for p in &plan.protected {
        let _ = writeln!(
            out,
            "  KEEP {} ({}) [{}]: {}",
            p.name,
            p.id,
            p.reason.as_str(),
            p.detail
        );
    }
    out
}

pub fn apply_summary(outcome: &ApplyOutcome) -> String {
    let mut out = String::new();
    match outcome {
        ApplyOutcome::NoOp => out.push_str("No changes applied.\n"),
        ApplyOutcome::Applied {
            files,
            integrity_errors,
        } => {
            for f in files {
                let verified = f
                    .verified
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "unverified".to_string());
                let _ = writeln!(
                    out,
                    "  {}: removed {}, kept {} (now {}), backup {}",
                    f.path,
                    f.removed.len(),
                    f.kept,
                    verified,
                    f.backup
                );
            }
            for err in integrity_errors {
                let _ = writeln!(out, "  SKIPPED: {}", err);
            }
        }
    }
    out
}

/// Per-category counters for a file-path prune.
///
/// A kind the plan touched but no rewritten file accounts for was skipped
/// by the mutator's integrity check and counts as critical.
pub fn prune_tally(plan: &Plan, outcome: Option<&ApplyOutcome>) -> Tallies {
    let mut tallies = Tallies::default();
    for kind in [ObjectKind::Target, ObjectKind::Lun, ObjectKind::Mapping] {
        let planned = plan.count(kind);
        let protected = plan.protected.iter().filter(|p| p.kind == kind).count();
        let tally = tallies.get_mut(kind);
        tally.attempted = planned + protected;
        tally.skipped = protected;

        match outcome {
            Some(ApplyOutcome::Applied { files, .. }) => {
                let written: Vec<_> = files.iter().filter(|f| f.kind == kind).collect();
                let fixed: usize = written.iter().map(|f| f.removed.len()).sum();
                tally.fixed = fixed;
                tally.failed = planned.saturating_sub(fixed);
                if planned > 0 && written.is_empty() {
                    tally.critical = 1;
                }
            }
            // Dry run or nothing to do
            _ => tally.skipped += planned,
        }
    }
    tallies
}

pub fn repair_listing(report: &RepairReport) -> String {
    let mut out = String::new();
    for r in &report.results {
        let _ = writeln!(out, "  {} {} ({}): {}", r.kind.as_str(), r.name, r.id, r.outcome);
    }
    out
}

pub fn tally_line(tally: &Tally) -> String {
    format!(
        "Attempted {}, fixed {}, skipped {}, failed {} ({} busy, {} critical)",
        tally.attempted, tally.fixed, tally.skipped, tally.failed, tally.conflicts, tally.critical
    )
}

/// One line per object category that saw any work, then the total
pub fn tally_lines(tallies: &Tallies) -> String {
    let mut out = String::new();
    for kind in [ObjectKind::Target, ObjectKind::Lun, ObjectKind::Mapping] {
        let tally = tallies.get(kind);
        if tally.attempted == 0 {
            continue;
        }
        let _ = writeln!(out, "{:<9} {}", format!("{}s:", kind.as_str()), tally_line(tally));
    }
    let _ = writeln!(out, "{:<9} {}", "Total:", tally_line(&tallies.total()));
    out
}
