//! Management API repair tests against an in-memory appliance

mod common;

use common::{api_lun, api_target, settings, unmapped_target, volumes, FakeApi, FakeShell};
use iscsi_reconcile::block;
use iscsi_reconcile::error::BUSY_ERROR_CODE;
use iscsi_reconcile::reconcile::bound_ids;
use iscsi_reconcile::repair::{self, Action, Outcome, RepairOptions, Tally};
use iscsi_reconcile::{objects, MarkerPolicy, NamingRules, ReconcileError, RemoteShell, Target};
use std::collections::BTreeSet;

const OTHER_ERROR: i64 = 18990505;

fn options(rules: &NamingRules, marker_policy: MarkerPolicy, dry_run: bool) -> RepairOptions<'_> {
    RepairOptions {
        rules,
        marker_policy,
        dry_run,
    }
}

// ============================================================================
// Rebind
// ============================================================================

#[test]
fn test_scenario_c_busy_delete_is_counted_and_run_continues() {
    let api = FakeApi::new(
        vec![
            unmapped_target("3", "recovery-target-3"),
            unmapped_target("4", "k8s-csi-pvc-4"),
        ],
        vec![api_lun("40", "k8s-csi-pvc-4", "dddd-4444")],
    )
    .failing("delete_target:3", BUSY_ERROR_CODE);

    let rules = NamingRules::default();
    let report = repair::rebind(&api, &BTreeSet::new(), &options(&rules, MarkerPolicy::Guarded, false))
        .unwrap();

    assert_eq!(api.calls(), vec!["delete_target:3", "map_lun:4"]);
    assert_eq!(
        report.tally,
        Tally {
            attempted: 2,
            fixed: 1,
            skipped: 0,
            failed: 1,
            conflicts: 1,
            critical: 0,
        }
    );
    assert!(matches!(
        report.results[0].outcome,
        Outcome::Failed { conflict: true, critical: false, .. }
    ));
    assert_eq!(report.results[1].outcome, Outcome::Fixed(Action::Mapped));
}

#[test]
fn test_map_failure_recreates_target() {
    let api = FakeApi::new(
        vec![unmapped_target("4", "k8s-csi-pvc-4")],
        vec![api_lun("40", "k8s-csi-pvc-4", "dddd-4444")],
    )
    .failing("map_lun:4", OTHER_ERROR);

    let rules = NamingRules::default();
    let report = repair::rebind(&api, &BTreeSet::new(), &options(&rules, MarkerPolicy::Guarded, false))
        .unwrap();

    assert_eq!(
        api.calls(),
        vec!["map_lun:4", "delete_target:4", "create_target:k8s-csi-pvc-4"]
    );
    assert_eq!(report.results[0].outcome, Outcome::Fixed(Action::Recreated));

    let targets = api.targets.borrow();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].iqn.as_deref(), Some("iqn.2000-01.com.synology:k8s-csi-pvc-4"));
    assert_eq!(targets[0].mapped_lun_ids, vec!["40".to_string()]);
}

#[test]
fn test_create_failure_raises_critical_alarm() {
    let api = FakeApi::new(
        vec![unmapped_target("4", "k8s-csi-pvc-4")],
        vec![api_lun("40", "k8s-csi-pvc-4", "dddd-4444")],
    )
    .failing("map_lun:4", OTHER_ERROR)
    .failing("create_target:k8s-csi-pvc-4", OTHER_ERROR);

    let rules = NamingRules::default();
    let report = repair::rebind(&api, &BTreeSet::new(), &options(&rules, MarkerPolicy::Guarded, false))
        .unwrap();

    assert_eq!(report.tally.critical, 1);
    assert_eq!(report.tally.failed, 1);
    match &report.results[0].outcome {
        Outcome::Failed { error, critical, .. } => {
            assert!(*critical);
            assert!(error.contains("target deleted but not recreated"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_delete_failure_stops_before_create() {
    let api = FakeApi::new(
        vec![unmapped_target("4", "k8s-csi-pvc-4")],
        vec![api_lun("40", "k8s-csi-pvc-4", "dddd-4444")],
    )
    .failing("map_lun:4", OTHER_ERROR)
    .failing("delete_target:4", OTHER_ERROR);

    let rules = NamingRules::default();
    let report = repair::rebind(&api, &BTreeSet::new(), &options(&rules, MarkerPolicy::Guarded, false))
        .unwrap();

    assert_eq!(api.calls(), vec!["map_lun:4", "delete_target:4"]);
    assert_eq!(report.tally.failed, 1);
    assert_eq!(report.tally.critical, 0);
}

#[test]
fn test_busy_map_does_not_recreate() {
    let api = FakeApi::new(
        vec![unmapped_target("4", "k8s-csi-pvc-4")],
        vec![api_lun("40", "k8s-csi-pvc-4", "dddd-4444")],
    )
    .failing("map_lun:4", BUSY_ERROR_CODE);

    let rules = NamingRules::default();
    let report = repair::rebind(&api, &BTreeSet::new(), &options(&rules, MarkerPolicy::Guarded, false))
        .unwrap();

    assert_eq!(api.calls(), vec!["map_lun:4"]);
    assert_eq!(report.tally.conflicts, 1);
}

#[test]
fn test_mapped_and_unmatched_targets_are_left_alone() {
    let api = FakeApi::new(
        vec![
            api_target("1", "k8s-csi-pvc-1", 0),
            unmapped_target("2", "k8s-csi-pvc-no-lun"),
        ],
        vec![api_lun("10", "k8s-csi-pvc-1", "aaaa")],
    );

    let rules = NamingRules::default();
    let report = repair::rebind(&api, &BTreeSet::new(), &options(&rules, MarkerPolicy::Guarded, false))
        .unwrap();

    assert!(api.calls().is_empty());
    assert!(report.results.is_empty());
    assert_eq!(report.tally, Tally::default());
}

#[test]
fn test_guarded_marker_spares_bound_volume() {
    let targets = vec![unmapped_target("5", "k8s-csi-pvc-1-recovery")];
    let bound: BTreeSet<String> = ["pvc-1".to_string()].into_iter().collect();
    let rules = NamingRules::default();

    let guarded = FakeApi::new(targets.clone(), Vec::new());
    let report = repair::rebind(&guarded, &bound, &options(&rules, MarkerPolicy::Guarded, false))
        .unwrap();
    assert!(guarded.calls().is_empty());
    assert!(matches!(&report.results[0].outcome, Outcome::Skipped(why) if why.contains("pvc-1")));

    let sharp = FakeApi::new(targets, Vec::new());
    let report = repair::rebind(&sharp, &bound, &options(&rules, MarkerPolicy::Unconditional, false))
        .unwrap();
    assert_eq!(sharp.calls(), vec!["delete_target:5"]);
    assert_eq!(report.results[0].outcome, Outcome::Fixed(Action::Deleted));
}

#[test]
fn test_rebind_dry_run_makes_no_changes() {
    let api = FakeApi::new(
        vec![
            unmapped_target("3", "recovery-target-3"),
            unmapped_target("4", "k8s-csi-pvc-4"),
        ],
        vec![api_lun("40", "k8s-csi-pvc-4", "dddd-4444")],
    );

    let rules = NamingRules::default();
    let report = repair::rebind(&api, &BTreeSet::new(), &options(&rules, MarkerPolicy::Guarded, true))
        .unwrap();

    assert!(api.calls().is_empty());
    assert_eq!(report.tally.skipped, 2);
    assert_eq!(report.tally.attempted, 2);
}

// ============================================================================
// Cleanup
// ============================================================================

#[test]
fn test_cleanup_deletes_targets_before_luns() {
    let api = FakeApi::new(
        vec![
            api_target("1", "k8s-csi-pvc-aaaa", 0),
            api_target("2", "k8s-csi-pvc-bbbb", 0),
            api_target("9", "Target-9", 0),
        ],
        vec![
            api_lun("1", "k8s-csi-pvc-aaaa", "aaaa-1111"),
            api_lun("2", "k8s-csi-pvc-bbbb", "bbbb-2222"),
            api_lun("5", "manual-lun", "zzzz-0000"),
        ],
    );

    let rules = NamingRules::default();
    let report = repair::cleanup(&api, &volumes(), &options(&rules, MarkerPolicy::Guarded, false))
        .unwrap();

    assert_eq!(api.calls(), vec!["delete_target:1", "delete_lun:1"]);
    assert_eq!(report.tally.fixed, 2);
    assert_eq!(report.by_kind.targets.fixed, 1);
    assert_eq!(report.by_kind.luns.fixed, 1);
    assert_eq!(report.by_kind.mappings, Tally::default());
    assert_eq!(report.by_kind.total(), report.tally);
    assert_eq!(api.luns.borrow().len(), 2);
}

#[test]
fn test_cleanup_never_deletes_bound_lun() {
    // The uuid is unknown to the inventory but the name maps to a Bound volume
    let api = FakeApi::new(
        vec![api_target("2", "k8s-csi-pvc-bbbb", 0)],
        vec![api_lun("7", "k8s-csi-pvc-bbbb", "stale-uuid")],
    );

    let rules = NamingRules::default();
    let report = repair::cleanup(&api, &volumes(), &options(&rules, MarkerPolicy::Guarded, false))
        .unwrap();

    assert!(api.calls().is_empty());
    assert_eq!(report.tally.skipped, 2);
    assert_eq!(report.tally.fixed, 0);
    assert!(bound_ids(&volumes()).contains("pvc-bbbb"));
}

#[test]
fn test_cleanup_busy_target_does_not_stop_luns() {
    let api = FakeApi::new(
        vec![api_target("1", "k8s-csi-pvc-aaaa", 0)],
        vec![api_lun("1", "k8s-csi-pvc-aaaa", "aaaa-1111")],
    )
    .failing("delete_target:1", BUSY_ERROR_CODE);

    let rules = NamingRules::default();
    let report = repair::cleanup(&api, &volumes(), &options(&rules, MarkerPolicy::Guarded, false))
        .unwrap();

    assert_eq!(api.calls(), vec!["delete_target:1", "delete_lun:1"]);
    assert_eq!(report.tally.conflicts, 1);
    assert_eq!(report.tally.fixed, 1);
    assert_eq!(report.by_kind.targets.conflicts, 1);
    assert_eq!(report.by_kind.luns.fixed, 1);
}

#[test]
fn test_cleanup_refuses_inventory_without_handles() {
    let api = FakeApi::new(Vec::new(), vec![api_lun("1", "k8s-csi-pvc-aaaa", "aaaa-1111")]);
    let mut records = volumes();
    for r in &mut records {
        r.volume_handle = None;
    }

    let rules = NamingRules::default();
    let err = repair::cleanup(&api, &records, &options(&rules, MarkerPolicy::Guarded, false))
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Integrity(_)));
    assert!(api.calls().is_empty());
}

// ============================================================================
// Enable
// ============================================================================

fn disabled_fixture_targets(shell: &FakeShell) -> Vec<Target> {
    let files = &settings().files;
    let text = shell.read_file(&files.targets.path).unwrap();
    objects::targets(&block::parse(&text, &files.targets.prefix))
        .unwrap()
        .into_iter()
        .filter(|t| t.enabled == Some(false))
        .collect()
}

#[test]
fn test_enable_runs_webapi_tool_per_disabled_target() {
    let settings = settings();
    let shell = FakeShell::with_fixture(&settings.files);
    let disabled = disabled_fixture_targets(&shell);
    assert_eq!(disabled.len(), 1);
    assert_eq!(disabled[0].tid, "3");

    let report = repair::enable_targets(&shell, &settings.webapi_tool, &disabled, false);

    assert_eq!(
        shell.commands_containing("# /usr/local/bin/synoiscsiwebapi target enable '3'"),
        1
    );
    assert_eq!(report.results[0].outcome, Outcome::Fixed(Action::Enabled));
    assert_eq!(report.by_kind.targets.fixed, 1);
    assert_eq!(report.by_kind.luns, Tally::default());
    // Enabling leaves the service alone
    assert_eq!(shell.commands_containing("systemctl"), 0);
}

#[test]
fn test_enable_failure_is_counted() {
    let settings = settings();
    let shell = FakeShell::with_fixture(&settings.files).fail_on("target enable", 1);
    let disabled = disabled_fixture_targets(&shell);

    let report = repair::enable_targets(&shell, &settings.webapi_tool, &disabled, false);

    assert_eq!(report.by_kind.targets.failed, 1);
    assert_eq!(report.by_kind.targets.fixed, 0);
    assert!(matches!(
        report.results[0].outcome,
        Outcome::Failed { conflict: false, critical: false, .. }
    ));
}

#[test]
fn test_enable_dry_run_issues_no_commands() {
    let settings = settings();
    let shell = FakeShell::with_fixture(&settings.files);
    let disabled = disabled_fixture_targets(&shell);
    shell.log.borrow_mut().clear();

    let report = repair::enable_targets(&shell, &settings.webapi_tool, &disabled, true);

    assert!(shell.log.borrow().is_empty());
    assert_eq!(report.by_kind.targets.skipped, 1);
    assert_eq!(report.by_kind.targets.attempted, 1);
}
