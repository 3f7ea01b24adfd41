//! Command-line front end
//!
//! Every subcommand is a dry run unless `--execute` is given, and an
//! executing run asks for `yes` on stdin before touching the appliance.
//! Only one run per appliance should be active at a time; nothing here
//! enforces that.

use clap::{Args, Parser, Subcommand};
use iscsi_reconcile::config::Settings;
use iscsi_reconcile::reconcile::bound_ids;
use iscsi_reconcile::repair::{self, RepairOptions};
use iscsi_reconcile::{
    block, classify, objects, plan, plan_forced_target, report, Classification, EnvSnapshot,
    FileInventory, KubectlInventory, PruneScope, ReconcileError, RemoteShell, Result,
    SafeMutator, SshShell, Tallies, VolumeInventory, WebApiClient,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "iscsi-reconcile", version, about)]
struct Cli {
    /// TOML settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Read volumes from a saved `kubectl get pv -o json` document
    #[arg(long, global = true)]
    inventory: Option<PathBuf>,

    /// Apply changes (after confirmation)
    #[arg(long, global = true, conflicts_with = "dry_run")]
    execute: bool,

    /// Only print what would change (the default)
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify every LUN and Target and print the result
    Audit,
    /// Remove stale blocks from the configuration files
    Prune(PruneArgs),
    /// Reattach LUNs to unmapped Targets through the management API
    Rebind,
    /// Delete orphaned Targets and LUNs through the management API
    Cleanup,
    /// Re-enable Targets marked `enabled=no`
    Enable,
}

#[derive(Args)]
struct PruneArgs {
    /// LUNs with no volume, and their Targets
    #[arg(long)]
    orphans: bool,
    /// Targets whose iqn names a volume that no longer exists
    #[arg(long)]
    zombies: bool,
    /// Transient recovery objects
    #[arg(long)]
    markers: bool,
    /// Objects no mapping refers to
    #[arg(long)]
    unreferenced: bool,
    /// All of the above
    #[arg(long)]
    all: bool,
    /// Remove only the Targets whose name or iqn contains this text
    #[arg(
        long,
        value_name = "PATTERN",
        conflicts_with_all = ["orphans", "zombies", "markers", "unreferenced", "all"]
    )]
    target: Option<String>,
}

impl PruneArgs {
    fn scope(&self) -> PruneScope {
        if self.all {
            return PruneScope::all();
        }
        PruneScope {
            orphans: self.orphans,
            zombies: self.zombies,
            markers: self.markers,
            unreferenced: self.unreferenced,
        }
    }
}

/// Operator confirmation before destructive steps
trait Confirm {
    fn confirm(&self, prompt: &str) -> io::Result<bool>;
}

struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> io::Result<bool> {
        print!("{} Type 'yes' to proceed: ", prompt);
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(answer.trim() == "yes")
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(&cli, &StdinConfirm) {
        Ok(tallies) => {
            print!("{}", report::tally_lines(&tallies));
            if tallies.total().failed > 0 {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, confirm: &dyn Confirm) -> Result<Tallies> {
    let env = EnvSnapshot::capture();
    let settings = Settings::load(cli.config.as_deref(), &env)?;
    let execute = cli.execute && !cli.dry_run;
    if !execute {
        log::info!("Dry run; pass --execute to apply changes");
    }

    match &cli.command {
        Command::Audit => {
            let shell = SshShell::new(&settings);
            let classification = classify_with(cli, &settings, &shell)?;
            print!("{}", report::audit_table(&classification));
            Ok(Tallies::default())
        }
        Command::Prune(args) => prune(cli, &settings, args, execute, confirm),
        Command::Rebind => {
            let volumes = inventory(cli, &settings).volumes()?;
            let bound = bound_ids(&volumes);
            let api = WebApiClient::login(&settings)?;
            if execute && !confirm.confirm("Rebind will map, delete and recreate Targets.")? {
                return Err(aborted());
            }
            let options = repair_options(&settings, execute);
            let result = repair::rebind(&api, &bound, &options)?;
            print!("{}", report::repair_listing(&result));
            Ok(result.by_kind)
        }
        Command::Cleanup => {
            let volumes = inventory(cli, &settings).volumes()?;
            let api = WebApiClient::login(&settings)?;
            if execute
                && !confirm.confirm("Cleanup permanently deletes orphaned Targets and LUNs.")?
            {
                return Err(aborted());
            }
            let options = repair_options(&settings, execute);
            let result = repair::cleanup(&api, &volumes, &options)?;
            print!("{}", report::repair_listing(&result));
            Ok(result.by_kind)
        }
        Command::Enable => enable(&settings, execute, confirm),
    }
}

fn enable(settings: &Settings, execute: bool, confirm: &dyn Confirm) -> Result<Tallies> {
    let shell = SshShell::new(settings);
    let disabled = disabled_targets(settings, &shell)?;
    if disabled.is_empty() {
        println!("No disabled Targets found.");
        return Ok(Tallies::default());
    }
    if execute && !confirm.confirm(&format!("{} Targets will be enabled.", disabled.len()))? {
        return Err(aborted());
    }

    let result = repair::enable_targets(&shell, &settings.webapi_tool, &disabled, !execute);
    print!("{}", report::repair_listing(&result));
    if execute {
        let remaining = disabled_targets(settings, &shell)?;
        if !remaining.is_empty() {
            log::warn!("{} Targets are still disabled", remaining.len());
        }
    }
    Ok(result.by_kind)
}

fn disabled_targets(settings: &Settings, shell: &dyn RemoteShell) -> Result<Vec<objects::Target>> {
    let location = &settings.files.targets;
    let file = block::parse(&shell.read_file(&location.path)?, &location.prefix);
    Ok(objects::targets(&file)?
        .into_iter()
        .filter(|t| t.enabled == Some(false))
        .collect())
}

fn prune(
    cli: &Cli,
    settings: &Settings,
    args: &PruneArgs,
    execute: bool,
    confirm: &dyn Confirm,
) -> Result<Tallies> {
    let scope = args.scope();
    if scope.is_empty() && args.target.is_none() {
        return Err(ReconcileError::Config(
            "choose at least one of --orphans, --zombies, --markers, --unreferenced, --all, \
             or name a --target"
                .into(),
        ));
    }

    let shell = SshShell::new(settings);
    let classification = classify_with(cli, settings, &shell)?;
    let plan = match &args.target {
        Some(pattern) => plan_forced_target(&classification, pattern, &settings.naming)?,
        None => plan(&classification, scope, &settings.naming, settings.marker_policy)?,
    };
    print!("{}", report::plan_listing(&plan));

    if !execute || plan.is_empty() {
        return Ok(report::prune_tally(&plan, None));
    }
    if !confirm.confirm("The iSCSI service will be stopped while the files are rewritten.")? {
        return Err(aborted());
    }

    let mutator = SafeMutator::new(&shell, settings.service.clone(), settings.transfer.clone());
    let outcome = mutator.apply(&plan.file_edits(&settings.files))?;
    print!("{}", report::apply_summary(&outcome));
    Ok(report::prune_tally(&plan, Some(&outcome)))
}

fn inventory(cli: &Cli, settings: &Settings) -> Box<dyn VolumeInventory> {
    match &cli.inventory {
        Some(path) => Box::new(FileInventory::new(path)),
        None => Box::new(KubectlInventory::new(&settings.kubectl, settings.command_timeout)),
    }
}

fn classify_with(
    cli: &Cli,
    settings: &Settings,
    shell: &dyn RemoteShell,
) -> Result<Classification> {
    let files = &settings.files;
    let lun_file = block::parse(&shell.read_file(&files.luns.path)?, &files.luns.prefix);
    let target_file = block::parse(&shell.read_file(&files.targets.path)?, &files.targets.prefix);
    let mapping_file =
        block::parse(&shell.read_file(&files.mappings.path)?, &files.mappings.prefix);

    let luns = objects::luns(&lun_file)?;
    let targets = objects::targets(&target_file)?;
    let mappings = objects::mappings(&mapping_file)?;
    let volumes = inventory(cli, settings).volumes()?;

    log::info!(
        "Appliance has {} LUNs, {} Targets, {} Mappings; inventory has {} volumes",
        luns.len(),
        targets.len(),
        mappings.len(),
        volumes.len()
    );
    Ok(classify(&luns, &targets, &mappings, &volumes, &settings.naming))
}

fn repair_options(settings: &Settings, execute: bool) -> RepairOptions<'_> {
    RepairOptions {
        rules: &settings.naming,
        marker_policy: settings.marker_policy,
        dry_run: !execute,
    }
}

fn aborted() -> ReconcileError {
    ReconcileError::Config("aborted by operator".to_string())
}
