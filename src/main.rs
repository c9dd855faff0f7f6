//! Binary entry point for the Ephemera CLI.

mod console;

use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use chrono::Local;
use clap::Parser;
use thiserror::Error;

use console::{ConsoleUi, SshLauncher};
use ephemera::{
    BootScript, CollectedPlan, ConfigurationWizard, EphemeraConfig, Gateway, JsonFileStore,
    LifecycleOrchestrator, PlanDraft, PlanSubmission, PowerAction, ReachabilityProbe,
    ReadinessPoller, RefreshScope, ResourceCache, ScriptLibrary, ScriptLog, Snapshot,
    TcpHandshake, UserInterface, WizardOutcome,
};

type Orchestrator = LifecycleOrchestrator<Gateway, ConsoleUi, SshLauncher, TcpHandshake>;

#[derive(Debug, Parser)]
#[command(
    name = "ephemera",
    about = "Provision, monitor, and tear down ephemeral cloud instances",
    arg_required_else_help = true
)]
enum Cli {
    #[command(about = "Refresh and print the resource snapshot")]
    Status,
    #[command(about = "Interactive menu for the active instance")]
    Menu,
    #[command(about = "Deploy a new instance")]
    Create(CreateArgs),
    #[command(about = "Reinstall the active instance's operating system")]
    Rebuild(RebuildArgs),
    #[command(about = "Extend the active instance's lifetime")]
    Renew(RenewArgs),
    #[command(about = "Destroy the active instance")]
    Destroy(DestroyArgs),
    #[command(about = "Change the active instance's power state")]
    Power(PowerArgs),
}

#[derive(Debug, Parser)]
struct CreateArgs {
    /// Plan identifier; omit to use the configured default or the wizard.
    #[arg(long)]
    plan: Option<String>,
    /// Operating system image identifier.
    #[arg(long)]
    os: Option<String>,
    /// Duration in hours.
    #[arg(long)]
    hours: Option<u64>,
    /// SSH key identifier.
    #[arg(long)]
    ssh_key: Option<String>,
    /// Boot script name from the configured script directory.
    #[arg(long)]
    script: Option<String>,
}

#[derive(Debug, Parser)]
struct RebuildArgs {
    /// Operating system image identifier; omit to use the wizard.
    #[arg(long)]
    os: Option<String>,
    /// SSH key identifier.
    #[arg(long)]
    ssh_key: Option<String>,
    /// Boot script name from the configured script directory.
    #[arg(long)]
    script: Option<String>,
}

#[derive(Debug, Parser)]
struct RenewArgs {
    /// Hours to extend the instance by.
    #[arg(long)]
    hours: u64,
}

#[derive(Debug, Parser)]
struct DestroyArgs {
    /// Skip the confirmation prompt.
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Parser)]
struct PowerArgs {
    /// One of boot, shutdown, restart, poweroff.
    action: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("gateway error: {0}")]
    Gateway(String),
    #[error("script error: {0}")]
    Script(String),
    #[error("{0}")]
    Usage(String),
}

struct App {
    cache: ResourceCache,
    orchestrator: Orchestrator,
    script_dir: Option<Utf8PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            writeln!(io::stderr(), "{err}").ok();
            1
        }
    };
    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let app = build_app()?;
    let _ = app.orchestrator.refresh(RefreshScope::All).await;

    match cli {
        Cli::Status => status(&app),
        Cli::Menu => menu(&app).await,
        Cli::Create(args) => create(&app, &args).await,
        Cli::Rebuild(args) => rebuild(&app, &args).await,
        Cli::Renew(args) => renew(&app, args.hours).await,
        Cli::Destroy(args) => destroy(&app, args.yes).await,
        Cli::Power(args) => power(&app, &args).await,
    }
}

fn build_app() -> Result<App, CliError> {
    let config = EphemeraConfig::load_without_cli_args()
        .map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;

    let cache = ResourceCache::seeded(config.seed_snapshot());
    let gateway =
        Gateway::new(config.api_url.clone()).map_err(|err| CliError::Gateway(err.to_string()))?;
    let orchestrator = LifecycleOrchestrator::new(
        gateway,
        cache.clone(),
        ConsoleUi,
        SshLauncher,
        ReachabilityProbe::new(),
        ReadinessPoller::new(),
    );

    Ok(App {
        cache,
        orchestrator,
        script_dir: config.script_dir.map(Utf8PathBuf::from),
    })
}

fn exit_code<T, E>(result: Result<T, E>) -> i32 {
    // Lifecycle failures have already produced their notification.
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

fn status(app: &App) -> Result<i32, CliError> {
    let snapshot = app.cache.snapshot();
    let mut out = io::stdout();

    if snapshot.credentials.is_none() {
        writeln!(out, "credentials: not configured").ok();
        return Ok(1);
    }
    writeln!(out, "credentials: configured").ok();
    writeln!(out, "plans:       {}", snapshot.plans.len()).ok();
    writeln!(out, "ssh keys:    {}", snapshot.ssh_keys.len()).ok();

    match snapshot.instances.first() {
        Some(instance) => {
            writeln!(out, "instance:    {} ({})", instance.id, instance.plan).ok();
            writeln!(out, "  hostname:  {}", instance.hostname).ok();
            writeln!(out, "  ipv4:      {}", instance.ipv4).ok();
            writeln!(out, "  created:   {}", instance.creation_at).ok();
            writeln!(out, "  expires:   {}", instance.expiration_at).ok();
            if let Some(state) = snapshot.telemetry.as_ref().and_then(|t| t.state.as_ref()) {
                writeln!(
                    out,
                    "  state:     {} | cpu {:.1}% | {:.0} MiB free | {:.2} GiB traffic",
                    state.state,
                    state.cpu,
                    state.memory.available_mib,
                    state.traffic.total_gib
                )
                .ok();
            }
        }
        None => {
            writeln!(out, "instance:    none").ok();
        }
    }
    Ok(0)
}

async fn menu(app: &App) -> Result<i32, CliError> {
    let _ = app.orchestrator.check_expiration(Local::now()).await;
    let snapshot = app.cache.snapshot();

    if snapshot.credentials.is_none() {
        ConsoleUi.show_info("no API credentials configured");
        ConsoleUi.open_settings();
        return Ok(1);
    }
    if snapshot.instances.is_empty() {
        create_menu(app, &snapshot).await
    } else {
        control_menu(app).await
    }
}

async fn create_menu(app: &App, snapshot: &Snapshot) -> Result<i32, CliError> {
    use ephemera::Choice;

    let default_detail = snapshot.default_plan.as_ref().map_or_else(
        || String::from("no default configured"),
        |plan| {
            format!(
                "plan {} | os {} | {}h | key {}",
                plan.plan_id,
                plan.os_id,
                plan.duration_hours,
                plan.ssh_key_id.as_deref().unwrap_or("none")
            )
        },
    );
    let choices = vec![
        Choice::new("Refresh configuration"),
        Choice::new("Create an instance"),
        Choice::new("Create with the default configuration").with_detail(default_detail),
        Choice::new("Edit the default configuration"),
        Choice::new("Settings"),
    ];

    match ConsoleUi.pick("Ephemera", &choices).await {
        ephemera::Answer::Value(0) => {
            Ok(exit_code(app.orchestrator.refresh(RefreshScope::All).await))
        }
        ephemera::Answer::Value(1) => {
            run_create_wizard(app, app.orchestrator.create_wizard()).await
        }
        ephemera::Answer::Value(2) => match &snapshot.default_plan {
            Some(submission) => Ok(exit_code(
                app.orchestrator.create(submission, None, None).await,
            )),
            None => run_create_wizard(app, app.orchestrator.create_wizard()).await,
        },
        ephemera::Answer::Value(3) => {
            let draft = snapshot
                .default_plan
                .as_ref()
                .map_or_else(PlanDraft::default, |plan| PlanDraft {
                    plan_id: Some(plan.plan_id.clone()),
                    os_id: Some(plan.os_id.clone()),
                    duration_hours: Some(plan.duration_hours),
                    ssh_key_id: plan.ssh_key_id.clone(),
                });
            edit_default(app, draft).await
        }
        ephemera::Answer::Value(_) => {
            ConsoleUi.open_settings();
            Ok(0)
        }
        _ => Ok(0),
    }
}

async fn control_menu(app: &App) -> Result<i32, CliError> {
    use ephemera::Choice;

    let snapshot = app.cache.snapshot();
    let state_detail = snapshot
        .telemetry
        .as_ref()
        .and_then(|telemetry| telemetry.state.as_ref())
        .map_or_else(
            || String::from("state unknown"),
            |state| {
                format!(
                    "state {} | cpu {:.1}% | {:.0} MiB available",
                    state.state, state.cpu, state.memory.available_mib
                )
            },
        );

    let mut choices = vec![
        Choice::new("Refresh status").with_detail(state_detail),
        Choice::new("Delete the instance"),
        Choice::new("Extend the lifetime"),
        Choice::new("Reinstall the operating system"),
        Choice::new("Control power"),
        Choice::new("Settings"),
    ];
    let connect_offered = snapshot.auto_connect_host.is_some();
    if let Some(host) = snapshot.auto_connect_host.as_deref() {
        choices.insert(1, Choice::new(format!("Connect ({host})")));
    }

    let picked = match ConsoleUi.pick("Control instance", &choices).await {
        ephemera::Answer::Value(index) => index,
        _ => return Ok(0),
    };
    // Offset for the optional connect entry.
    let action = if connect_offered && picked >= 1 {
        picked - 1
    } else {
        picked
    };
    let connect_picked = connect_offered && picked == 1;

    // The instance list can change between the render and the selection.
    let Some(instance) = app.cache.first_instance() else {
        ConsoleUi.show_info("no instance to control any more");
        return Ok(1);
    };

    if connect_picked {
        if let Some(host) = app.cache.snapshot().auto_connect_host.as_deref() {
            use ephemera::ConnectLauncher as _;
            SshLauncher.connect(host, false);
        }
        return Ok(0);
    }

    match action {
        0 => Ok(exit_code(
            app.orchestrator.refresh_telemetry(&instance.id).await,
        )),
        1 => destroy(app, false).await,
        2 => Ok(exit_code(app.orchestrator.prompt_renewal(&instance.id).await)),
        3 => {
            let wizard = app.orchestrator.rebuild_wizard(&instance.plan_id);
            run_rebuild_wizard(app, &instance.id, wizard, None).await
        }
        4 => pick_power_action(app, &instance.id).await,
        _ => {
            ConsoleUi.open_settings();
            Ok(0)
        }
    }
}

async fn pick_power_action(app: &App, instance_id: &str) -> Result<i32, CliError> {
    use ephemera::Choice;

    let choices = vec![
        Choice::new("Boot").with_detail("start the instance"),
        Choice::new("Shutdown").with_detail("stop gracefully"),
        Choice::new("Restart").with_detail("reboot"),
        Choice::new("Poweroff").with_detail("cut power immediately"),
    ];
    let actions = [
        PowerAction::Boot,
        PowerAction::Shutdown,
        PowerAction::Restart,
        PowerAction::Poweroff,
    ];
    match ConsoleUi.pick("Control power", &choices).await {
        ephemera::Answer::Value(index) if index < actions.len() => Ok(exit_code(
            app.orchestrator.power(instance_id, actions[index]).await,
        )),
        _ => Ok(0),
    }
}

async fn create(app: &App, args: &CreateArgs) -> Result<i32, CliError> {
    let script = load_script(app, args.script.as_deref())?;
    let submission = match (&args.plan, &args.os, args.hours) {
        (Some(plan), Some(os), Some(hours)) => Some(PlanSubmission {
            plan_id: plan.clone(),
            os_id: os.clone(),
            duration_hours: hours,
            ssh_key_id: args.ssh_key.clone(),
        }),
        (None, None, None) => app.cache.snapshot().default_plan,
        _ => {
            return Err(CliError::Usage(String::from(
                "--plan, --os, and --hours must be provided together",
            )));
        }
    };

    match submission {
        Some(submission) => {
            Ok(exit_code(run_create(app, &submission, script.as_ref()).await))
        }
        None => run_create_wizard_with_script(app, app.orchestrator.create_wizard(), script).await,
    }
}

async fn run_create(
    app: &App,
    submission: &PlanSubmission,
    script: Option<&BootScript>,
) -> Result<ephemera::ProvisionReport, ephemera::LifecycleError> {
    match open_script_log(app) {
        Some(log) => {
            app.orchestrator
                .create(submission, script, Some(&log as &dyn ephemera::ScriptLogSink))
                .await
        }
        None => app.orchestrator.create(submission, script, None).await,
    }
}

async fn run_create_wizard(app: &App, wizard: ConfigurationWizard) -> Result<i32, CliError> {
    run_create_wizard_with_script(app, wizard, None).await
}

async fn run_create_wizard_with_script(
    app: &App,
    wizard: ConfigurationWizard,
    script: Option<BootScript>,
) -> Result<i32, CliError> {
    match wizard.run(&ConsoleUi).await {
        WizardOutcome::Completed(CollectedPlan::Create(submission)) => {
            Ok(exit_code(run_create(app, &submission, script.as_ref()).await))
        }
        WizardOutcome::Completed(CollectedPlan::Rebuild(_)) | WizardOutcome::Cancelled => Ok(0),
        WizardOutcome::Error { message } => {
            writeln!(io::stderr(), "error: {message}").ok();
            Ok(1)
        }
    }
}

async fn edit_default(app: &App, draft: PlanDraft) -> Result<i32, CliError> {
    match app.orchestrator.edit_wizard(draft).run(&ConsoleUi).await {
        WizardOutcome::Completed(CollectedPlan::Create(submission)) => {
            app.cache.merge(
                ephemera::CacheUpdate::new().default_plan(Some(submission.clone())),
            );
            ConsoleUi.show_info(&format!(
                "default set to plan {} / os {} / {}h for this session; persist it in \
                 ephemera.toml to keep it",
                submission.plan_id, submission.os_id, submission.duration_hours
            ));
            Ok(0)
        }
        WizardOutcome::Completed(CollectedPlan::Rebuild(_)) | WizardOutcome::Cancelled => Ok(0),
        WizardOutcome::Error { message } => {
            writeln!(io::stderr(), "error: {message}").ok();
            Ok(1)
        }
    }
}

async fn rebuild(app: &App, args: &RebuildArgs) -> Result<i32, CliError> {
    let Some(instance) = app.cache.first_instance() else {
        writeln!(io::stderr(), "error: no instance to rebuild").ok();
        return Ok(1);
    };
    let script = load_script(app, args.script.as_deref())?;

    if let Some(os) = &args.os {
        let submission = ephemera::RebuildSubmission {
            os_id: os.clone(),
            ssh_key_id: args.ssh_key.clone(),
        };
        return Ok(exit_code(
            run_rebuild(app, &instance.id, &submission, script.as_ref()).await,
        ));
    }

    let wizard = app.orchestrator.rebuild_wizard(&instance.plan_id);
    run_rebuild_wizard(app, &instance.id, wizard, script).await
}

async fn run_rebuild(
    app: &App,
    instance_id: &str,
    submission: &ephemera::RebuildSubmission,
    script: Option<&BootScript>,
) -> Result<ephemera::ProvisionReport, ephemera::LifecycleError> {
    match open_script_log(app) {
        Some(log) => {
            app.orchestrator
                .rebuild(
                    instance_id,
                    submission,
                    script,
                    Some(&log as &dyn ephemera::ScriptLogSink),
                )
                .await
        }
        None => {
            app.orchestrator
                .rebuild(instance_id, submission, script, None)
                .await
        }
    }
}

async fn run_rebuild_wizard(
    app: &App,
    instance_id: &str,
    wizard: ConfigurationWizard,
    script: Option<BootScript>,
) -> Result<i32, CliError> {
    match wizard.run(&ConsoleUi).await {
        WizardOutcome::Completed(CollectedPlan::Rebuild(submission)) => Ok(exit_code(
            run_rebuild(app, instance_id, &submission, script.as_ref()).await,
        )),
        WizardOutcome::Completed(CollectedPlan::Create(_)) | WizardOutcome::Cancelled => Ok(0),
        WizardOutcome::Error { message } => {
            writeln!(io::stderr(), "error: {message}").ok();
            Ok(1)
        }
    }
}

async fn renew(app: &App, hours: u64) -> Result<i32, CliError> {
    let Some(instance) = app.cache.first_instance() else {
        writeln!(io::stderr(), "error: no instance to renew").ok();
        return Ok(1);
    };
    Ok(exit_code(app.orchestrator.renew(&instance.id, hours).await))
}

async fn destroy(app: &App, yes: bool) -> Result<i32, CliError> {
    let Some(instance) = app.cache.first_instance() else {
        writeln!(io::stderr(), "error: no instance to destroy").ok();
        return Ok(1);
    };
    if !yes {
        let confirmed = ConsoleUi
            .confirm(&format!("Destroy instance {}?", instance.id))
            .await;
        if !confirmed {
            return Ok(0);
        }
    }
    Ok(exit_code(app.orchestrator.delete(&instance.id).await))
}

async fn power(app: &App, args: &PowerArgs) -> Result<i32, CliError> {
    let Some(action) = PowerAction::from_name(&args.action) else {
        return Err(CliError::Usage(format!(
            "unknown power action '{}': use boot, shutdown, restart, or poweroff",
            args.action
        )));
    };
    let Some(instance) = app.cache.first_instance() else {
        writeln!(io::stderr(), "error: no instance to control").ok();
        return Ok(1);
    };
    Ok(exit_code(app.orchestrator.power(&instance.id, action).await))
}

fn load_script(app: &App, name: Option<&str>) -> Result<Option<BootScript>, CliError> {
    let Some(name) = name else {
        return Ok(None);
    };
    let Some(dir) = &app.script_dir else {
        return Err(CliError::Script(String::from(
            "no script directory configured: set EPHEMERA_SCRIPT_DIR",
        )));
    };
    let library = ScriptLibrary::open(dir).map_err(|err| CliError::Script(err.to_string()))?;
    library
        .load(name)
        .map(Some)
        .map_err(|err| CliError::Script(err.to_string()))
}

fn open_script_log(app: &App) -> Option<ScriptLog<JsonFileStore>> {
    let dir = app.script_dir.as_ref()?;
    match JsonFileStore::open(dir) {
        Ok(store) => Some(ScriptLog::new(store)),
        Err(err) => {
            tracing::warn!(error = %err, "script log unavailable");
            None
        }
    }
}
