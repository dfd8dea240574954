//! dephy-pi - Main entry point
//!
//! Parses the command line, installs logging and signal handling, then runs
//! one provisioning session against the real host.

use anyhow::Context;
use std::path::Path;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use dephy_pi::cli::{Cli, Commands, CreateArgs};
use dephy_pi::command::SystemRunner;
use dephy_pi::config::{AwsCredentials, ProvisionConfig};
use dephy_pi::disk::SysfsEnumerator;
use dephy_pi::fetch::S3Store;
use dephy_pi::mount::SystemMounter;
use dephy_pi::prompt::InquirePrompter;
use dephy_pi::session::{Host, Session};
use dephy_pi::ui::Reporter;
use dephy_pi::{process_guard, sanity};

/// Diagnostics go to stderr; stdout is reserved for progress lines.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);
    info!("dephy-pi starting up");

    // Children are terminated on SIGINT/SIGTERM/SIGHUP; the flash is deferred
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!(error = %e, "failed to initialize signal handlers");
    }
    debug!("signal handlers initialized");

    let reporter = Reporter::new(cli.quiet);
    let code = match &cli.command {
        Commands::Validate { config } => validate(config, &reporter),
        Commands::Create(args) => create(cli.config.as_deref(), args, reporter),
    };
    std::process::exit(code);
}

fn load_config(path: Option<&Path>, args: &CreateArgs) -> anyhow::Result<ProvisionConfig> {
    let mut config = match path {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            ProvisionConfig::load_from_file(path)?
        }
        None => ProvisionConfig::default(),
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn validate(path: &Path, reporter: &Reporter) -> i32 {
    match ProvisionConfig::load_from_file(path).and_then(|config| config.validate()) {
        Ok(()) => {
            reporter.success(&format!("Configuration file is valid: {}", path.display()));
            0
        }
        Err(e) => {
            reporter.error(&format!("{:#}", e));
            1
        }
    }
}

fn create(config_path: Option<&Path>, args: &CreateArgs, reporter: Reporter) -> i32 {
    if let Err(e) = sanity::run_preflight_checks() {
        reporter.error(&e.to_string());
        return e.exit_code();
    }

    let config = match load_config(config_path, args) {
        Ok(config) => config,
        Err(e) => {
            reporter.error(&format!("{:#}", e));
            return 1;
        }
    };
    debug!(?config, "effective configuration");

    let store = match S3Store::from_config(&config, AwsCredentials::from_env()) {
        Ok(store) => store,
        Err(e) => {
            reporter.error(&e.to_string());
            return e.exit_code();
        }
    };

    let disks = SysfsEnumerator::new();
    let runner = SystemRunner::new();
    let mounter = SystemMounter::new(&runner, config.mount_timeout());
    let prompter = InquirePrompter;
    let host = Host {
        disks: &disks,
        mounter: &mounter,
        runner: &runner,
        store: &store,
        prompter: &prompter,
    };

    match Session::new(host, &config, reporter).run() {
        Ok(report) => {
            info!(stages = report.stages.len(), "provisioning finished");
            0
        }
        Err(e) => {
            reporter.error(&e.to_string());
            e.exit_code()
        }
    }
}
