// Command-line host: runs one installation through the out-of-process installer and prints
// the resulting instructions as JSON.

use clap::Parser;
use log::{error, info, LevelFilter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;

use mod_installer_host::ipc::TransportKind;
use mod_installer_host::{
    logging, ConfigError, Driver, HostConfig, HostError, HostServices, InstallError,
    InstallRequest, InstallResult, InstallSession, ProcessLauncher, SecurityLevel,
    SelectedOption, StaticHost,
};

const EXIT_CANCELLED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "mod-installer-host", version, about = "Install a mod through the installer process")]
struct Cli {
    /// Archive-relative paths of every file in the mod
    #[arg(required = true)]
    files: Vec<String>,

    /// Directory the mod archive was extracted to
    #[arg(long, default_value = ".")]
    script_path: PathBuf,

    /// Data directory plugins install into
    #[arg(long, default_value = "Data")]
    plugin_path: String,

    #[arg(long = "stop-pattern")]
    stop_patterns: Vec<String>,

    /// JSON file describing plugins, ini values, versions and data files
    #[arg(long)]
    host_state: Option<PathBuf>,

    /// JSON list of `{stepId, groupId, pluginIds}` decisions to replay
    #[arg(long, conflicts_with = "cancel")]
    choices: Option<PathBuf>,

    /// Cancel at the first wizard step
    #[arg(long)]
    cancel: bool,

    /// Installer executable, overrides the configuration
    #[arg(long)]
    installer: Option<PathBuf>,

    /// Preferred transport: named_pipe or tcp
    #[arg(long, value_parser = parse_transport)]
    transport: Option<TransportKind>,

    /// Run the installer sandboxed
    #[arg(long)]
    sandboxed: bool,

    /// Skip validation of the installer script
    #[arg(long)]
    no_validate: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_transport(value: &str) -> Result<TransportKind, String> {
    TransportKind::parse(value).ok_or_else(|| format!("unknown transport '{}'", value))
}

#[derive(Error, Debug)]
enum Failure {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("host state: {0}")]
    HostState(#[from] HostError),
    #[error("choices file {}: {message}", .path.display())]
    Choices { path: PathBuf, message: String },
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error("failed to print result: {0}")]
    Output(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    logging::init_logger(if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    });
    logging::init_crash_logger();
    logging::init_sentry_from_env();

    let code = match run(cli).await {
        Ok(result) => match serde_json::to_string_pretty(&result) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {}", Failure::Output(e));
                ExitCode::FAILURE
            }
        },
        Err(Failure::Install(InstallError::Cancelled)) => {
            eprintln!("installation cancelled");
            ExitCode::from(EXIT_CANCELLED)
        }
        Err(e) => {
            error!("[HOST] {}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    };

    logging::shutdown_sentry();
    code
}

async fn run(cli: Cli) -> Result<InstallResult, Failure> {
    let mut config = HostConfig::load()?;
    if let Some(installer) = cli.installer {
        config.installer_path = installer;
    }
    if let Some(transport) = cli.transport {
        config.preferred_transport = transport;
    }
    if cli.sandboxed {
        config.security_level = SecurityLevel::Sandboxed;
    }

    let host = match &cli.host_state {
        Some(path) => StaticHost::load(path)?,
        None => StaticHost::default(),
    };

    let driver = if cli.cancel {
        Driver::Cancelling
    } else if let Some(path) = &cli.choices {
        Driver::Deterministic(load_choices(path)?)
    } else {
        Driver::Unattended
    };

    let request = InstallRequest {
        files: cli.files,
        stop_patterns: cli.stop_patterns,
        plugin_path: cli.plugin_path,
        script_path: cli.script_path.to_string_lossy().to_string(),
        preset: None,
        validate: !cli.no_validate,
    };

    info!(
        "[HOST] mod-installer-host {}: installer {} over {} ({})",
        mod_installer_host::get_version(),
        config.installer_path.display(),
        config.preferred_transport,
        config.security_level
    );

    let launcher = ProcessLauncher::new();
    let services = HostServices::from_host(Arc::new(host));
    let session = match InstallSession::start(&config, &launcher, services).await {
        Ok(session) => session,
        Err(e) => {
            launcher.cleanup().await;
            return Err(e.into());
        }
    };

    let result = session.install(request, driver).await;
    session.shutdown().await;
    launcher.cleanup().await;
    Ok(result?)
}

fn load_choices(path: &Path) -> Result<Vec<SelectedOption>, Failure> {
    let content = std::fs::read_to_string(path).map_err(|e| Failure::Choices {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| Failure::Choices {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
