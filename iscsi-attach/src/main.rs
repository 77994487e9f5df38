//! iSCSI attach CLI
//!
//! Attaches, locates and detaches iSCSI LUNs on this host using the
//! open-iscsi tools.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use iscsi_attach::initiator::DEFAULT_INITIATOR_NAME_FILE;
use iscsi_attach::types::DEFAULT_IFACE;
use iscsi_attach::{
    AttachConfig, Attacher, Connection, Device, FsProbe, IdentityReader, LoginPolicy, Outcome,
    SystemExecutor,
};

#[derive(Parser, Debug)]
#[command(name = "iscsi-attach")]
#[command(about = "Attach iSCSI LUNs with open-iscsi and resolve their device nodes")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Print the Prometheus rendering of collected metrics on exit
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the initiator names configured on this host
    Initiators {
        /// Initiator identity file
        #[arg(long, env = "ISCSI_INITIATOR_FILE", default_value = DEFAULT_INITIATOR_NAME_FILE)]
        file: PathBuf,
    },

    /// Log in to a target (unless already attached) and wait for its device node
    Attach {
        #[command(flatten)]
        target: TargetArgs,

        /// CHAP username (enables CHAP)
        #[arg(long, env = "ISCSI_CHAP_USER", requires = "chap_secret")]
        chap_user: Option<String>,

        /// CHAP secret
        #[arg(long, env = "ISCSI_CHAP_SECRET", hide_env_values = true, requires = "chap_user")]
        chap_secret: Option<String>,

        /// Path checks after login
        #[arg(long, default_value_t = iscsi_attach::attach::DEFAULT_MAX_RETRIES)]
        max_retries: u32,

        /// Seconds between path checks
        #[arg(long, default_value = "2")]
        retry_delay_secs: u64,

        /// Login failure handling (best-effort, strict)
        #[arg(long, default_value = "best-effort")]
        login_policy: LoginPolicy,

        /// Also resolve the dm-multipath mapper device
        #[arg(long)]
        resolve_multipath: bool,

        /// Print the resulting device as JSON
        #[arg(long)]
        json: bool,
    },

    /// Find the device currently attached for a target
    Locate {
        /// Target IQN
        #[arg(long, env = "ISCSI_TARGET_IQN")]
        target_iqn: String,

        /// Print the resulting device as JSON
        #[arg(long)]
        json: bool,
    },

    /// Log out of a target
    Detach {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Target IQN
    #[arg(long, env = "ISCSI_TARGET_IQN")]
    target_iqn: String,

    /// Target portal (host or host:port)
    #[arg(long, env = "ISCSI_PORTAL")]
    portal: String,

    /// LUN number
    #[arg(long, default_value = "0")]
    lun: u32,

    /// open-iscsi interface
    #[arg(long, env = "ISCSI_IFACE", default_value = DEFAULT_IFACE)]
    iface: String,
}

impl TargetArgs {
    fn connection(&self, chap: Option<(String, String)>) -> Connection {
        let (chap_login, chap_password) = chap.clone().unwrap_or_default();
        Connection {
            target_iqn: self.target_iqn.clone(),
            portal: self.portal.clone(),
            iface: self.iface.clone(),
            lun: self.lun,
            chap_enabled: chap.is_some(),
            chap_login,
            chap_password,
            ..Default::default()
        }
    }
}

fn print_device(outcome: &Outcome, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    for warning in &outcome.warnings {
        warn!(warning = %warning, "Completed with warning");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.device)?);
    } else if let Some(path) = outcome.device.resolved_path() {
        println!("{}", path);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    match cli.command {
        Command::Initiators { file } => {
            let reader = IdentityReader::with_path(SystemExecutor, &file);
            for name in reader.initiator_names()? {
                println!("{}", name);
            }
            Ok(true)
        }
        Command::Attach {
            target,
            chap_user,
            chap_secret,
            max_retries,
            retry_delay_secs,
            login_policy,
            resolve_multipath,
            json,
        } => {
            let chap = chap_user.zip(chap_secret);
            let device = target.connection(chap).to_device()?;

            let config = AttachConfig {
                retry_delay: Duration::from_secs(retry_delay_secs),
                max_retries,
                login_policy,
                resolve_multipath,
            };
            info!(
                target_iqn = %device.target_iqn,
                portal = %device.portal,
                lun = device.lun,
                iface = %device.iface,
                chap = device.use_chap(),
                login_policy = %config.login_policy,
                "Attaching iSCSI device"
            );

            let attacher = Attacher::new(SystemExecutor, FsProbe, config);
            let outcome = attacher.attach(device)?;
            print_device(&outcome, json)?;

            if outcome.device.path().is_none() {
                error!(
                    expected = %outcome.device.expected_path(),
                    "Device did not appear"
                );
                return Ok(false);
            }
            Ok(true)
        }
        Command::Locate { target_iqn, json } => {
            let attacher = Attacher::new(SystemExecutor, FsProbe, AttachConfig::default());
            let outcome = attacher.locate(&target_iqn)?;
            print_device(&outcome, json)?;
            Ok(outcome.device.path().is_some())
        }
        Command::Detach { target } => {
            let device: Device = target.connection(None).to_device()?;
            let attacher = Attacher::new(SystemExecutor, FsProbe, AttachConfig::default());
            attacher.detach(&device)?;
            Ok(true)
        }
    }
}

fn init_tracing(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli.log_level) {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    let metrics: Option<PrometheusHandle> = if cli.print_metrics {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "Failed to install metrics recorder");
                None
            }
        }
    } else {
        None
    };

    let status = match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Operation failed");
            ExitCode::FAILURE
        }
    };

    if let Some(handle) = metrics {
        eprint!("{}", handle.render());
    }

    status
}
