//! sideload - install apps onto devices over USB or the network
//!
//! Usage:
//!   sideload devices              # List reachable devices (name [kind]: udid)
//!   sideload install <app>        # Sign and install an .ipa or .app
//!   sideload config show          # Print the effective configuration
//!
//! Devices come from the simulated backend described by the `[mock]` table
//! of `sideload.toml`.

mod terminal;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sideload_backend_mock::{MockConfig, MockInstaller, MockSigner};
use sideload_core::config::{ConfigStore, SideloadConfig, to_toml};
use sideload_core::device::{ClientDevice, DeviceDiscovery, DeviceTransport, SearchMode};
use sideload_core::error::InstallError;
use sideload_core::install::{InstallOrchestrator, InstallServices};
use sideload_core::session::{ConnectionPool, ConnectionPreferences};

use crate::terminal::{TerminalDelegate, choose_device, device_label};

#[derive(Parser)]
#[command(name = "sideload")]
#[command(about = "Install apps onto devices over USB or the network", long_about = None)]
struct Cli {
    /// Path to sideload.toml (defaults to the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List reachable devices
    Devices {
        /// Which links to search
        #[arg(long, default_value = "all")]
        search: SearchArg,

        /// Print the current set right away instead of waiting for a device
        #[arg(long)]
        no_wait: bool,

        /// Seconds to wait for a device to show up
        #[arg(long, default_value_t = 10)]
        wait: u64,

        /// Keep listing as devices come and go, until Ctrl-C
        #[arg(long, short)]
        watch: bool,
    },

    /// Sign and install an app
    Install(InstallArgs),

    /// Inspect or create the configuration file
    Config(ConfigArgs),
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum SearchArg {
    /// USB-attached devices only
    Usb,
    /// Devices reachable over the network only
    Network,
    /// Both
    #[default]
    All,
}

impl From<SearchArg> for SearchMode {
    fn from(arg: SearchArg) -> Self {
        match arg {
            SearchArg::Usb => SearchMode::Usb,
            SearchArg::Network => SearchMode::Network,
            SearchArg::All => SearchMode::All,
        }
    }
}

#[derive(Args)]
struct InstallArgs {
    /// The .ipa archive or .app bundle to install
    path: PathBuf,

    /// Device to install to (prompts when several are found)
    #[arg(long)]
    udid: Option<String>,

    /// Which links to search
    #[arg(long, default_value = "all")]
    search: SearchArg,

    /// Also set the device up for wireless installs
    #[arg(long)]
    configure_device: bool,

    /// Seconds to wait for a device to show up
    #[arg(long, default_value_t = 10)]
    wait: u64,

    /// Skip all confirmation prompts
    #[arg(short = 'y', long)]
    yes: bool,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Subcommand)]
enum ConfigSubcommand {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sideload=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let store = match &cli.config {
        Some(path) => ConfigStore::from_path(path.clone()),
        None => ConfigStore::from_default_location()?,
    };

    match cli.command {
        Commands::Devices {
            search,
            no_wait,
            wait,
            watch,
        } => {
            let wait = (!no_wait).then(|| Duration::from_secs(wait));
            run_devices(&store, search.into(), wait, watch).await
        }
        Commands::Install(args) => run_install(&store, args).await,
        Commands::Config(args) => run_config(&store, args.command),
    }
}

/// The simulated backend configured in `[mock]`.
fn backend(config: &SideloadConfig) -> Result<MockConfig> {
    let mock = config.extra_table::<MockConfig>("mock")?.unwrap_or_default();
    info!(devices = mock.devices.len(), "Using simulated device backend");
    Ok(mock)
}

fn print_devices(devices: &[ClientDevice]) {
    if devices.is_empty() {
        println!("{}", style("No devices found").dim());
        return;
    }
    for device in devices {
        println!("  {}", device_label(device));
    }
}

async fn run_devices(
    store: &ConfigStore,
    search: SearchMode,
    wait: Option<Duration>,
    watch: bool,
) -> Result<()> {
    let config = store.load()?;
    let transport: Arc<dyn DeviceTransport> = Arc::new(backend(&config)?.transport());
    let discovery = DeviceDiscovery::new(transport, config.session.label.clone());

    let mut stream = discovery.search(search).await?;
    let mut devices = stream
        .next_snapshot()
        .await
        .context("Device search ended unexpectedly")?;
    if let Some(wait) = wait.filter(|_| devices.is_empty()) {
        // Nothing yet; give a device the chance to show up
        if let Ok(Some(found)) = tokio::time::timeout(wait, stream.wait_for(None)).await {
            devices = found;
        }
    }
    print_devices(&devices);
    if !watch {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            snapshot = stream.next_snapshot() => match snapshot {
                Some(devices) => {
                    println!("{}", style("Devices changed:").bold());
                    print_devices(&devices);
                }
                None => return Ok(()),
            },
        }
    }
}

async fn run_install(store: &ConfigStore, args: InstallArgs) -> Result<()> {
    let config = store.load()?;
    let mock = backend(&config)?;
    let transport: Arc<dyn DeviceTransport> = Arc::new(mock.transport());
    let session = config.session_settings();
    let search = SearchMode::from(args.search);

    // Find the device
    let discovery = DeviceDiscovery::new(Arc::clone(&transport), session.label.clone());
    let mut stream = discovery.search(search).await?;
    let found = tokio::time::timeout(
        Duration::from_secs(args.wait),
        stream.wait_for(args.udid.as_deref()),
    )
    .await
    .ok()
    .flatten();
    drop(stream);
    let devices = match (found, &args.udid) {
        (Some(devices), Some(udid)) => devices.into_iter().filter(|d| &d.udid == udid).collect(),
        (Some(devices), None) => devices,
        (None, Some(udid)) => anyhow::bail!("Device {} not found", udid),
        (None, None) => anyhow::bail!("No devices found"),
    };
    let device = choose_device(devices, args.yes).await?;

    println!();
    println!(
        "{} {} to {}",
        style("  Installing").bold().cyan(),
        args.path.display(),
        style(device_label(&device)).green()
    );
    println!();

    let mut settings = config.install_settings();
    settings.configure_device |= args.configure_device;
    let services = InstallServices {
        provisioner: Arc::new(mock.provisioner()),
        signer: Arc::new(MockSigner::new()),
        installer: Arc::new(MockInstaller::new()),
    };
    let orchestrator = InstallOrchestrator::new(
        ConnectionPool::new(transport, session),
        device.udid.clone(),
        ConnectionPreferences::lookup_mode(search.lookup_mode()),
        services,
        Arc::new(TerminalDelegate::new(args.yes)),
        settings,
    );

    let install = orchestrator.install(&args.path);
    tokio::pin!(install);
    let result = tokio::select! {
        result = &mut install => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling install");
            orchestrator.cancel();
            install.await
        }
    };

    match result {
        Ok(bundle_id) => {
            println!();
            println!("{} {}", style("✓ Installed").green().bold(), bundle_id);
            Ok(())
        }
        Err(InstallError::Cancelled) => {
            println!("{}", style("Install cancelled").yellow());
            Ok(())
        }
        Err(e) => Err(e).context("Install failed"),
    }
}

fn run_config(store: &ConfigStore, command: ConfigSubcommand) -> Result<()> {
    match command {
        ConfigSubcommand::Show => {
            let config = store.load()?;
            println!("# {}", store.config_path().display());
            print!("{}", to_toml(&config)?);
        }
        ConfigSubcommand::Init { force } => {
            if store.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    store.config_path().display()
                );
            }
            let mut config = SideloadConfig::new();
            let mock = toml::Value::try_from(MockConfig::default())
                .context("Failed to serialize mock backend settings")?;
            config.extra.insert("mock".to_string(), mock);
            store.save(&config)?;
            println!("Wrote {}", store.config_path().display());
        }
    }
    Ok(())
}
