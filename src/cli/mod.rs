//! Command-line interface and composition root.
//!
//! Owns the wiring: platform, elevation bridge, provisioner, configurator
//! and credentials store are constructed here and handed to the lifecycle
//! driver. Flag values fall back to `KUBENEST_*` environment variables and
//! the settings file, flag-wins.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::cluster::readiness::{self, WorkloadObservation};
use crate::cluster::{ClusterStatus, Lifecycle};
use crate::elevation::{ElevationBridge, server};
use crate::errors::{KubenestError, KubenestResult};
use crate::hostcfg::{self, ConfigureOptions, StandardConfigurator};
use crate::image::DiskImages;
use crate::kube::{ClusterHandle, KubeCredentials, KubectlSource, PodSource};
use crate::logging;
use crate::machine::{MachinePlatform, Machinectl};
use crate::settings::{self, Settings};

/// Seconds to wait for workloads to settle after a start.
const DEFAULT_WAIT_TIMEOUT: u64 = 45;

#[derive(Parser)]
#[command(
    name = "kubenest",
    version,
    about = "Manages a local Kubernetes cluster in a container machine",
    after_help = "Examples:\n  kubenest install\n  kubenest status\n  kubenest -v debug start"
)]
pub struct Cli {
    /// Settings file (default: ~/.config/kubenest/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) or filter directive
    #[arg(short = 'v', long, global = true, env = "KUBENEST_VERBOSITY")]
    verbosity: Option<String>,

    /// Log file to append to
    #[arg(short = 'l', long, global = true, env = "KUBENEST_LOGFILE")]
    logfile: Option<PathBuf>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    json: bool,

    /// Name of the machine to manage
    #[arg(short = 'n', long, global = true, env = "KUBENEST_NAME")]
    name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct ConfigFlags {
    /// Stable IP address of the cluster on the machine network
    #[arg(long, env = "KUBENEST_IP_ADDRESS")]
    ip_address: Option<String>,

    /// Path to an age key file to seed into the machine
    #[arg(long)]
    age_key_file: Option<PathBuf>,

    /// Path to an ssh key file to seed into the machine
    #[arg(long)]
    ssh_key_file: Option<PathBuf>,

    /// Kustomization URL applied by the supervisor on start
    #[arg(long)]
    kustomize_url: Option<String>,

    /// Domain names to bind locally to the cluster address (repeatable)
    #[arg(long = "domain-name")]
    domain_name: Vec<String>,

    /// Hosts to seed into the machine's known_hosts (repeatable)
    #[arg(long = "ssh-hosts")]
    ssh_hosts: Vec<String>,
}

#[derive(Args)]
struct InstallArgs {
    /// Root filesystem tarball to install from
    #[arg(short = 'r', long)]
    root: Option<PathBuf>,

    #[command(flatten)]
    config: ConfigFlags,
}

#[derive(Args)]
struct StartArgs {
    /// Root filesystem tarball to install from
    #[arg(short = 'r', long)]
    root: Option<PathBuf>,

    /// Seconds to wait for the cluster to settle (0 = don't wait)
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    #[command(flatten)]
    config: ConfigFlags,
}

#[derive(Args)]
struct StatusArgs {
    /// Keep polling until all workloads settle
    #[arg(short = 'w', long)]
    wait: bool,

    /// Seconds to wait with --wait
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    /// Watch pod-level readiness instead of workload rollout status
    #[arg(long)]
    pods: bool,
}

#[derive(Args)]
struct UpdateArgs {
    /// Root filesystem tarball to refresh
    #[arg(short = 'r', long)]
    root: Option<PathBuf>,
}

#[derive(Args)]
struct ConfigureArgs {
    #[command(flatten)]
    config: ConfigFlags,

    #[command(subcommand)]
    action: Option<ConfigureAction>,
}

#[derive(Subcommand)]
enum ConfigureAction {
    /// Route the cluster address through the machine gateway
    Route {
        address: Option<String>,
        #[arg(short, long)]
        remove: bool,
    },
    /// Bind domain names to the cluster address
    Domains {
        domains: Vec<String>,
        #[arg(long)]
        ip_address: Option<String>,
        #[arg(short, long)]
        remove: bool,
    },
    /// Set the kustomization URL applied on start
    Kustomize { url: String },
    /// Seed an age key file into the machine
    Age { key_file: PathBuf },
    /// Seed an ssh key file into the machine
    Ssh { key_file: PathBuf },
    /// Seed hosts into the machine's known_hosts
    SshHosts { hosts: Vec<String> },
    /// Print the effective configuration as TOML
    Print,
    /// Run the elevated server on the given socket (internal; requires an
    /// elevated process)
    #[command(hide = true)]
    Elevate { socket_path: PathBuf },
}

#[derive(Subcommand)]
enum Command {
    /// Install the machine without starting the cluster
    Install(InstallArgs),
    /// Start the cluster, installing it first if needed
    Start(StartArgs),
    /// Stop the cluster and the machine
    Stop,
    /// Current status of the cluster
    Status(StatusArgs),
    /// Remove the machine and its local state
    Uninstall,
    /// Refresh the root filesystem against the published release
    Update(UpdateArgs),
    /// Configure the cluster and its host integration
    Configure(ConfigureArgs),
    /// Print the version number
    Version,
}

fn effective_options(flags: &ConfigFlags, settings: &Settings) -> ConfigureOptions {
    let defaults = ConfigureOptions::default();
    ConfigureOptions {
        address: flags
            .ip_address
            .clone()
            .or_else(|| settings.ip_address.clone())
            .unwrap_or(defaults.address),
        age_key_file: flags
            .age_key_file
            .clone()
            .or_else(|| settings.age_key_file.clone()),
        ssh_key_file: flags
            .ssh_key_file
            .clone()
            .or_else(|| settings.ssh_key_file.clone()),
        kustomize_url: flags
            .kustomize_url
            .clone()
            .or_else(|| settings.kustomize_url.clone()),
        domains: if flags.domain_name.is_empty() {
            settings.domain_name.clone()
        } else {
            flags.domain_name.clone()
        },
        ssh_hosts: if !flags.ssh_hosts.is_empty() {
            flags.ssh_hosts.clone()
        } else if !settings.ssh_hosts.is_empty() {
            settings.ssh_hosts.clone()
        } else {
            defaults.ssh_hosts
        },
    }
}

fn images_for(root: Option<&PathBuf>, settings: &Settings) -> DiskImages {
    match root.cloned().or_else(|| settings.root.clone()) {
        Some(path) => DiskImages::local(path),
        None => DiskImages::release_tracked(),
    }
}

/// Incremental readiness rendering: a summary plus per-workload lines on
/// the first tick, then only what's still missing, then the full list once
/// everything settles.
fn progress_renderer() -> impl FnMut(bool, usize, &[WorkloadObservation], &[WorkloadObservation]) + Send
{
    let mut ticks = 0usize;
    move |_all_ready, total, ready, unready| {
        if ticks == 0 {
            println!("\n{total} workloads, {} ready, {} unready", ready.len(), unready.len());
            for observation in ready {
                println!("{}", observation.long_line());
            }
        } else if unready.is_empty() {
            println!("\n🎉 All workloads ({total}) ready:");
            for observation in ready {
                println!("{}", observation.long_line());
            }
        } else {
            println!("\n{} unready workloads remaining:", unready.len());
        }
        for observation in unready {
            println!("{}", observation.long_line());
        }
        ticks += 1;
    }
}

async fn wait_for_settle(name: &str, timeout: Duration) -> KubenestResult<()> {
    let handle = ClusterHandle::for_machine(name)?;
    let source = KubectlSource::new(handle);
    let mut render = progress_renderer();
    readiness::wait_for_workloads(&source, timeout, &mut render).await
}

async fn wait_for_pods_settle(name: &str, timeout: Duration) -> KubenestResult<()> {
    let handle = ClusterHandle::for_machine(name)?;
    let source = PodSource::new(handle);
    let mut render = progress_renderer();
    readiness::wait_for_pods(&source, timeout, &mut render).await
}

struct Context<'a> {
    platform: &'a dyn MachinePlatform,
    bridge: &'a ElevationBridge,
    settings: &'a Settings,
    name: String,
    verbosity: String,
}

/// Owns the collaborators for one lifecycle driver so they outlive it.
struct Assembly<'a> {
    images: DiskImages,
    configurator: StandardConfigurator<'a>,
    credentials: KubeCredentials<'a>,
}

impl<'a> Assembly<'a> {
    fn new(ctx: &Context<'a>, images: DiskImages, options: ConfigureOptions) -> Self {
        Self {
            images,
            configurator: StandardConfigurator {
                platform: ctx.platform,
                bridge: ctx.bridge,
                options,
            },
            credentials: KubeCredentials {
                platform: ctx.platform,
            },
        }
    }

    /// Assembly with default images and options, enough for the read-only
    /// and teardown commands.
    fn bare(ctx: &Context<'a>) -> Self {
        Self::new(ctx, DiskImages::release_tracked(), ConfigureOptions::default())
    }

    fn lifecycle(&self) -> Lifecycle<'_> {
        Lifecycle {
            platform: self.configurator.platform,
            images: &self.images,
            configurator: &self.configurator,
            credentials: &self.credentials,
        }
    }
}

async fn dispatch(command: &Command, ctx: &Context<'_>) -> KubenestResult<()> {
    match command {
        Command::Install(args) => {
            let assembly = Assembly::new(
                ctx,
                images_for(args.root.as_ref(), ctx.settings),
                effective_options(&args.config, ctx.settings),
            );
            assembly.lifecycle().install(&ctx.name).await?;
            println!("Machine {} installed.", ctx.name);
            Ok(())
        }

        Command::Start(args) => {
            let assembly = Assembly::new(
                ctx,
                images_for(args.root.as_ref(), ctx.settings),
                effective_options(&args.config, ctx.settings),
            );
            assembly.lifecycle().start(&ctx.name, &ctx.verbosity).await?;

            let timeout = args
                .timeout
                .or(ctx.settings.timeout)
                .unwrap_or(DEFAULT_WAIT_TIMEOUT);
            if timeout > 0 {
                if let Err(err) = wait_for_settle(&ctx.name, Duration::from_secs(timeout)).await {
                    tracing::info!(
                        machine = %ctx.name,
                        "to continue waiting, issue the following command: kubenest status --wait"
                    );
                    return Err(err);
                }
            } else {
                tracing::info!(machine = %ctx.name, "no wait for cluster settling");
            }
            Ok(())
        }

        Command::Stop => {
            let assembly = Assembly::bare(ctx);
            assembly.lifecycle().stop(&ctx.name).await
        }

        Command::Status(args) => {
            let assembly = Assembly::bare(ctx);
            let status = assembly.lifecycle().status(&ctx.name).await?;
            println!("Cluster {} is {}.", ctx.name, status);
            if status != ClusterStatus::Started {
                return Ok(());
            }
            if args.wait {
                let timeout = args
                    .timeout
                    .or(ctx.settings.timeout)
                    .unwrap_or(DEFAULT_WAIT_TIMEOUT);
                if args.pods {
                    wait_for_pods_settle(&ctx.name, Duration::from_secs(timeout)).await
                } else {
                    wait_for_settle(&ctx.name, Duration::from_secs(timeout)).await
                }
            } else {
                let handle = ClusterHandle::for_machine(&ctx.name)?;
                let source = KubectlSource::new(handle);
                use crate::cluster::readiness::WorkloadSource;
                let observations = source.observe().await?;
                let (ready, unready) = readiness::partition(&observations);
                let mut render = progress_renderer();
                render(
                    !observations.is_empty() && unready.is_empty(),
                    observations.len(),
                    &ready,
                    &unready,
                );
                Ok(())
            }
        }

        Command::Uninstall => {
            let assembly = Assembly::bare(ctx);
            assembly.lifecycle().uninstall(&ctx.name).await?;
            println!("Machine {} uninstalled.", ctx.name);
            Ok(())
        }

        Command::Update(args) => {
            let path = args
                .root
                .clone()
                .or_else(|| ctx.settings.root.clone())
                .unwrap_or_else(crate::image::default_image_path);
            crate::image::ensure_image(&path).await
        }

        Command::Configure(args) => configure(args, ctx).await,

        Command::Version => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn configure(args: &ConfigureArgs, ctx: &Context<'_>) -> KubenestResult<()> {
    let options = effective_options(&args.config, ctx.settings);

    match &args.action {
        None => {
            let status = crate::cluster::cluster_status(ctx.platform, &ctx.name).await?;
            if status == ClusterStatus::Uninstalled {
                return Err(KubenestError::InvalidState(format!(
                    "machine {} is not installed",
                    ctx.name
                )));
            }
            hostcfg::configure(ctx.platform, ctx.bridge, &ctx.name, &options).await
        }

        Some(ConfigureAction::Route { address, remove }) => {
            let address = address.clone().unwrap_or(options.address);
            hostcfg::route::route_to_machine(ctx.platform, ctx.bridge, &ctx.name, &address, *remove)
                .await
        }

        Some(ConfigureAction::Domains {
            domains,
            ip_address,
            remove,
        }) => {
            let address = ip_address.clone().unwrap_or(options.address);
            let bound =
                hostcfg::configure_domains(ctx.bridge, &ctx.name, &address, domains, *remove)
                    .await?;
            if bound.is_empty() {
                println!("No domains bound to {address}.");
            } else {
                for domain in bound {
                    println!("{address} {domain}");
                }
            }
            Ok(())
        }

        Some(ConfigureAction::Kustomize { url }) => {
            hostcfg::configure_kustomize(ctx.platform, &ctx.name, url).await
        }

        Some(ConfigureAction::Age { key_file }) => {
            hostcfg::configure_age_key(ctx.platform, &ctx.name, key_file).await
        }

        Some(ConfigureAction::Ssh { key_file }) => {
            hostcfg::configure_ssh_key(ctx.platform, &ctx.name, key_file).await
        }

        Some(ConfigureAction::SshHosts { hosts }) => {
            let hosts = if hosts.is_empty() {
                options.ssh_hosts.clone()
            } else {
                hosts.clone()
            };
            hostcfg::add_ssh_hosts(ctx.platform, &ctx.name, &hosts).await
        }

        Some(ConfigureAction::Print) => {
            let effective = Settings {
                name: Some(ctx.name.clone()),
                verbosity: Some(ctx.verbosity.clone()),
                ip_address: Some(options.address),
                domain_name: options.domains,
                kustomize_url: options.kustomize_url,
                age_key_file: options.age_key_file,
                ssh_key_file: options.ssh_key_file,
                ssh_hosts: options.ssh_hosts,
                ..ctx.settings.clone()
            };
            print!("{}", effective.to_toml()?);
            Ok(())
        }

        // Handled before the composition root is built.
        Some(ConfigureAction::Elevate { .. }) => Err(KubenestError::Internal(
            "elevate must be handled before dispatch".into(),
        )),
    }
}

/// Entry point: parse, init logging, build the composition root, dispatch,
/// and always attempt the elevation Stop handshake on the way out.
pub async fn run() -> KubenestResult<()> {
    let cli = Cli::parse();
    let settings = settings::load(cli.config.as_deref())?;

    let verbosity = cli
        .verbosity
        .clone()
        .or_else(|| settings.verbosity.clone())
        .unwrap_or_else(|| "info".to_string());
    let logfile = cli.logfile.clone().or_else(|| settings.logfile.clone());
    let json = cli.json || settings.json.unwrap_or(false);
    let _guard = logging::init(&verbosity, logfile.as_deref(), json)?;

    // The elevated server entry point runs before any host-side wiring; it
    // has its own privilege guard.
    if let Command::Configure(args) = &cli.command {
        if let Some(ConfigureAction::Elevate { socket_path }) = &args.action {
            return server::run(socket_path).await;
        }
    }

    let name = cli
        .name
        .clone()
        .or_else(|| settings.name.clone())
        .unwrap_or_else(|| "kubenest".to_string());

    let platform = Machinectl;
    let bridge = ElevationBridge::with_default_launcher();
    let ctx = Context {
        platform: &platform,
        bridge: &bridge,
        settings: &settings,
        name,
        verbosity,
    };

    let result = dispatch(&cli.command, &ctx).await;
    // Best-effort teardown of the elevated peer, errors logged only.
    bridge.shutdown().await;
    result
}
