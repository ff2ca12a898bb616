//! Command-line front end: install, lifecycle, and health-check
//! subcommands mapped onto the library. Non-interactive by design;
//! results are reported through exit status and log lines.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use clashman::{
    EngineConfig, EnginePaths, Installer, ProbeResult, Prober, ProxyServer, ReleaseTarget,
    ServiceState, Supervisor,
};

#[derive(Parser)]
#[command(name = "clashman", version, about = "Install and supervise the mihomo proxy engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and install the engine binary
    Install {
        /// Release tag to install instead of the latest
        #[arg(long)]
        version: Option<String>,
    },
    /// Start the engine
    Start,
    /// Stop the engine
    Stop,
    /// Restart the engine
    Restart,
    /// Show the engine's reconciled state
    Status,
    /// Probe the control API, direct and proxied routes, and DNS
    Test,
    /// Add a shadowsocks server to the configuration
    AddSs {
        #[arg(long)]
        name: String,
        #[arg(long)]
        server: String,
        #[arg(long)]
        port: u16,
        #[arg(long)]
        password: String,
        #[arg(long, default_value = "aes-256-gcm")]
        cipher: String,
    },
    /// Add a vmess server to the configuration
    AddVmess {
        #[arg(long)]
        name: String,
        #[arg(long)]
        server: String,
        #[arg(long)]
        port: u16,
        #[arg(long)]
        uuid: String,
        #[arg(long, default_value = "/")]
        ws_path: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> clashman::Result<()> {
    let paths = EnginePaths::new();

    match cli.command {
        Commands::Install { version } => {
            let target = ReleaseTarget::detect()?;
            let installer = Installer::new();
            let binary = installer
                .install_release(&target, version.as_deref())
                .await?;
            println!(
                "installed {} ({})",
                binary.path.display(),
                binary.version.as_deref().unwrap_or("unknown")
            );
        }

        Commands::Start => {
            let mut supervisor = make_supervisor(&paths)?;
            ensure_config(&paths)?;
            let handle = supervisor.start()?;
            println!("engine running (pid {})", handle.pid);
            print_endpoints(&paths);
        }

        Commands::Stop => {
            let mut supervisor = make_supervisor(&paths)?;
            supervisor.stop()?;
            println!("engine stopped");
        }

        Commands::Restart => {
            let mut supervisor = make_supervisor(&paths)?;
            let handle = supervisor.restart()?;
            println!("engine running (pid {})", handle.pid);
        }

        Commands::Status => {
            let mut supervisor = make_supervisor(&paths)?;
            let status = supervisor.status();
            match status.pid {
                Some(pid) => println!("engine: {} (pid {pid})", status.state.as_str()),
                None => println!("engine: {}", status.state.as_str()),
            }
            if status.state == ServiceState::Running {
                print_endpoints(&paths);
            }
        }

        Commands::Test => {
            let prober = Prober::new();
            let results = prober.probe_all(Prober::default_targets()).await;
            print_probe_report(&results);
        }

        Commands::AddSs {
            name,
            server,
            port,
            password,
            cipher,
        } => {
            add_proxy(
                &paths,
                ProxyServer::shadowsocks(&name, &server, port, &password, &cipher),
            )?;
        }

        Commands::AddVmess {
            name,
            server,
            port,
            uuid,
            ws_path,
        } => {
            add_proxy(
                &paths,
                ProxyServer::vmess(&name, &server, port, &uuid, &ws_path),
            )?;
        }
    }

    Ok(())
}

/// Build a supervisor around the located engine binary. When none is
/// installed yet, the canonical install path is used so start() reports
/// it as the missing precondition.
fn make_supervisor(paths: &EnginePaths) -> clashman::Result<Supervisor> {
    let installer = Installer::new();
    let binary_path: PathBuf = match installer.locate() {
        Some(binary) => binary.path,
        None => {
            let target = ReleaseTarget::detect()?;
            installer.binary_path(&target)
        }
    };
    Ok(Supervisor::new(binary_path, paths.clone()))
}

/// Write the default configuration when none exists yet. An existing
/// file is left untouched, malformed or not.
fn ensure_config(paths: &EnginePaths) -> clashman::Result<()> {
    if !paths.config_file.exists() {
        log::info!("no config found; writing defaults to {}", paths.config_file.display());
        EngineConfig::default().save(&paths.config_file)?;
    }
    Ok(())
}

fn add_proxy(paths: &EnginePaths, spec: ProxyServer) -> clashman::Result<()> {
    let name = spec.name.clone();
    let mut config = EngineConfig::load_or_default(&paths.config_file)?;
    config.add_proxy(spec)?;
    config.save(&paths.config_file)?;
    println!("added '{name}'; restart the engine to apply");
    Ok(())
}

fn print_endpoints(paths: &EnginePaths) {
    // Ports are informational; a malformed config just skips them.
    if let Ok(config) = EngineConfig::load_or_default(&paths.config_file) {
        println!("  http proxy:  127.0.0.1:{}", config.port);
        println!("  socks proxy: 127.0.0.1:{}", config.socks_port);
        println!("  control api: http://{}", config.external_controller);
    }
}

fn print_probe_report(results: &[ProbeResult]) {
    let mut passed = 0;
    for result in results {
        if result.reachable {
            passed += 1;
            println!(
                "  {}: ok ({} ms)",
                result.target,
                result.latency.as_millis()
            );
        } else {
            println!(
                "  {}: failed ({})",
                result.target,
                result.detail.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!("{passed}/{} probes passed", results.len());
}
