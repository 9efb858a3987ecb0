use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use tunlink::config::Config;
use tunlink::engine::{CredentialVerifier, MinLength, RejectAll, TlsProbeEngine};
use tunlink::probe::IpProbe;
use tunlink::route::{RouteTable, platform_backend};
use tunlink::session::{Session, Status};
use tunlink::tun::NativeTunProvider;

#[derive(Parser)]
#[command(name = "tunlink")]
#[command(about = "VPN client session manager: tunnel device and route lifecycle")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, bring the tunnel up and hold it until Ctrl-C
    Connect {
        /// Server hostname (overrides the config file)
        #[arg(long)]
        host: Option<String>,
        /// Server port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
        /// Username for authentication
        #[arg(short, long)]
        user: Option<String>,
        /// Config file path (defaults to the user config directory)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Accept credentials by an offline length check instead of the
        /// protocol engine. Diagnostic use only.
        #[arg(long)]
        offline_auth: bool,
    },
    /// Ask the public lookup services for this host's external address
    ProbeIp,
    /// Generate a default config file
    Init {
        /// Where to write the config (defaults to the user config directory)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Connect {
            host,
            port,
            user,
            config,
            offline_auth,
        } => {
            let config = load_config(config)?;
            init_logging(cli.verbose, &config.log_level)?;
            run_connect(config, host, port, user, offline_auth)
        }
        Commands::ProbeIp => {
            init_logging(cli.verbose, "info")?;
            match IpProbe::default().probe() {
                Ok(ip) => {
                    println!("{ip}");
                    Ok(())
                }
                Err(e) => {
                    error!("Public IP lookup failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Init { path } => {
            init_logging(cli.verbose, "info")?;
            let path = path
                .or_else(Config::default_path)
                .ok_or("could not determine a config location")?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut config = Config::default();
            config.server.hostname = "vpn.example.net".to_string();
            config.save(&path)?;
            println!("Created default config: {}", path.display());
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, configured: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        Level::DEBUG
    } else {
        configured.parse().unwrap_or(Level::INFO)
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = match path {
        Some(path) => path,
        None => {
            let default = Config::default_path().ok_or("could not determine a config location")?;
            if !default.exists() {
                return Err(format!(
                    "no config at {}; run `tunlink init` first",
                    default.display()
                )
                .into());
            }
            default
        }
    };
    Ok(Config::load(&path)?)
}

fn run_connect(
    mut config: Config,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    offline_auth: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(host) = host {
        config.server.hostname = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let username = match user {
        Some(user) => user,
        None => config.auth.username.clone(),
    };
    let password = match config.auth.password.clone() {
        Some(password) => password,
        None => rpassword::prompt_password("Password: ")?,
    };

    let verifier: Box<dyn CredentialVerifier> = if offline_auth {
        warn!("Offline credential verification enabled; diagnostic use only");
        Box::new(MinLength(3))
    } else {
        Box::new(RejectAll)
    };
    let engine = Box::new(TlsProbeEngine::new(
        config.server.hub.clone(),
        Duration::from_secs(config.server.timeout_secs),
        verifier,
    ));

    let hostname = config.server.hostname.clone();
    let port = config.server.port;
    let mut session = Session::with_parts(
        config,
        engine,
        Box::new(NativeTunProvider::new()),
        RouteTable::new(platform_backend()),
    )?;

    session.connect(&hostname, port)?;
    session.authenticate(&username, &password)?;

    if let Err(e) = session.establish_tunnel() {
        if session.status() == Status::Tunneling {
            warn!("Continuing with a degraded tunnel: {}", e);
        } else {
            session.disconnect()?;
            return Err(e.into());
        }
    }
    match session.describe_tunnel_interface() {
        Ok(descriptor) => println!("Tunnel up: {descriptor}"),
        Err(_) => println!("Tunnel up (app-managed mode)"),
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })?;
    info!("Press Ctrl-C to disconnect");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    session.close_tunnel()?;
    session.disconnect()?;
    println!("Disconnected");
    Ok(())
}
