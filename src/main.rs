//! rust-resolver: policy-driven DNS resolver
//!
//! Loads a configuration, builds the resolver and either resolves the hosts
//! given on the command line or stays up holding the fake-IP pool until
//! shutdown.
//!
//! # Usage
//!
//! ```bash
//! # Resolve hosts with the configured policies
//! ./rust-resolver -c /path/to/config.json example.com github.com
//!
//! # Only IPv4 / only IPv6
//! ./rust-resolver -4 example.com
//! ./rust-resolver -6 example.com
//!
//! # Run with environment overrides
//! RUST_RESOLVER_LOG_LEVEL=debug ./rust-resolver example.com
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use rust_resolver::config::{load_config_with_env, Config};
use rust_resolver::dns::{self, registry, Registry};

/// Which address family to print
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Any,
    V4,
    V6,
}

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Address family for lookups
    family: Family,
    /// Hosts to resolve
    hosts: Vec<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/rust-resolver/config.json");
        let mut generate_config = false;
        let mut check_config = false;
        let mut family = Family::Any;
        let mut hosts = Vec::new();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-4" => family = Family::V4,
                "-6" => family = Family::V6,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("rust-resolver v{}", rust_resolver::VERSION);
                    std::process::exit(0);
                }
                other if other.starts_with('-') => {
                    eprintln!("Unknown argument: {other}");
                    print_help();
                    std::process::exit(1);
                }
                host => hosts.push(host.to_owned()),
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
            family,
            hosts,
        }
    }
}

fn print_help() {
    println!(
        r#"rust-resolver v{}

Policy-driven DNS resolver with fake-IP allocation.

USAGE:
    rust-resolver [OPTIONS] [HOST...]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/rust-resolver/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -4                      Print IPv4 addresses only
    -6                      Print IPv6 addresses only
    -h, --help              Print help information
    -v, --version           Print version information

Without HOST the resolver stays up until SIGINT/SIGTERM and persists the
fake-IP pool state on exit.

ENVIRONMENT:
    RUST_RESOLVER_LOG_LEVEL      Override log level (trace, debug, info, warn, error)
    RUST_RESOLVER_IPV6           Override dns.ipv6 (true, false)
    RUST_RESOLVER_ENHANCED_MODE  Override dns.enhanced-mode (normal, mapping, fake-ip)
"#,
        rust_resolver::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "h2=warn", "quinn=warn", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_writer(std::io::stderr);

    if config.log.is_json() {
        subscriber.json().init();
    } else if config.log.timestamps {
        subscriber.init();
    } else {
        subscriber.without_time().init();
    }
}

async fn resolve_hosts(registry: &Registry, hosts: &[String], family: Family) -> bool {
    let Some(resolver) = registry.resolver() else {
        error!("no resolver installed");
        return false;
    };

    let mut ok = true;
    for host in hosts {
        let result = match family {
            Family::Any => resolver.lookup_ip(host).await,
            Family::V4 => resolver.lookup_ipv4(host).await,
            Family::V6 => resolver.lookup_ipv6(host).await,
        };
        match result {
            Ok(ips) => {
                for ip in ips {
                    println!("{host}\t{ip}");
                }
            }
            Err(e) => {
                ok = false;
                eprintln!("{host}\t{e}");
            }
        }
    }
    ok
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        rust_resolver::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config_path))?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("rust-resolver v{}", rust_resolver::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let components = dns::build(&config.dns, None).context("Failed to build DNS resolver")?;
    let registry = Arc::new(Registry::new());
    registry.install(components);
    if registry::install_global(Arc::clone(&registry)).is_err() {
        error!("global dns registry already installed");
    }

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    if !args.hosts.is_empty() {
        let ok = resolve_hosts(&registry, &args.hosts, args.family).await;
        if let Some(enhancer) = registry.enhancer() {
            enhancer.store_fake_pool_state();
        }
        if !ok {
            std::process::exit(2);
        }
        return Ok(());
    }

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT, initiating shutdown..."),
        () = wait_for_sigterm() => info!("Received SIGTERM, initiating shutdown..."),
    }

    if let Some(enhancer) = registry.enhancer() {
        enhancer.store_fake_pool_state();
    }
    if let Some(resolver) = registry.resolver() {
        resolver.reset_connection().await;
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
