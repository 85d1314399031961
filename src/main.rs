//! Netbot CLI entry point
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 bind failure,
//! 3 fatal runtime error.

use clap::Parser;
use netbot::{App, Config, Error, ListenOverrides, OutboundMode, VERSION};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;
const EXIT_RUNTIME: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "netbot")]
#[command(version = VERSION)]
#[command(about = "User-space multi-protocol proxy")]
struct Args {
    /// SOCKS5 listen address (overrides config)
    #[arg(long = "socks-listen-address")]
    socks_listen_address: Option<String>,

    /// SOCKS5 listen port (overrides config)
    #[arg(long = "socks-listen-port")]
    socks_listen_port: Option<u16>,

    /// HTTP proxy listen address (overrides config)
    #[arg(long = "http-listen-address")]
    http_listen_address: Option<String>,

    /// HTTP proxy listen port (overrides config)
    #[arg(long = "http-listen-port")]
    http_listen_port: Option<u16>,

    /// Path to the JSON configuration file
    #[arg(long = "config-file")]
    config_file: Option<PathBuf>,

    /// Outbound selection: direct, proxy or rule
    #[arg(long = "outbound-mode", default_value = "rule")]
    outbound_mode: String,

    /// Comma-separated request message filter (capture tooling)
    #[arg(long = "req-msg-filter")]
    req_msg_filter: Option<String>,

    /// Enable HTTP request capture
    #[arg(long = "enable-http-capture")]
    enable_http_capture: bool,

    /// Enable TLS MitM for capture
    #[arg(long = "enable-mitm")]
    enable_mitm: bool,
}

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("netbot-worker")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build runtime: {}", e);
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    runtime.block_on(async_main())
}

async fn async_main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("netbot=info")),
        )
        .init();

    let args = Args::parse();
    info!("netbot v{}", VERSION);

    let mut config = match &args.config_file {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            match Config::load(path) {
                Ok(c) => c,
                Err(e) => {
                    error!("failed to load configuration: {}", e);
                    return ExitCode::from(EXIT_CONFIG);
                }
            }
        }
        None => Config::default(),
    };

    // Capture toggles ride in the replica section; the core only
    // validates and records them.
    if args.enable_http_capture {
        config.replica.enable_http_capture = true;
    }
    if args.enable_mitm {
        config.replica.enable_mitm = true;
    }
    if let Some(filter) = args.req_msg_filter {
        config.replica.req_msg_filter = Some(filter);
    }

    let mode = match OutboundMode::try_from(args.outbound_mode.as_str()) {
        Ok(m) => m,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let overrides = ListenOverrides {
        socks_address: args.socks_listen_address,
        socks_port: args.socks_listen_port,
        http_address: args.http_listen_address,
        http_port: args.http_listen_port,
    };

    let app = match App::new(config, mode, overrides) {
        Ok(app) => app,
        Err(e) => {
            error!("initialization failed: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match app.run().await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(Error::Connection(msg)) if msg.contains("bind") => {
            error!("bind failure: {}", msg);
            ExitCode::from(EXIT_BIND)
        }
        Err(Error::Config(msg)) => {
            error!("configuration error: {}", msg);
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            error!("fatal: {}", e);
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}
