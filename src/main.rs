//! FlashMC - A memcached-compatible cache front end
//!
//! This is the main entry point for the FlashMC server.
//! It sets up the backing store, the cache service and the TCP listener,
//! and handles incoming connections.

use flashmc::connection::handle_connection;
use flashmc::service::{ProtocolMode, Service, ServiceConfig, UnknownProtocol};
use flashmc::storage::{SpaceId, StorageEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Space the cache lives in.
const CACHE_SPACE: SpaceId = 512;

/// How long shutdown waits for open connections to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Errors from command-line parsing.
#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("invalid value '{value}' for {flag}")]
    InvalidValue { flag: String, value: String },

    #[error(transparent)]
    Protocol(#[from] UnknownProtocol),

    #[error("unknown argument: {0}")]
    UnknownArgument(String),
}

/// What the command line asked for.
enum Command {
    Serve(Config),
    Help,
    Version,
}

/// Server configuration
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Service name
    name: String,
    /// Service tunables
    service: ServiceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: flashmc::DEFAULT_HOST.to_string(),
            port: flashmc::DEFAULT_PORT,
            name: "cache".to_string(),
            service: ServiceConfig::default(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Result<Command, ConfigError> {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> Result<Command, ConfigError> {
        let mut config = Config::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--host" | "-h" => config.host = value(&arg, args.next())?,
                "--port" | "-p" => config.port = parsed(&arg, args.next())?,
                "--name" => config.name = value(&arg, args.next())?,
                "--readahead" => config.service.readahead = parsed(&arg, args.next())?,
                "--batch-count" => config.service.batch_count = parsed(&arg, args.next())?,
                "--expire-batch" => config.service.expire.batch_size = parsed(&arg, args.next())?,
                "--expire-time" => config.service.expire.time_budget = parsed(&arg, args.next())?,
                "--no-expire" => config.service.expire.enabled = false,
                "--disable-flush" => config.service.flush_enabled = false,
                "--protocol" => {
                    config.service.protocol = value(&arg, args.next())?.parse::<ProtocolMode>()?
                }
                "-v" | "-vv" | "-vvv" => {
                    let level = config.service.verbosity + (arg.len() - 1) as u8;
                    config.service.verbosity = flashmc::service::clamp_verbosity(u32::from(level));
                }
                "--help" => return Ok(Command::Help),
                "--version" | "-V" => return Ok(Command::Version),
                _ => return Err(ConfigError::UnknownArgument(arg)),
            }
        }

        config.service.readahead = config.service.readahead.max(1);
        config.service.batch_count = config.service.batch_count.max(1);
        config.service.expire.batch_size = config.service.expire.batch_size.max(1);
        Ok(Command::Serve(config))
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Log level implied by `-v` flags.
    fn log_level(&self) -> Level {
        match self.service.verbosity {
            0 => Level::INFO,
            1 | 2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

fn value(flag: &str, next: Option<String>) -> Result<String, ConfigError> {
    next.ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
}

fn parsed<T: std::str::FromStr>(flag: &str, next: Option<String>) -> Result<T, ConfigError> {
    let raw = value(flag, next)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: raw,
    })
}

fn print_help() {
    println!(
        r#"
FlashMC - A memcached-compatible cache front end

USAGE:
    flashmc [OPTIONS]

OPTIONS:
    -h, --host <HOST>          Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>          Port to listen on (default: 11211)
        --name <NAME>          Service name (default: cache)
        --readahead <BYTES>    Input buffer read-ahead (default: 16384)
        --batch-count <N>      Pipelined requests per flush (default: 20)
        --expire-batch <N>     Records per expiration batch (default: 50)
        --expire-time <SECS>   Target duration of a full sweep (default: 3600)
        --no-expire            Disable the background expiration task
        --disable-flush        Reject flush_all
        --protocol <MODE>      text, binary or negotiate (default: negotiate)
    -v, -vv, -vvv              Increase verbosity
    -V, --version              Print version information
        --help                 Print this help message

Set RUST_LOG to override the log filter.

EXAMPLES:
    flashmc                        # Start on 127.0.0.1:11211
    flashmc --port 11212           # Start on port 11212
    flashmc --host 0.0.0.0         # Listen on all interfaces

CONNECTING:
    Any memcached client works, or plain telnet:
    $ telnet 127.0.0.1 11211
    set name 0 0 4
    Ariz
    STORED
    get name
    VALUE name 0 4
    Ariz
    END
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
FlashMC v{} - memcached-compatible cache
──────────────────────────────────────────
Server started on {}
Protocol: {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        flashmc::VERSION,
        config.bind_address(),
        config.service.protocol
    );
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match EnvFilter::try_from_default_env() {
        Ok(filter) => builder.with_env_filter(filter).try_init(),
        Err(_) => builder.with_max_level(config.log_level()).try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = match Config::from_args() {
        Ok(Command::Serve(config)) => config,
        Ok(Command::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Command::Version) => {
            println!("FlashMC version {}", flashmc::VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    // Set up logging
    init_tracing(&config)?;

    // Create the backing store and the cache space
    let store = Arc::new(StorageEngine::new());
    store.create_space(CACHE_SPACE, &config.name)?;

    // Create the service and start its expiration task
    let service = Service::with_config(config.name.clone(), CACHE_SPACE, store, config.service);
    service.start()?;
    info!(service = %config.name, space = CACHE_SPACE, "Service initialized");

    // Bind the TCP listener
    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("Listening on {}", config.bind_address());

    // Print the banner
    print_banner(&config);

    // Set up graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    // Main accept loop
    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&service)) => {}
        _ = shutdown => {}
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, Arc::clone(&service).destroy())
        .await
        .is_err()
    {
        warn!(
            connections = service.stats().current_connections(),
            "Connections still open after grace period"
        );
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Main loop that accepts incoming connections
async fn accept_loop(listener: TcpListener, service: Arc<Service>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                }

                // Spawn a task to handle this connection
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    handle_connection(stream, addr, service).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
