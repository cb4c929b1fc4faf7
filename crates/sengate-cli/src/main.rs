//! Command-line interface for the sengate acquisition gateway.

use anyhow::Result;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;

use sengate_core::{BusConfig, GatewayConfig, StoreConfig};
use sengate_service::Pipeline;

/// Sensor acquisition gateway: polls readings from the key-value store
/// and publishes them on the MQTT bus.
#[derive(Parser, Debug)]
#[command(name = "sengate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Connection and polling options, shared by all commands.
#[derive(ClapArgs, Debug)]
struct ConnectionArgs {
    /// Key-value store URL.
    #[arg(long, env = "SENGATE_STORE_URL", default_value = "redis://127.0.0.1:6379")]
    store_url: String,

    /// Store key holding the reading batch.
    #[arg(long, env = "SENGATE_READING_KEY", default_value = "seninf")]
    reading_key: String,

    /// MQTT broker host.
    #[arg(long, env = "SENGATE_BUS_HOST", default_value = "127.0.0.1")]
    bus_host: String,

    /// MQTT broker port.
    #[arg(long, env = "SENGATE_BUS_PORT", default_value_t = 1883)]
    bus_port: u16,

    /// MQTT username.
    #[arg(long, env = "SENGATE_BUS_USERNAME")]
    bus_username: Option<String>,

    /// MQTT password.
    #[arg(long, env = "SENGATE_BUS_PASSWORD")]
    bus_password: Option<String>,

    /// MQTT client ID. A random suffix is generated when absent.
    #[arg(long, env = "SENGATE_CLIENT_ID")]
    client_id: Option<String>,

    /// Topic prefix for reading and presence topics.
    #[arg(long, env = "SENGATE_TOPIC_PREFIX", default_value = "sengate")]
    topic_prefix: String,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the acquisition pipeline until interrupted.
    Run {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Poll interval in seconds.
        #[arg(long, env = "SENGATE_POLL_INTERVAL", default_value_t = 30)]
        poll_interval: u64,

        /// Skip the device-registration announcement on start.
        #[arg(long)]
        no_register: bool,
    },
    /// Probe both backends once, print a readiness report, and exit
    /// non-zero if either is unreachable.
    Check {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

impl ConnectionArgs {
    fn into_config(self) -> GatewayConfig {
        let store = StoreConfig::new(self.store_url).with_reading_key(self.reading_key);
        let mut bus = BusConfig::new(self.bus_host)
            .with_port(self.bus_port)
            .with_topic_prefix(self.topic_prefix);
        if let (Some(user), Some(pass)) = (self.bus_username, self.bus_password) {
            bus = bus.with_auth(user, pass);
        }
        if let Some(client_id) = self.client_id {
            bus = bus.with_client_id(client_id);
        }
        GatewayConfig::new(store, bus)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.verbose { "sengate=debug" } else { "sengate=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Command::Run {
            connection,
            poll_interval,
            no_register,
        } => {
            let config = connection
                .into_config()
                .with_poll_interval(poll_interval)
                .with_auto_register(!no_register);
            run(config).await
        }
        Command::Check { connection } => {
            let mut config = connection.into_config();
            // A check probes once; the run command owns the retry budget.
            config.store.max_attempts = 1;
            check(config).await
        }
    }
}

async fn run(config: GatewayConfig) -> Result<()> {
    let pipeline = Pipeline::from_config(config);
    pipeline.initialize().await?;
    pipeline.start().await;
    info!("pipeline running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    pipeline.stop().await;

    let stats = pipeline.get_stats().await;
    info!(
        total_published = stats.total_published,
        errors = stats.error_count,
        "final statistics"
    );
    Ok(())
}

async fn check(config: GatewayConfig) -> Result<()> {
    let pipeline = Pipeline::from_config(config);
    let connect = pipeline.initialize().await;
    let report = pipeline.health_check().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    pipeline.stop().await;

    connect.map_err(|e| anyhow::anyhow!("backend check failed: {}", e))
}
