use std::{error::Error, sync::Arc, time::Duration};

use clap::Parser;
use sstunnel::{cipher::Registry, Config, Relay};
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

/// Local SOCKS5 proxy tunnelling to a shadowsocks server.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Local address to accept SOCKS5 clients on
    #[arg(short, long, default_value = "0.0.0.0:1080")]
    local: String,

    /// Shadowsocks server address
    #[arg(short, long, required_unless_present = "list_ciphers")]
    server: Option<String>,

    /// Cipher method
    #[arg(short, long, default_value = sstunnel::cipher::DEFAULT_METHOD)]
    method: String,

    /// Shared password
    #[arg(short, long, env = "SSTUNNEL_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Give up dialing the server after this many seconds
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u64>,

    /// Tear a session down after this many seconds without data in either direction
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Print the supported cipher methods and exit
    #[arg(long)]
    list_ciphers: bool,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            local: self.local,
            server: self.server.unwrap_or_default(),
            method: self.method,
            password: self.password,
            connect_timeout: self.connect_timeout.map(Duration::from_secs),
            idle_timeout: self.idle_timeout.map(Duration::from_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let registry = Arc::new(Registry::with_builtin());

    if args.list_ciphers {
        let mut names: Vec<_> = registry.names().collect();
        names.sort_unstable();
        for name in names {
            println!("{name}");
        }
        return Ok(());
    }

    let config = Arc::new(args.into_config());
    debug!("Starting with {:?}", config);
    let relay = Relay::new(registry, config)?;

    let server = TcpListener::bind(&relay.config().local).await?;
    info!(
        "Serving SOCKS5 on {} via {} ({})",
        server.local_addr()?,
        relay.config().server,
        relay.config().method
    );

    loop {
        let (client, peer) = match server.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("Accept failed: {}", err);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        debug!("Received connection from: {}", peer);
        let session = info_span!("session", %peer);

        let relay = relay.clone();
        tokio::spawn(
            async move {
                if let Err(err) = relay.serve(client).await {
                    warn!("Session failed: {}", err);
                }
            }
            .instrument(session),
        );
    }
}
