use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use tracing::info;

use monochromate_core::{
    alarms::TokioAlarms,
    api::{self, AppState},
    background::{Background, BackgroundConfig},
    store::{SettingsStore, SqliteBackend},
    tabs::TabRegistry,
};

const DEFAULT_PORT: u16 = 17611;

#[derive(Parser, Debug)]
#[command(name = "monochromate_core", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17611
    /// - ip (implies port 17611), e.g. 127.0.0.1
    /// - localhost or localhost:port
    #[arg(long, default_value = "127.0.0.1:17611")]
    listen: String,

    /// SQLite database path.
    #[arg(long, default_value = "./data/monochromate.db")]
    db: PathBuf,

    /// Delay before a bulk apply pass, in milliseconds.
    #[arg(long, default_value_t = 100)]
    debounce_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "monochromate_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let addr = parse_listen(&args.listen)?;

    let backend = SqliteBackend::open(&args.db)?;
    let store = Arc::new(SettingsStore::open(Arc::new(backend))?);
    let tabs = Arc::new(TabRegistry::new());
    let (alarms, fired) = TokioAlarms::new();
    let background = Background::new(
        store,
        tabs.clone(),
        Arc::new(alarms),
        BackgroundConfig {
            debounce: Duration::from_millis(args.debounce_ms),
        },
    );
    let reactions = background.start(fired).await?;

    let app = api::router(AppState::new(background, tabs));

    info!("Core listening on http://{addr}");
    info!("DB: {}", args.db.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    reactions.abort();
    Ok(())
}

fn bad_port(input: &str) -> anyhow::Error {
    anyhow::anyhow!("invalid --listen '{input}': bad port. Example: 127.0.0.1:{DEFAULT_PORT}")
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }
    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    if let Some((host, port)) = input.rsplit_once(':') {
        let ip = if host == "localhost" {
            Some(IpAddr::from([127, 0, 0, 1]))
        } else {
            // IPv6 without brackets, e.g. ::1:17611
            host.parse::<IpAddr>().ok()
        };
        if let Some(ip) = ip {
            let port: u16 = port.parse().map_err(|_| bad_port(input))?;
            return Ok(SocketAddr::new(ip, port));
        }
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{input}'. Use ip:port (e.g. 127.0.0.1:{DEFAULT_PORT}) or ip (e.g. 127.0.0.1)."
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
