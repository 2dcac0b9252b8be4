use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use ::config::{Config as ConfigSource, Environment, File};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use kasa_manager::config::FileConfigStore;
use kasa_manager::event::EventChannel;
use kasa_manager::facade::Handle;
use kasa_manager::manager::Manager;
use kasa_manager::web::{self, AppState};

fn default_bind() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("valid default bind address")
}

fn default_proxy() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "kasa-manager".to_string())
}

fn default_config_path() -> PathBuf {
    PathBuf::from("kasa-manager.json")
}

/// Process-level settings (A1): HTTP bind address, the announce/proxy name
/// surfaced in `/kasa/status`, and the path to the runtime document the
/// configuration bridge reads and writes through.
#[derive(Debug, Clone, Deserialize)]
struct Settings {
    #[serde(default = "default_bind")]
    bind: SocketAddr,
    #[serde(default = "default_proxy")]
    proxy: String,
    #[serde(default = "default_config_path")]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("{err}");
        let mut cause = err.source();
        while let Some(c) = cause {
            error!("caused by: {c}");
            cause = c.source();
        }
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let settings: Settings = ConfigSource::builder()
        .add_source(File::with_name("kasa-manager").required(false))
        .add_source(
            Environment::default()
                .prefix("KASA_MANAGER")
                .separator("__"),
        )
        .build()?
        .try_deserialize()?;

    info!(bind = %settings.bind, proxy = %settings.proxy, "starting kasa-manager");

    let events = EventChannel::new();
    let store = Box::new(FileConfigStore::new(&settings.config_path));
    let manager = Manager::bind(events, store).await?;

    let (commands, receiver) = mpsc::channel(64);
    tokio::spawn(manager.run(receiver));

    let app_state = AppState {
        manager: Handle::new(commands),
        proxy: settings.proxy,
    };
    let app = web::router(app_state);

    let listener = TcpListener::bind(settings.bind).await?;
    info!("listening on http://{}", settings.bind);
    axum::serve(listener, app).await?;

    Ok(())
}
