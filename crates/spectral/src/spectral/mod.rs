pub mod admin;
pub mod app;
pub mod backend;
pub mod config;
pub mod keys;
pub mod limiter;
pub mod listener;
pub mod logging;
pub mod manager;
pub mod net;
pub mod protocol;
pub mod proxyproto;
pub mod realip;
pub mod state;
pub mod status;
pub mod telemetry;
pub mod worker;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
