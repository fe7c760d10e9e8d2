mod spectral;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "spectral",
    version,
    about = "Spectral - virtual-host reverse proxy for Minecraft Java Edition"
)]
struct Cli {
    /// Path to the Spectral config file (.toml/.yaml/.yml). If omitted, uses
    /// SPECTRAL_CONFIG; then auto-detects spectral.toml > spectral.yaml >
    /// spectral.yml from CWD; then falls back to the OS default config dir.
    #[arg(long, env = "SPECTRAL_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    spectral::run(cli.config).await
}
