use anyhow::Result;
use cardvault::{config::Config, ui};
use clap::Parser;
use env_logger::Env;
use log::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = ui::Cli::parse();

    // Config file level is the default; RUST_LOG still overrides.
    let level = Config::load_config_file()
        .ok()
        .and_then(|file| file.logging.level)
        .unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();

    info!("starting cardvault CLI");
    ui::run_cli(cli).await
}
