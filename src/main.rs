use clap::Parser;
use log::{error, info, warn};
use sensd::config::Settings;
use std::path::PathBuf;

/// sensd - streams system metrics from provider modules to TCP clients
#[derive(Parser, Debug, Clone)]
#[command(name = "sensd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the listening port
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Override the native module directory
    #[arg(long = "plugin-dir", value_name = "DIR")]
    plugin_dir: Option<PathBuf>,

    /// Debug verbosity level (0=quiet, 1=info, 2=debug, 3=trace)
    #[arg(short = 'd', long = "debug", value_name = "LEVEL", default_value = "0")]
    debug: u8,
}

impl Cli {
    /// Read settings and apply command line overrides
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load_from_path(path)?,
            None => Settings::load()?,
        };
        if let Some(port) = self.port {
            settings.listen.port = port;
        }
        if let Some(dir) = &self.plugin_dir {
            settings.plugin_dir = Some(dir.clone());
        }
        Ok(settings)
    }
}

fn main() {
    let cli = Cli::parse();

    // Level 0 (default): warn only
    // Level 1: info
    // Level 2: debug
    // Level 3+: trace
    let log_level = match cli.debug {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // Allow RUST_LOG to override CLI setting
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    warn!("Starting sensd v{}", env!("CARGO_PKG_VERSION"));

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(sensd::daemon::run(|| cli.settings())) {
        error!("{:#}", e);
        std::process::exit(1);
    }
    info!("Exiting");
}
