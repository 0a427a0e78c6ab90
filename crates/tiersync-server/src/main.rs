use std::{env, sync::Arc};

use tiersync_server::TiersyncServer;
use tiersync_server::config::loader::{DEFAULT_CONFIG_PATH, load_config};
use tiersync_server::scenarios::build_registry;

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From TIERSYNC_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (tiersync.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (TIERSYNC_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let log_level = tiersync_server::observability::init_tracing();

    let (config_path, source) = resolve_config_path();
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    tracing::info!(
        path = %config_path,
        source = %source,
        backend = ?cfg.scenario.backend,
        bus_mode = %cfg.bus.mode,
        "Configuration loaded"
    );
    log_level.apply(&cfg.logging.level);

    let registry = match build_registry(&cfg) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            eprintln!("Scenario registration failed: {e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = registry.initialize_all().await {
        eprintln!("Scenario initialization failed: {e}");
        std::process::exit(2);
    }

    if let Err(err) = TiersyncServer::new(&cfg, registry).run().await {
        eprintln!("Server error: {err}");
    }
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: TIERSYNC_CONFIG
/// 3. Default: tiersync.toml
fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config"
            && let Some(path) = args.next()
        {
            return (path, ConfigSource::CliArgument);
        }
    }

    if let Ok(path) = env::var("TIERSYNC_CONFIG")
        && !path.is_empty()
    {
        return (path, ConfigSource::EnvironmentVariable);
    }

    (DEFAULT_CONFIG_PATH.to_string(), ConfigSource::Default)
}
