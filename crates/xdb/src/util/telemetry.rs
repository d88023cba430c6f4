use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Initialize tracing
///
/// `format` selects the output layer: `json` for structured logs, anything else for compact text.
pub async fn init(format: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or(EnvFilter::try_new("info"))
        .unwrap_or_default();

    let result = match format {
        Some("json") => {
            let logger = tracing_subscriber::fmt::layer().json();
            tracing::subscriber::set_global_default(Registry::default().with(logger).with(env_filter))
        }
        _ => {
            let logger = tracing_subscriber::fmt::layer().compact();
            tracing::subscriber::set_global_default(Registry::default().with(logger).with(env_filter))
        }
    };

    if let Err(e) = result {
        eprintln!("tracing already initialized: {e}");
    }
}
