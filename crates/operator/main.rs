use envconfig::Envconfig;
use tracing::error;
use xdb::{
    config::Config,
    controllers::{self, context::State},
    util::telemetry,
};

mod handlers;
mod server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env()?;
    telemetry::init(config.log_format.as_deref()).await;

    // Initialize Kubernetes controller state
    let state = State::default();
    let server = server::build_server(state.clone(), &config.http_address)?;
    let handle = server.handle();

    let operator = async move {
        let result = controllers::run(state, config).await;
        // stop serving once the controllers exit
        handle.stop(true).await;
        result
    };

    let (operator, server) = tokio::join!(operator, server);
    if let Err(e) = &operator {
        error!("operator stopped: {}", e);
    }
    operator?;
    server?;
    Ok(())
}
