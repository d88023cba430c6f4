pub mod context;
pub mod crd;
pub mod dormant;
pub mod dormant_controller;
pub mod events;
pub mod informer;
pub mod jobs;
pub mod monitor;
pub mod rbac;
pub mod scheduler;
pub mod snapshot;
pub mod snapshot_controller;
pub mod workload;
pub mod xdb;
pub mod xdb_controller;

use crate::config::Config;
use crate::util::errors::Result;
use context::{Integrations, State};
use crd::ensure_custom_resource_definitions;
use kube::client::Client;
use tracing::*;

/// Registers the resource types and runs the three watch loops until ctrl-c.
pub async fn run(state: State, config: Config) -> Result<()> {
    let client = Client::try_default().await?;
    ensure_custom_resource_definitions(&client, config.readiness_poll()).await?;

    let integrations = Integrations::new(&client);
    let ctx = state.to_context(client, config, integrations)?;

    tokio::select! {
        _ = xdb_controller::run(ctx.clone()) => warn!("Xdb watch stopped"),
        _ = dormant_controller::run(ctx.clone()) => warn!("DormantDatabase watch stopped"),
        _ = snapshot_controller::run(ctx.clone()) => warn!("Snapshot watch stopped"),
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    ctx.scheduler.stop_all();
    Ok(())
}
