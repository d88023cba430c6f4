use crate::api::v1alpha1::Xdb;
use crate::controllers::{
    context::Context,
    informer::{self, Notification},
};
use kube::{api::Api, runtime::watcher, ResourceExt};
use std::sync::Arc;
use tracing::*;

/// Dispatches one `Xdb` notification to the lifecycle handlers.
pub async fn handle(notification: Notification<Xdb>, ctx: Arc<Context>) {
    let _timer = ctx.metrics.count_and_measure("xdb");
    ctx.touch().await;

    let (xdb, result) = match notification {
        Notification::Added(xdb) => {
            // already initialized objects come back on every relist and after a restart
            if xdb.status.as_ref().and_then(|s| s.creation_time).is_some() {
                xdb.resync(&ctx).await;
                return;
            }
            info!("Creating Xdb \"{}\" in {}", xdb.name_any(), xdb.namespace().unwrap_or_default());
            let result = xdb.create(&ctx).await;
            (xdb, result)
        }
        Notification::Updated { old, new } => {
            if old.spec == new.spec {
                return;
            }
            info!("Updating Xdb \"{}\" in {}", new.name_any(), new.namespace().unwrap_or_default());
            let result = new.update(&old, &ctx).await;
            (new, result)
        }
        Notification::Deleted(xdb) => {
            info!("Xdb \"{}\" deleted from {}", xdb.name_any(), xdb.namespace().unwrap_or_default());
            let result = xdb.pause(&ctx).await;
            (xdb, result)
        }
    };

    if let Err(e) = result {
        warn!("reconcile of Xdb {} failed: {:?}", xdb.name_any(), e);
        ctx.metrics.reconcile_failure("xdb", &xdb.name_any(), &e);
    }
}

/// Watches `Xdb` objects in all namespaces until the stream ends.
pub async fn run(ctx: Arc<Context>) {
    let api = Api::<Xdb>::all(ctx.client.clone());
    informer::watch(api, watcher::Config::default(), |notification| handle(notification, ctx.clone())).await;
}
