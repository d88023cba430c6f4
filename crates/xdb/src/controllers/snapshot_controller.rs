use crate::api::{
    v1alpha1::{Snapshot, Xdb},
    LABEL_DATABASE_KIND,
};
use crate::controllers::{
    context::Context,
    informer::{self, Notification},
};
use kube::{api::Api, Resource, ResourceExt};
use std::sync::Arc;
use tracing::*;

/// Dispatches one `Snapshot` notification. Spec updates are ignored, as are snapshots of other
/// database kinds.
pub async fn handle(notification: Notification<Snapshot>, ctx: Arc<Context>) {
    let snapshot = match &notification {
        Notification::Added(s) | Notification::Deleted(s) | Notification::Updated { new: s, .. } => s,
    };
    if !informer::has_label(&**snapshot, LABEL_DATABASE_KIND, &Xdb::kind(&())) {
        return;
    }
    let _timer = ctx.metrics.count_and_measure("snapshot");
    ctx.touch().await;

    let (snapshot, result) = match notification {
        Notification::Added(snapshot) => {
            // started by an earlier run of the operator
            if snapshot.status.as_ref().and_then(|s| s.start_time).is_some() {
                snapshot.resume_supervision(ctx.clone());
                return;
            }
            info!("Starting Snapshot \"{}\" in {}", snapshot.name_any(), snapshot.namespace().unwrap_or_default());
            let result = snapshot.start(ctx.clone()).await;
            (snapshot, result)
        }
        Notification::Updated { .. } => return,
        Notification::Deleted(snapshot) => {
            info!("Removing data of Snapshot \"{}\"", snapshot.name_any());
            let result = snapshot.remove_data(&ctx).await;
            (snapshot, result)
        }
    };

    if let Err(e) = result {
        warn!("reconcile of Snapshot {} failed: {:?}", snapshot.name_any(), e);
        ctx.metrics.reconcile_failure("snapshot", &snapshot.name_any(), &e);
    }
}

pub async fn run(ctx: Arc<Context>) {
    let api = Api::<Snapshot>::all(ctx.client.clone());
    let config = informer::labelled(LABEL_DATABASE_KIND, &Xdb::kind(&()));
    informer::watch(api, config, |notification| handle(notification, ctx.clone())).await;
}
