use crate::api::{
    v1alpha1::{DormantDatabase, Xdb},
    LABEL_DATABASE_KIND,
};
use crate::controllers::{
    context::Context,
    informer::{self, Notification},
};
use kube::{api::Api, Resource, ResourceExt};
use std::sync::Arc;
use tracing::*;

/// Dispatches one `DormantDatabase` notification of an `Xdb`.
pub async fn handle(notification: Notification<DormantDatabase>, ctx: Arc<Context>) {
    let dormant = match &notification {
        Notification::Added(d) | Notification::Deleted(d) | Notification::Updated { new: d, .. } => d,
    };
    if !informer::has_label(&**dormant, LABEL_DATABASE_KIND, &Xdb::kind(&())) {
        return;
    }
    let _timer = ctx.metrics.count_and_measure("dormantdatabase");
    ctx.touch().await;

    let (dormant, result) = match notification {
        Notification::Added(dormant) => {
            if dormant.status.as_ref().and_then(|s| s.creation_time).is_some() {
                return;
            }
            info!("Pausing \"{}\" in {}", dormant.name_any(), dormant.namespace().unwrap_or_default());
            let result = dormant.pause(&ctx).await;
            (dormant, result)
        }
        Notification::Updated { old, new } => {
            if old.spec == new.spec {
                return;
            }
            let result = new.update(&ctx).await;
            (new, result)
        }
        Notification::Deleted(dormant) => {
            let result = dormant.on_delete(&ctx).await;
            (dormant, result)
        }
    };

    if let Err(e) = result {
        warn!("reconcile of DormantDatabase {} failed: {:?}", dormant.name_any(), e);
        ctx.metrics.reconcile_failure("dormantdatabase", &dormant.name_any(), &e);
    }
}

pub async fn run(ctx: Arc<Context>) {
    let api = Api::<DormantDatabase>::all(ctx.client.clone());
    let config = informer::labelled(LABEL_DATABASE_KIND, &Xdb::kind(&()));
    informer::watch(api, config, |notification| handle(notification, ctx.clone())).await;
}
