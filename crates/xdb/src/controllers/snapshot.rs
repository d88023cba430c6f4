//! Backups into a `Snapshot`, and restores of a new database from one.

use crate::api::{
    v1alpha1::{Snapshot, SnapshotPhase, SnapshotSourceSpec, SnapshotStatus, Xdb},
    LABEL_DATABASE_KIND, LABEL_DATABASE_NAME, LABEL_SNAPSHOT_STATUS,
};
use crate::controllers::{
    context::Context,
    events,
    jobs::{self, JobMode},
};
use crate::storage::delete_snapshot_data;
use crate::util::{
    errors::{Error, Result},
    label_selector,
    patch::{try_patch, try_patch_status},
};
use crate::validator;
use chrono::Utc;
use kube::{
    api::{Api, ListParams},
    Resource, ResourceExt,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{info, warn};

const RUNNING: &str = "Running";

impl Snapshot {
    fn api(&self, ctx: &Context) -> Result<Api<Snapshot>> {
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::MetadataMissing("Snapshot has no namespace".into()))?;
        Ok(Api::namespaced(ctx.client.clone(), &namespace))
    }

    /// Labels marking this snapshot as the running one of its database.
    fn running_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_DATABASE_KIND.to_string(), Xdb::kind(&()).to_string()),
            (LABEL_DATABASE_NAME.to_string(), self.spec.database_name.clone()),
            (LABEL_SNAPSHOT_STATUS.to_string(), RUNNING.to_string()),
        ])
    }

    /// Name of another snapshot of the same database currently running, if any.
    async fn running_sibling(&self, ctx: &Context) -> Result<Option<String>> {
        let params = ListParams::default().labels(&label_selector(&self.running_labels()));
        let running = self.api(ctx)?.list(&params).await?;
        Ok(running
            .items
            .into_iter()
            .map(|s| s.name_any())
            .find(|name| name != &self.name_any()))
    }

    async fn fail(&self, ctx: &Context, event: &str, reason: &str) -> Result<()> {
        ctx.warning(self, event, reason).await;
        try_patch_status(&self.api(ctx)?, &self.name_any(), &ctx.retry(), |s: &mut Snapshot| {
            let status = s.status.get_or_insert_with(SnapshotStatus::default);
            status.phase = Some(SnapshotPhase::Failed);
            status.reason = Some(reason.to_string());
            status.completion_time = Some(Utc::now());
        })
        .await?;
        Ok(())
    }

    /// Starts the backup of a newly observed snapshot. The job is supervised on a spawned task.
    pub async fn start(&self, ctx: Arc<Context>) -> Result<()> {
        let api = self.api(&ctx)?;
        let name = self.name_any();
        let namespace = self.namespace().unwrap_or_default();

        let mut started = false;
        let snapshot = try_patch_status(&api, &name, &ctx.retry(), |s: &mut Snapshot| {
            let status = s.status.get_or_insert_with(SnapshotStatus::default);
            started = status.start_time.is_some();
            if !started {
                status.start_time = Some(Utc::now());
                status.phase = Some(SnapshotPhase::Pending);
            }
        })
        .await?;
        if started {
            return Ok(());
        }

        let xdb = match validator::validate_snapshot(&ctx, &snapshot).await {
            Ok(xdb) => xdb,
            Err(e) => {
                snapshot.fail(&ctx, events::INVALID, &e.to_string()).await?;
                return Err(e);
            }
        };
        if let Some(running) = snapshot.running_sibling(&ctx).await? {
            let e = Error::ValidationError(format!(
                "Snapshot {running} of Xdb {namespace}/{} is still running",
                snapshot.spec.database_name
            ));
            snapshot.fail(&ctx, events::FAILED_TO_CREATE, &e.to_string()).await?;
            return Err(e);
        }

        let labels = snapshot.running_labels();
        try_patch(&api, &name, &ctx.retry(), |s: &mut Snapshot| {
            s.labels_mut().extend(labels.clone());
        })
        .await?;
        let snapshot = try_patch_status(&api, &name, &ctx.retry(), |s: &mut Snapshot| {
            s.status.get_or_insert_with(SnapshotStatus::default).phase = Some(SnapshotPhase::Running);
        })
        .await?;
        ctx.normal(&snapshot, events::STARTING, "Backup running").await;

        if let Err(e) = jobs::launch(&ctx.client, &ctx.config, &xdb, &snapshot, &namespace, JobMode::Backup).await {
            let outcome = Err(e);
            snapshot.finish(&ctx, &outcome).await?;
            return outcome.map(|_| ());
        }
        snapshot.supervise(ctx);
        Ok(())
    }

    /// Waits for the backup job on a spawned task and records its outcome.
    ///
    /// The job is named after the snapshot and runs in its namespace.
    fn supervise(self, ctx: Arc<Context>) {
        tokio::spawn(async move {
            let namespace = self.namespace().unwrap_or_default();
            let job = self.name_any();
            let outcome = jobs::check_job(&ctx.client, &namespace, &job, ctx.config.job_poll()).await;
            if let Err(e) = self.finish(&ctx, &outcome).await {
                warn!("failed to record outcome of Snapshot {}/{}: {}", namespace, job, e);
            }
        });
    }

    /// Watches again over a backup that was running when the operator last stopped.
    /// Returns whether supervision was resumed.
    pub fn resume_supervision(&self, ctx: Arc<Context>) -> bool {
        if self.phase() != Some(SnapshotPhase::Running) {
            return false;
        }
        info!(
            "resuming supervision of Snapshot {}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        );
        self.clone().supervise(ctx);
        true
    }

    /// Records how the backup job ended and releases the running label.
    async fn finish(&self, ctx: &Context, outcome: &Result<bool>) -> Result<()> {
        let api = self.api(ctx)?;
        let name = self.name_any();
        try_patch(&api, &name, &ctx.retry(), |s: &mut Snapshot| {
            s.labels_mut().remove(LABEL_SNAPSHOT_STATUS);
        })
        .await?;

        let (phase, reason) = match outcome {
            Ok(true) => (SnapshotPhase::Succeeded, None),
            Ok(false) => (SnapshotPhase::Failed, Some("backup job failed".to_string())),
            Err(e) => (SnapshotPhase::Failed, Some(e.to_string())),
        };
        let snapshot = try_patch_status(&api, &name, &ctx.retry(), |s: &mut Snapshot| {
            let status = s.status.get_or_insert_with(SnapshotStatus::default);
            status.phase = Some(phase);
            status.reason = reason.clone();
            status.completion_time = Some(Utc::now());
        })
        .await?;

        match reason {
            None => {
                info!("Snapshot {}/{} succeeded", snapshot.namespace().unwrap_or_default(), name);
                ctx.normal(&snapshot, events::SUCCESSFUL_SNAPSHOT, "Successfully completed snapshot")
                    .await
            }
            Some(reason) => ctx.warning(&snapshot, events::FAILED_SNAPSHOT, reason).await,
        }
        Ok(())
    }

    /// Removes the stored data of a deleted snapshot.
    pub async fn remove_data(&self, ctx: &Context) -> Result<()> {
        if let Err(e) = delete_snapshot_data(ctx.storage.as_ref(), &ctx.client, self).await {
            ctx.warning(self, events::FAILED_TO_DELETE, format!("Failed to delete snapshot data: {e}"))
                .await;
            return Err(e);
        }
        Ok(())
    }
}

/// Restores `xdb` from the snapshot named by `source` and waits for the restore job.
pub async fn restore(ctx: &Context, xdb: &Xdb, source: &SnapshotSourceSpec) -> Result<()> {
    let namespace = source
        .namespace
        .clone()
        .or_else(|| xdb.namespace())
        .unwrap_or_default();
    let snapshots: Api<Snapshot> = Api::namespaced(ctx.client.clone(), &namespace);
    let snapshot = snapshots
        .get_opt(&source.name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Snapshot {namespace}/{}", source.name)))?;
    if snapshot.phase() != Some(SnapshotPhase::Succeeded) {
        return Err(Error::ValidationError(format!(
            "Snapshot {namespace}/{} has not succeeded",
            source.name
        )));
    }

    let job = jobs::launch(&ctx.client, &ctx.config, xdb, &snapshot, &namespace, JobMode::Restore).await?;
    let job_namespace = xdb.namespace().unwrap_or_default();
    if jobs::check_job(&ctx.client, &job_namespace, &job, ctx.config.job_poll()).await? {
        info!("restored Xdb {}/{} from Snapshot {}", job_namespace, xdb.name_any(), source.name);
        Ok(())
    } else {
        Err(Error::ProvisioningError(format!(
            "restore job {job_namespace}/{job} failed"
        )))
    }
}
