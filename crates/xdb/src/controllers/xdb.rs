//! Lifecycle of an `Xdb`: create or resume on add, pause on delete, converge on update.

use crate::api::{
    v1alpha1::{
        DatabasePhase, DormantDatabase, DormantDatabaseSpec, InitSpec, Origin, OriginMeta, OriginSpec, Xdb,
        XdbSpec, XdbStatus,
    },
    ANNOTATION_XDB_IGNORE, ANNOTATION_XDB_INIT, LABEL_DATABASE_KIND,
};
use crate::controllers::{
    context::Context,
    events, snapshot,
    workload::{ensure_governing_service, ensure_service, ensure_statefulset, wait_for_running, Provisioned},
};
use crate::util::{
    errors::{is_conflict, Error, Result},
    patch::{try_patch, try_patch_status},
};
use crate::validator;
use chrono::Utc;
use k8s_openapi::api::core::v1::SecretVolumeSource;
use kube::{
    api::{Api, DeleteParams, ObjectMeta, PostParams},
    Resource, ResourceExt,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Spec compared when matching a new `Xdb` against a dormant one: init is ignored and a missing
/// secret reference stands for the generated admin secret.
pub fn normalized_spec(spec: &XdbSpec, name: &str) -> XdbSpec {
    let mut spec = spec.clone();
    spec.init = None;
    if spec.database_secret.is_none() {
        spec.database_secret = Some(SecretVolumeSource {
            secret_name: Some(format!("{name}-admin-auth")),
            ..Default::default()
        });
    }
    spec
}

impl Xdb {
    fn api(&self, ctx: &Context) -> Result<Api<Xdb>> {
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::MetadataMissing("Xdb has no namespace".into()))?;
        Ok(Api::namespaced(ctx.client.clone(), &namespace))
    }

    async fn set_phase(&self, ctx: &Context, phase: DatabasePhase, reason: Option<String>) -> Result<Xdb> {
        try_patch_status(&self.api(ctx)?, &self.name_any(), &ctx.retry(), |db: &mut Xdb| {
            let status = db.status.get_or_insert_with(XdbStatus::default);
            status.phase = Some(phase);
            status.reason = reason.clone();
        })
        .await
    }

    /// Marks the database Failed and tells the user why.
    pub async fn push_failure(&self, ctx: &Context, event: &str, reason: &str) -> Result<()> {
        ctx.warning(self, event, reason).await;
        self.set_phase(ctx, DatabasePhase::Failed, Some(reason.to_string()))
            .await?;
        Ok(())
    }

    /// Handles a newly observed `Xdb`.
    pub async fn create(&self, ctx: &Context) -> Result<()> {
        let api = self.api(ctx)?;
        let name = self.name_any();

        // a redelivered add finds the creation time already set
        let mut initialized = false;
        let xdb = try_patch_status(&api, &name, &ctx.retry(), |db: &mut Xdb| {
            let status = db.status.get_or_insert_with(XdbStatus::default);
            initialized = status.creation_time.is_some();
            if !initialized {
                status.creation_time = Some(Utc::now());
                status.phase = Some(DatabasePhase::Creating);
                status.reason = None;
            }
        })
        .await?;
        if initialized {
            return Ok(());
        }
        ctx.normal(&xdb, events::CREATING, "Creating Xdb").await;

        if let Err(e) = validator::validate_xdb(ctx, &xdb).await {
            xdb.push_failure(ctx, events::INVALID, &e.to_string()).await?;
            return Err(e);
        }
        ctx.normal(&xdb, events::SUCCESSFUL_VALIDATE, "Successfully validated Xdb").await;
        xdb.bring_up(ctx).await
    }

    /// Takes a validated database that is not up yet to Running: hands it over to a matching
    /// dormant database, or provisions it and registers its backups and monitoring.
    async fn bring_up(&self, ctx: &Context) -> Result<()> {
        match self.match_dormant(ctx).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e @ Error::ValidationError(_)) => {
                self.push_failure(ctx, events::FAILED_TO_CREATE, &e.to_string()).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        let xdb = match self.provision(ctx).await {
            Ok(xdb) => xdb,
            Err(e) => {
                let event = match e {
                    Error::Timeout(_) => events::FAILED_TO_START,
                    _ => events::FAILED_TO_CREATE,
                };
                self.push_failure(ctx, event, &e.to_string()).await?;
                return Err(e);
            }
        };

        xdb.sync_schedule(ctx).await;
        if let Some(monitor) = &xdb.spec.monitor {
            match ctx.monitor.add_monitor(&xdb, monitor).await {
                Ok(()) => ctx.normal(&xdb, events::SUCCESSFUL_MONITOR_ADD, "Added monitoring").await,
                Err(e) => {
                    ctx.warning(&xdb, events::FAILED_TO_ADD_MONITOR, e.to_string())
                        .await
                }
            }
        }
        Ok(())
    }

    /// Looks for a dormant database of the same name. Returns true when this `Xdb` was handed
    /// over to it for resuming.
    async fn match_dormant(&self, ctx: &Context) -> Result<bool> {
        let namespace = self.namespace().unwrap_or_default();
        let name = self.name_any();
        let dormants: Api<DormantDatabase> = Api::namespaced(ctx.client.clone(), &namespace);
        let Some(dormant) = dormants.get_opt(&name).await? else {
            return Ok(false);
        };
        // this object was recreated by the resume itself
        if dormant.is_resuming() {
            return Ok(false);
        }

        let kind = Self::kind(&()).to_string();
        if dormant.labels().get(LABEL_DATABASE_KIND) != Some(&kind) {
            return Err(Error::ValidationError(format!(
                "DormantDatabase {namespace}/{name} of another kind exists"
            )));
        }
        if let (Some(init), Some(recorded)) = (&self.spec.init, dormant.annotations().get(ANNOTATION_XDB_INIT)) {
            let recorded: InitSpec = serde_json::from_str(recorded).map_err(|e| {
                Error::ValidationError(format!(
                    "recorded init of DormantDatabase {namespace}/{name} is malformed: {e}"
                ))
            })?;
            if init != &recorded {
                return Err(Error::ValidationError(format!(
                    "init of Xdb {namespace}/{name} mismatches the one of its DormantDatabase"
                )));
            }
        }
        let origin = dormant
            .spec
            .origin
            .spec
            .xdb
            .as_ref()
            .map(|spec| normalized_spec(spec, &name));
        if origin != Some(normalized_spec(&self.spec, &name)) {
            return Err(Error::ValidationError(format!(
                "spec of Xdb {namespace}/{name} mismatches the origin of its DormantDatabase"
            )));
        }

        ctx.normal(self, events::RESUMING, "Resuming from DormantDatabase").await;
        let api = self.api(ctx)?;
        try_patch(&api, &name, &ctx.retry(), |db: &mut Xdb| {
            db.annotations_mut()
                .insert(ANNOTATION_XDB_IGNORE.to_string(), "true".to_string());
        })
        .await?;
        api.delete(&name, &DeleteParams::default()).await?;
        try_patch(&dormants, &name, &ctx.retry(), |d: &mut DormantDatabase| {
            d.spec.resume = true;
        })
        .await?;
        info!("handed Xdb {}/{} over to its DormantDatabase", namespace, name);
        Ok(true)
    }

    async fn ensure_workload(&self, ctx: &Context) -> Result<(Xdb, Provisioned)> {
        let namespace = self.namespace().unwrap_or_default();
        ensure_governing_service(&ctx.client, &namespace, &ctx.config.governing_service).await?;
        ensure_service(ctx, self).await?;
        ensure_statefulset(ctx, self).await
    }

    /// Creates the workload of a fresh database and brings it to Running.
    async fn provision(&self, ctx: &Context) -> Result<Xdb> {
        let (xdb, provisioned) = self.ensure_workload(ctx).await?;
        if provisioned == Provisioned::Existing {
            // left over by an earlier attempt that did not finish
            let pod = format!("{}-0", xdb.offshoot_name());
            wait_for_running(&ctx.client, &xdb.namespace().unwrap_or_default(), &pod, ctx.config.readiness_poll())
                .await?;
        }
        if provisioned == Provisioned::Created {
            ctx.normal(&xdb, events::SUCCESSFUL_CREATE, "Successfully created Xdb").await;
            if let Some(source) = xdb.spec.init.as_ref().and_then(|i| i.snapshot_source.as_ref()) {
                xdb.set_phase(ctx, DatabasePhase::Initializing, None).await?;
                ctx.normal(&xdb, events::INITIALIZING, format!("Initializing from Snapshot {}", source.name))
                    .await;
                match snapshot::restore(ctx, &xdb, source).await {
                    Ok(()) => {
                        ctx.normal(&xdb, events::SUCCESSFUL_INITIALIZE, "Successfully completed initialization")
                            .await
                    }
                    Err(e) => {
                        ctx.warning(&xdb, events::FAILED_TO_INITIALIZE, e.to_string())
                            .await
                    }
                }
            }
        }
        xdb.set_phase(ctx, DatabasePhase::Running, None).await
    }

    /// Registers the backup schedule of a database already up, as seen again after a restart.
    pub async fn resync(&self, ctx: &Context) {
        if self.status.as_ref().and_then(|s| s.phase) == Some(DatabasePhase::Running) {
            debug!("resyncing Xdb {}/{}", self.namespace().unwrap_or_default(), self.name_any());
            self.sync_schedule(ctx).await;
        }
    }

    async fn sync_schedule(&self, ctx: &Context) {
        let namespace = self.namespace().unwrap_or_default();
        match &self.spec.backup_schedule {
            Some(schedule) => {
                if let Err(e) = ctx.scheduler.schedule_backup(self, schedule) {
                    ctx.warning(self, events::FAILED_TO_SCHEDULE, e.to_string()).await;
                }
            }
            None => ctx.scheduler.stop_scheduling(&namespace, &self.name_any()),
        }
    }

    /// The `DormantDatabase` retaining this database. The init spec is kept out of the origin and
    /// recorded as an annotation instead.
    pub fn dormant_database(&self) -> Result<DormantDatabase> {
        let mut annotations = BTreeMap::new();
        if let Some(init) = &self.spec.init {
            annotations.insert(ANNOTATION_XDB_INIT.to_string(), serde_json::to_string(init)?);
        }
        let mut spec = self.spec.clone();
        spec.init = None;

        Ok(DormantDatabase {
            metadata: ObjectMeta {
                name: Some(self.name_any()),
                namespace: self.namespace(),
                labels: Some(BTreeMap::from([(
                    LABEL_DATABASE_KIND.to_string(),
                    Self::kind(&()).to_string(),
                )])),
                annotations: (!annotations.is_empty()).then_some(annotations),
                ..Default::default()
            },
            spec: DormantDatabaseSpec {
                origin: Origin {
                    metadata: OriginMeta {
                        name: self.name_any(),
                        namespace: self.namespace(),
                        labels: self.metadata.labels.clone(),
                        annotations: self.metadata.annotations.clone(),
                    },
                    spec: OriginSpec { xdb: Some(spec) },
                },
                wipe_out: false,
                resume: false,
            },
            status: None,
        })
    }

    /// Handles the deletion of an `Xdb`.
    pub async fn pause(&self, ctx: &Context) -> Result<()> {
        let namespace = self.namespace().unwrap_or_default();
        let name = self.name_any();
        if self.annotations().contains_key(ANNOTATION_XDB_IGNORE) {
            ctx.normal(self, events::IGNORED, "Deletion ignored, the Xdb is being resumed").await;
            return Ok(());
        }

        if self.spec.do_not_pause {
            ctx.warning(
                self,
                events::FAILED_TO_PAUSE,
                "Xdb is locked with doNotPause, recreating it",
            )
            .await;
            return self.recreate(ctx).await;
        }

        ctx.normal(self, events::PAUSING, "Pausing Xdb").await;
        let dormants: Api<DormantDatabase> = Api::namespaced(ctx.client.clone(), &namespace);
        match dormants.create(&PostParams::default(), &self.dormant_database()?).await {
            Ok(_) => info!("created DormantDatabase {}/{}", namespace, name),
            Err(e) if is_conflict(&e) => warn!("DormantDatabase {}/{} already exists", namespace, name),
            Err(e) => {
                ctx.warning(self, events::FAILED_TO_CREATE, format!("Failed to create DormantDatabase: {e}"))
                    .await;
                return Err(e.into());
            }
        }

        ctx.scheduler.stop_scheduling(&namespace, &name);
        if let Some(monitor) = &self.spec.monitor {
            match ctx.monitor.delete_monitor(self, monitor).await {
                Ok(()) => ctx.normal(self, events::SUCCESSFUL_MONITOR_DELETE, "Deleted monitoring").await,
                Err(e) => {
                    ctx.warning(self, events::FAILED_TO_DELETE_MONITOR, e.to_string())
                        .await
                }
            }
        }
        Ok(())
    }

    /// Puts a locked database back with its previous spec and status.
    async fn recreate(&self, ctx: &Context) -> Result<()> {
        let api = self.api(ctx)?;
        let name = self.name_any();
        let fresh = Xdb {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: self.namespace(),
                labels: self.metadata.labels.clone(),
                annotations: self.metadata.annotations.clone(),
                ..Default::default()
            },
            spec: self.spec.clone(),
            status: None,
        };
        match api.create(&PostParams::default(), &fresh).await {
            Ok(_) => {}
            Err(e) if is_conflict(&e) => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(status) = self.status.clone() {
            try_patch_status(&api, &name, &ctx.retry(), |db: &mut Xdb| {
                db.status = Some(status.clone());
            })
            .await?;
        }
        info!("recreated locked Xdb {}/{}", self.namespace().unwrap_or_default(), name);
        Ok(())
    }

    /// Converges the cluster to a changed spec. `old` is the previously observed object.
    ///
    /// A database whose add never got it up goes through the whole create path instead.
    pub async fn update(&self, old: &Xdb, ctx: &Context) -> Result<()> {
        if let Err(e) = validator::validate_xdb(ctx, self).await {
            self.push_failure(ctx, events::INVALID, &e.to_string()).await?;
            return Err(e);
        }

        let Some(live) = self.api(ctx)?.get_opt(&self.name_any()).await? else {
            return Ok(());
        };
        let phase = live.status.as_ref().and_then(|s| s.phase);
        if !matches!(phase, Some(DatabasePhase::Running | DatabasePhase::Initializing)) {
            info!("Xdb {}/{} is not up yet, provisioning it", self.namespace().unwrap_or_default(), self.name_any());
            return self.bring_up(ctx).await;
        }

        let xdb = match self.ensure_workload(ctx).await {
            Ok((xdb, _)) => xdb,
            Err(e) => {
                self.push_failure(ctx, events::FAILED_TO_UPDATE, &e.to_string()).await?;
                return Err(e);
            }
        };

        if old.spec.backup_schedule != xdb.spec.backup_schedule {
            xdb.sync_schedule(ctx).await;
        }
        if old.spec.monitor != xdb.spec.monitor {
            match ctx
                .monitor
                .update_monitor(&xdb, old.spec.monitor.as_ref(), xdb.spec.monitor.as_ref())
                .await
            {
                Ok(()) => {
                    ctx.normal(&xdb, events::SUCCESSFUL_MONITOR_UPDATE, "Updated monitoring")
                        .await
                }
                Err(e) => {
                    ctx.warning(&xdb, events::FAILED_TO_UPDATE_MONITOR, e.to_string())
                        .await
                }
            }
        }
        Ok(())
    }
}
