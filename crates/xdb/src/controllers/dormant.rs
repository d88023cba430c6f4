//! Pause, wipe-out and resume of a `DormantDatabase`.

use crate::api::{
    v1alpha1::{DormantDatabase, DormantDatabasePhase, DormantDatabaseStatus, Snapshot, Xdb, XdbSpec},
    ANNOTATION_XDB_IGNORE, ANNOTATION_XDB_INIT, LABEL_DATABASE_KIND, LABEL_DATABASE_NAME,
};
use crate::controllers::{context::Context, events, rbac};
use crate::util::{
    errors::{is_conflict, is_not_found, Error, Result},
    label_selector,
    patch::{try_patch, try_patch_status},
    wait::poll_until,
};
use chrono::Utc;
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{PersistentVolumeClaim, Pod, Secret, Service},
};
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams},
    Resource, ResourceExt,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

impl DormantDatabase {
    fn api(&self, ctx: &Context) -> Result<Api<DormantDatabase>> {
        Ok(Api::namespaced(ctx.client.clone(), &self.namespace_or_err()?))
    }

    fn namespace_or_err(&self) -> Result<String> {
        self.namespace()
            .ok_or_else(|| Error::MetadataMissing("DormantDatabase has no namespace".into()))
    }

    /// Labels carried by everything the live database owned.
    fn offshoot_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_DATABASE_NAME.to_string(), self.name_any()),
            (LABEL_DATABASE_KIND.to_string(), Xdb::kind(&()).to_string()),
        ])
    }

    fn origin_spec(&self) -> Option<&XdbSpec> {
        self.spec.origin.spec.xdb.as_ref()
    }

    async fn set_phase(&self, ctx: &Context, phase: DormantDatabasePhase, reason: Option<String>) -> Result<DormantDatabase> {
        try_patch_status(&self.api(ctx)?, &self.name_any(), &ctx.retry(), |d: &mut DormantDatabase| {
            let status = d.status.get_or_insert_with(DormantDatabaseStatus::default);
            match phase {
                DormantDatabasePhase::Paused => status.pausing_time = Some(Utc::now()),
                DormantDatabasePhase::WipingOut => status.wiping_out_time = Some(Utc::now()),
                _ => {}
            }
            status.phase = Some(phase);
            status.reason = reason.clone();
        })
        .await
    }

    async fn fail(&self, ctx: &Context, event: &str, e: &Error) -> Result<()> {
        ctx.warning(self, event, e.to_string()).await;
        self.set_phase(ctx, DormantDatabasePhase::Failed, Some(e.to_string()))
            .await?;
        Ok(())
    }

    async fn ensure_no_live_database(&self, ctx: &Context) -> Result<()> {
        let namespace = self.namespace_or_err()?;
        let xdbs: Api<Xdb> = Api::namespaced(ctx.client.clone(), &namespace);
        if xdbs.get_opt(&self.name_any()).await?.is_some() {
            return Err(Error::ValidationError(format!(
                "Xdb {namespace}/{} is still running",
                self.name_any()
            )));
        }
        Ok(())
    }

    /// Handles a newly observed `DormantDatabase` by halting the database it retains.
    pub async fn pause(&self, ctx: &Context) -> Result<()> {
        let mut initialized = false;
        let dormant = try_patch_status(&self.api(ctx)?, &self.name_any(), &ctx.retry(), |d: &mut DormantDatabase| {
            let status = d.status.get_or_insert_with(DormantDatabaseStatus::default);
            initialized = status.creation_time.is_some();
            if !initialized {
                status.creation_time = Some(Utc::now());
                status.phase = Some(DormantDatabasePhase::Pausing);
            }
        })
        .await?;
        if initialized {
            return Ok(());
        }

        match dormant.halt(ctx).await {
            Ok(()) => {
                let dormant = dormant.set_phase(ctx, DormantDatabasePhase::Paused, None).await?;
                ctx.normal(&dormant, events::SUCCESSFUL_PAUSE, "Successfully paused Xdb").await;
                Ok(())
            }
            Err(e) => {
                dormant.fail(ctx, events::FAILED_TO_PAUSE, &e).await?;
                Err(e)
            }
        }
    }

    /// Removes the service, the workload and the access control of the paused database.
    async fn halt(&self, ctx: &Context) -> Result<()> {
        self.ensure_no_live_database(ctx).await?;
        let namespace = self.namespace_or_err()?;
        let name = self.name_any();
        let labels = self.offshoot_labels();

        let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
        if let Some(service) = services.get_opt(&name).await? {
            let selector = service.spec.and_then(|s| s.selector).unwrap_or_default();
            if selector == labels {
                services.delete(&name, &DeleteParams::default()).await?;
                debug!("deleted service {}/{}", namespace, name);
            }
        }

        let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
        if statefulsets.get_opt(&name).await?.is_some() {
            try_patch(&statefulsets, &name, &ctx.retry(), |sts: &mut StatefulSet| {
                if let Some(spec) = sts.spec.as_mut() {
                    spec.replicas = Some(0);
                }
            })
            .await?;

            let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
            let params = ListParams::default().labels(&label_selector(&labels));
            let (pods, params) = (&pods, &params);
            poll_until(
                &format!("pods of {namespace}/{name} to terminate"),
                ctx.config.pause_poll(),
                move || async move { Ok(pods.list(params).await?.items.is_empty().then_some(())) },
            )
            .await?;

            match statefulsets.delete(&name, &DeleteParams::default()).await {
                Ok(_) => info!("deleted statefulset {}/{}", namespace, name),
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        rbac::delete_rbac(&ctx.client, &namespace, &name).await
    }

    /// Reacts to a spec change: a wipe-out request wins over a resume request.
    pub async fn update(&self, ctx: &Context) -> Result<()> {
        let phase = self.phase();
        if self.spec.wipe_out && phase != Some(DormantDatabasePhase::WipedOut) {
            return self.wipe_out(ctx).await;
        }
        let busy = matches!(
            phase,
            Some(DormantDatabasePhase::Resuming | DormantDatabasePhase::WipingOut | DormantDatabasePhase::WipedOut)
        );
        if self.spec.resume && !busy {
            return self.resume(ctx).await;
        }
        Ok(())
    }

    /// Deletes the snapshots, volumes and unshared secret of the database.
    pub async fn wipe_out(&self, ctx: &Context) -> Result<()> {
        let dormant = self.set_phase(ctx, DormantDatabasePhase::WipingOut, None).await?;
        ctx.normal(&dormant, events::WIPING_OUT, "Wiping out Xdb").await;

        match dormant.wipe_out_data(ctx).await {
            Ok(()) => {
                let dormant = dormant.set_phase(ctx, DormantDatabasePhase::WipedOut, None).await?;
                ctx.normal(&dormant, events::SUCCESSFUL_WIPE_OUT, "Successfully wiped out Xdb")
                    .await;
                Ok(())
            }
            Err(e) => {
                dormant.fail(ctx, events::FAILED_TO_WIPE_OUT, &e).await?;
                Err(e)
            }
        }
    }

    async fn wipe_out_data(&self, ctx: &Context) -> Result<()> {
        self.ensure_no_live_database(ctx).await?;
        let namespace = self.namespace_or_err()?;
        let selector = label_selector(&self.offshoot_labels());
        let params = ListParams::default().labels(&selector);

        Api::<Snapshot>::namespaced(ctx.client.clone(), &namespace)
            .delete_collection(&DeleteParams::default(), &params)
            .await?;
        Api::<PersistentVolumeClaim>::namespaced(ctx.client.clone(), &namespace)
            .delete_collection(&DeleteParams::default(), &params)
            .await?;
        info!("deleted snapshots and volumes of {}/{}", namespace, self.name_any());

        if let Some(secret) = self.origin_spec().and_then(|s| s.database_secret_name()) {
            self.delete_secret_unless_shared(ctx, secret).await?;
        }
        Ok(())
    }

    /// The scan and the delete are not atomic: a database resumed in between may lose its secret.
    async fn delete_secret_unless_shared(&self, ctx: &Context, secret: &str) -> Result<()> {
        let namespace = self.namespace_or_err()?;
        let name = self.name_any();

        let xdbs = Api::<Xdb>::namespaced(ctx.client.clone(), &namespace)
            .list(&ListParams::default())
            .await?;
        if xdbs.items.iter().any(|x| x.spec.database_secret_name() == Some(secret)) {
            info!("secret {}/{} is still used by an Xdb", namespace, secret);
            return Ok(());
        }
        let dormants = self.api(ctx)?.list(&ListParams::default()).await?;
        let shared = dormants
            .items
            .iter()
            .filter(|d| d.name_any() != name)
            .filter_map(|d| d.origin_spec())
            .any(|spec| spec.database_secret_name() == Some(secret));
        if shared {
            info!("secret {}/{} is still used by a DormantDatabase", namespace, secret);
            return Ok(());
        }

        match Api::<Secret>::namespaced(ctx.client.clone(), &namespace)
            .delete(secret, &DeleteParams::default())
            .await
        {
            Ok(_) => info!("deleted secret {}/{}", namespace, secret),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Recreates the `Xdb` from its origin and removes this object.
    pub async fn resume(&self, ctx: &Context) -> Result<()> {
        let dormant = self.set_phase(ctx, DormantDatabasePhase::Resuming, None).await?;
        ctx.normal(&dormant, events::RESUMING, "Resuming Xdb").await;

        match dormant.restore_database(ctx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                dormant.fail(ctx, events::FAILED_TO_RESUME, &e).await?;
                Err(e)
            }
        }
    }

    /// The `Xdb` this object retains, with the user annotations of this object merged in.
    pub fn origin_database(&self) -> Result<Xdb> {
        let origin = &self.spec.origin;
        let spec = self.origin_spec().cloned().ok_or_else(|| {
            Error::ValidationError(format!("DormantDatabase {} has no Xdb origin", self.name_any()))
        })?;
        if spec.init.is_some() {
            return Err(Error::ValidationError(format!(
                "origin of DormantDatabase {} must not carry an init spec",
                self.name_any()
            )));
        }
        let mut annotations = origin.metadata.annotations.clone().unwrap_or_default();
        annotations.extend(self.annotations().clone());
        for owned in [ANNOTATION_XDB_INIT, ANNOTATION_XDB_IGNORE] {
            annotations.remove(owned);
        }

        Ok(Xdb {
            metadata: ObjectMeta {
                name: Some(origin.metadata.name.clone()),
                namespace: origin.metadata.namespace.clone().or_else(|| self.namespace()),
                labels: origin.metadata.labels.clone(),
                annotations: (!annotations.is_empty()).then_some(annotations),
                ..Default::default()
            },
            spec,
            status: None,
        })
    }

    async fn restore_database(&self, ctx: &Context) -> Result<()> {
        self.ensure_no_live_database(ctx).await?;
        let xdb = self.origin_database()?;
        let namespace = self.namespace_or_err()?;
        Api::<Xdb>::namespaced(ctx.client.clone(), &namespace)
            .create(&PostParams::default(), &xdb)
            .await?;
        ctx.normal(self, events::SUCCESSFUL_RESUME, "Successfully resumed Xdb").await;

        self.api(ctx)?.delete(&self.name_any(), &DeleteParams::default()).await?;
        info!("resumed Xdb {}/{}", namespace, self.name_any());
        Ok(())
    }

    /// Handles the deletion of a `DormantDatabase`. Only a finished resume or wipe-out may remove
    /// one, anything else is put back.
    pub async fn on_delete(&self, ctx: &Context) -> Result<()> {
        if matches!(
            self.phase(),
            Some(DormantDatabasePhase::Resuming | DormantDatabasePhase::WipedOut)
        ) {
            return Ok(());
        }

        let api = self.api(ctx)?;
        let name = self.name_any();
        let fresh = DormantDatabase {
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
            try_patch_status(&api, &name, &ctx.retry(), |d: &mut DormantDatabase| {
                d.status = Some(status.clone());
            })
            .await?;
        }
        info!("recreated DormantDatabase {}/{}", self.namespace().unwrap_or_default(), name);
        Ok(())
    }
}
