//! Checks run before any mutation is attempted for an `Xdb` or a `Snapshot`.

use crate::api::{
    v1alpha1::{MonitorSpec, Snapshot, Xdb},
    AGENT_COREOS_PROMETHEUS,
};
use crate::controllers::{context::Context, scheduler::parse_schedule};
use crate::storage::{check_bucket_access, osm_context};
use crate::util::errors::{Error, Result};
use k8s_openapi::api::{
    core::v1::{PersistentVolumeClaimSpec, Secret},
    storage::v1::StorageClass,
};
use kube::{Api, ResourceExt};

fn invalid(message: impl Into<String>) -> Error {
    Error::ValidationError(message.into())
}

/// Storage class named by `storage`, after checking that a size is requested.
pub fn validate_storage_spec(storage: &PersistentVolumeClaimSpec) -> Result<&str> {
    let class = storage
        .storage_class_name
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| invalid("spec.storage.storageClassName is required"))?;
    let requested = storage
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .is_some_and(|r| r.contains_key("storage"));
    if !requested {
        return Err(invalid("spec.storage.resources.requests.storage is required"));
    }
    Ok(class)
}

pub fn validate_monitor(monitor: &MonitorSpec) -> Result<()> {
    if monitor.agent.is_empty() {
        return Err(invalid("spec.monitor.agent is required"));
    }
    if monitor.agent != AGENT_COREOS_PROMETHEUS {
        return Err(invalid(format!("monitor agent {} is not supported", monitor.agent)));
    }
    if monitor.prometheus.is_none() {
        return Err(invalid("spec.monitor.prometheus is required"));
    }
    Ok(())
}

/// Validates a proposed `Xdb`. Nothing is written.
pub async fn validate_xdb(ctx: &Context, xdb: &Xdb) -> Result<()> {
    let spec = &xdb.spec;
    if spec.version.is_empty() {
        return Err(invalid("spec.version is required"));
    }
    let namespace = xdb
        .namespace()
        .ok_or_else(|| Error::MetadataMissing("Xdb has no namespace".into()))?;

    if ctx.config.check_images {
        let repository = format!("{}/xdb", ctx.config.docker_registry);
        if !ctx.registry.image_exists(&repository, &spec.version).await? {
            return Err(invalid(format!("image {}:{} not found", repository, spec.version)));
        }
    }

    if let Some(storage) = &spec.storage {
        let class = validate_storage_spec(storage)?;
        let classes: Api<StorageClass> = Api::all(ctx.client.clone());
        if classes.get_opt(class).await?.is_none() {
            return Err(invalid(format!("StorageClass {class} not found")));
        }
    }

    if let Some(secret) = spec.database_secret_name() {
        let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
        if secrets.get_opt(secret).await?.is_none() {
            return Err(invalid(format!("database secret {namespace}/{secret} not found")));
        }
    }

    if let Some(schedule) = &spec.backup_schedule {
        parse_schedule(&schedule.cron_expression)?;
        osm_context(&ctx.client, &schedule.storage, &namespace).await?;
        check_bucket_access(ctx.storage.as_ref(), &ctx.client, &schedule.storage, &namespace).await?;
    }

    if let Some(monitor) = &spec.monitor {
        validate_monitor(monitor)?;
    }
    Ok(())
}

/// Validates a new `Snapshot` and returns the database it targets.
pub async fn validate_snapshot(ctx: &Context, snapshot: &Snapshot) -> Result<Xdb> {
    let name = &snapshot.spec.database_name;
    if name.is_empty() {
        return Err(invalid("spec.databaseName is required"));
    }
    let namespace = snapshot
        .namespace()
        .ok_or_else(|| Error::MetadataMissing("Snapshot has no namespace".into()))?;

    let xdbs: Api<Xdb> = Api::namespaced(ctx.client.clone(), &namespace);
    let xdb = xdbs
        .get_opt(name)
        .await?
        .ok_or_else(|| invalid(format!("Xdb {namespace}/{name} not found")))?;

    let storage = &snapshot.spec.storage;
    storage.backend()?;
    osm_context(&ctx.client, storage, &namespace).await?;
    check_bucket_access(ctx.storage.as_ref(), &ctx.client, storage, &namespace).await?;
    Ok(xdb)
}
