//! Object storage access for snapshot data.
//!
//! Backup and restore jobs read their credentials from a secret holding an object storage
//! config; the operator itself only probes buckets and removes snapshot data.

pub mod local;
pub mod s3;

use crate::api::v1alpha1::{Provider, Snapshot, SnapshotStorageSpec};
use crate::util::errors::{is_not_found, Error, Result};
use async_trait::async_trait;
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{
    api::{Api, ObjectMeta},
    Client, ResourceExt,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const CHECK_BUCKET_KEY: &str = ".kubedb";
pub const CHECK_BUCKET_CONTENT: &str = "CheckBucketAccess";
pub const SECRET_CONFIG_KEY: &str = "config";
pub const ITEM_PAGE_SIZE: usize = 50;

/// Connection details for one object storage provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsmContext {
    pub name: String,
    pub provider: String,
    pub config: BTreeMap<String, String>,
}

/// Config file mounted into backup and restore jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OsmConfig {
    pub contexts: Vec<OsmContext>,
    pub current_context: String,
}

/// A bucket or directory holding blobs.
#[async_trait]
pub trait Container: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// Lists up to `limit` keys under `prefix` starting after `cursor`.
    ///
    /// The returned cursor is `None` once the listing is exhausted.
    async fn items(&self, prefix: &str, cursor: Option<String>, limit: usize) -> Result<(Vec<String>, Option<String>)>;

    async fn remove(&self, key: &str) -> Result<()>;
}

#[async_trait]
pub trait StorageDialer: Send + Sync {
    async fn dial(&self, context: &OsmContext, container: &str) -> Result<Box<dyn Container>>;
}

/// Dials the providers the operator can reach itself.
#[derive(Debug, Default, Clone)]
pub struct OsmDialer;

#[async_trait]
impl StorageDialer for OsmDialer {
    async fn dial(&self, context: &OsmContext, container: &str) -> Result<Box<dyn Container>> {
        match context.provider.as_str() {
            p if p == Provider::S3.as_str() => Ok(Box::new(s3::S3Container::connect(&context.config, container))),
            p if p == Provider::Local.as_str() => Ok(Box::new(local::LocalContainer::new(container))),
            other => Err(Error::StorageError(format!(
                "provider {other} is not supported by the operator"
            ))),
        }
    }
}

async fn storage_secret(client: &Client, spec: &SnapshotStorageSpec, namespace: &str) -> Result<BTreeMap<String, String>> {
    let name = spec
        .storage_secret_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::ValidationError("storageSecretName is missing".into()))?;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = secrets.get(name).await.map_err(|e| {
        if is_not_found(&e) {
            Error::ValidationError(format!("storage secret {namespace}/{name} not found"))
        } else {
            Error::KubeError(e)
        }
    })?;

    let mut data: BTreeMap<String, String> = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    data.extend(secret.string_data.unwrap_or_default());
    Ok(data)
}

/// Builds the object storage context for `spec`, reading the storage secret when the backend needs one.
pub async fn osm_context(client: &Client, spec: &SnapshotStorageSpec, namespace: &str) -> Result<OsmContext> {
    let backend = spec.backend()?;
    let secret = if backend.needs_secret() {
        storage_secret(client, spec, namespace).await?
    } else {
        BTreeMap::new()
    };

    let missing: Vec<&str> = backend
        .required_credentials()
        .iter()
        .copied()
        .filter(|key| !secret.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(Error::ValidationError(format!(
            "storage secret is missing keys: {}",
            missing.join(", ")
        )));
    }

    let provider = backend.provider().as_str().to_string();
    Ok(OsmContext {
        name: provider.clone(),
        provider,
        config: backend.credentials(&secret),
    })
}

/// Secret mounted into a backup or restore job as its object storage config.
pub async fn osm_secret(client: &Client, spec: &SnapshotStorageSpec, name: &str, namespace: &str) -> Result<Secret> {
    let context = osm_context(client, spec, namespace).await?;
    let config = OsmConfig {
        current_context: context.name.clone(),
        contexts: vec![context],
    };
    let yaml = serde_yaml::to_string(&config).map_err(Error::YamlSerializationError)?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            SECRET_CONFIG_KEY.to_string(),
            ByteString(yaml.into_bytes()),
        )])),
        ..Default::default()
    })
}

/// Writes and removes a marker object to prove the destination is usable.
pub async fn check_bucket_access(
    dialer: &dyn StorageDialer,
    client: &Client,
    spec: &SnapshotStorageSpec,
    namespace: &str,
) -> Result<()> {
    let context = osm_context(client, spec, namespace).await?;
    let container = dialer.dial(&context, spec.backend()?.container()).await?;
    container
        .put(CHECK_BUCKET_KEY, CHECK_BUCKET_CONTENT.as_bytes().to_vec())
        .await?;
    container.remove(CHECK_BUCKET_KEY).await?;
    debug!("bucket access verified for {}", spec.location()?);
    Ok(())
}

/// Removes every blob stored for `snapshot`, page by page.
pub async fn delete_snapshot_data(dialer: &dyn StorageDialer, client: &Client, snapshot: &Snapshot) -> Result<()> {
    let namespace = snapshot.namespace().unwrap_or_default();
    let storage = &snapshot.spec.storage;
    let context = osm_context(client, storage, &namespace).await?;
    let container = dialer.dial(&context, storage.backend()?.container()).await?;
    // the separator keeps databases sharing a name prefix apart
    let prefix = format!("{}/", snapshot.location()?);

    let mut removed = 0;
    let mut cursor = None;
    loop {
        let (items, next) = container.items(&prefix, cursor, ITEM_PAGE_SIZE).await?;
        for item in &items {
            container.remove(item).await?;
        }
        removed += items.len();
        match next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    info!("removed {} objects under {} for snapshot {}", removed, prefix, snapshot.name_any());
    Ok(())
}
