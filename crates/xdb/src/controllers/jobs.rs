//! Backup and restore jobs.
//!
//! A job mounts a scratch volume and the object storage config secret, and runs the util image in
//! backup or restore mode against the database service.

use crate::api::{
    v1alpha1::{Snapshot, Xdb},
    JOB_TYPE_BACKUP, JOB_TYPE_RESTORE, LABEL_JOB_TYPE,
};
use crate::config::Config;
use crate::storage;
use crate::util::{
    errors::{is_conflict, is_not_found, Error, Result},
    wait::{poll_until, PollConfig},
};
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            Container, EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
            PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec, Secret, SecretVolumeSource,
            Volume, VolumeMount,
        },
    },
};
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams, PropagationPolicy},
    Client, ResourceExt,
};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const UTIL_VOLUME: &str = "util-volume";
pub const OSM_VOLUME: &str = "osmconfig";
pub const OSM_MOUNT_PATH: &str = "/etc/osm";
pub const LOCAL_VOLUME: &str = "local";
pub const BACKUP_MOUNT_PATH: &str = "/var/dump-backup/";
pub const RESTORE_MOUNT_PATH: &str = "/var/dump-restore/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Backup,
    Restore,
}

impl JobMode {
    pub fn job_type(&self) -> &'static str {
        match self {
            JobMode::Backup => JOB_TYPE_BACKUP,
            JobMode::Restore => JOB_TYPE_RESTORE,
        }
    }

    fn mount_path(&self) -> &'static str {
        match self {
            JobMode::Backup => BACKUP_MOUNT_PATH,
            JobMode::Restore => RESTORE_MOUNT_PATH,
        }
    }

    fn image(&self, config: &Config, version: &str) -> String {
        match self {
            JobMode::Backup => config.util_image(version),
            JobMode::Restore => config.xdb_image(version),
        }
    }
}

/// Scratch space of a job: a claim named after the job when the database uses persistent
/// storage, an empty dir otherwise.
pub fn scratch_volume(xdb: &Xdb, job_name: &str, namespace: &str) -> (Volume, Option<PersistentVolumeClaim>) {
    match &xdb.spec.storage {
        Some(storage) => {
            let mut spec: PersistentVolumeClaimSpec = storage.clone();
            if spec.access_modes.as_ref().map_or(true, |m| m.is_empty()) {
                spec.access_modes = Some(vec!["ReadWriteOnce".to_string()]);
            }
            let claim = PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(job_name.to_string()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(xdb.offshoot_labels()),
                    ..Default::default()
                },
                spec: Some(spec),
                ..Default::default()
            };
            let volume = Volume {
                name: UTIL_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: job_name.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            };
            (volume, Some(claim))
        }
        None => (
            Volume {
                name: UTIL_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            None,
        ),
    }
}

/// Everything a job run needs created, in creation order: claim, then job.
pub struct JobPlan {
    pub job: Job,
    pub claim: Option<PersistentVolumeClaim>,
}

/// Builds the job moving `snapshot` in or out of `xdb`. The job, its claim and its config secret
/// all share the snapshot's name.
pub fn job_plan(config: &Config, xdb: &Xdb, snapshot: &Snapshot, mode: JobMode) -> Result<JobPlan> {
    let namespace = xdb
        .namespace()
        .ok_or_else(|| Error::MetadataMissing("Xdb has no namespace".into()))?;
    let job_name = snapshot.name_any();
    let storage = &snapshot.spec.storage;

    let labels = job_selector(xdb, mode);

    let (scratch, claim) = scratch_volume(xdb, &job_name, &namespace);
    let mut volumes = vec![
        scratch,
        Volume {
            name: OSM_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(job_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    let mut mounts = vec![
        VolumeMount {
            name: UTIL_VOLUME.to_string(),
            mount_path: mode.mount_path().to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: OSM_VOLUME.to_string(),
            mount_path: OSM_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];
    if let Some(local) = &storage.local {
        volumes.push(local.volume_source.to_volume(LOCAL_VOLUME));
        mounts.push(VolumeMount {
            name: LOCAL_VOLUME.to_string(),
            mount_path: local.path.clone(),
            ..Default::default()
        });
    }

    let container = Container {
        name: mode.job_type().to_string(),
        image: Some(mode.image(config, &xdb.spec.version)),
        args: Some(vec![
            format!("--process={}", mode.job_type()),
            format!("--host={}", xdb.offshoot_name()),
            format!("--bucket={}", storage.location()?),
            format!("--folder={}", snapshot.location()?),
            format!("--snapshot={}", snapshot.name_any()),
        ]),
        resources: snapshot.spec.resources.clone(),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let job = Job {
        metadata: ObjectMeta {
            name: Some(job_name),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    restart_policy: Some("Never".to_string()),
                    node_selector: xdb.spec.node_selector.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(JobPlan { job, claim })
}

async fn create_tolerating_existing<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(e) if is_conflict(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Creates the config secret, the scratch claim and the job for `snapshot`.
///
/// The config secret is built from the storage secret in `storage_namespace`, which differs from
/// the job's namespace when restoring from another namespace.
pub async fn launch(
    client: &Client,
    config: &Config,
    xdb: &Xdb,
    snapshot: &Snapshot,
    storage_namespace: &str,
    mode: JobMode,
) -> Result<String> {
    let plan = job_plan(config, xdb, snapshot, mode)?;
    let namespace = plan.job.namespace().unwrap_or_default();
    let name = plan.job.name_any();

    let mut secret = storage::osm_secret(client, &snapshot.spec.storage, &name, storage_namespace).await?;
    secret.metadata.namespace = Some(namespace.clone());
    secret.metadata.labels = Some(xdb.offshoot_labels());
    create_tolerating_existing(&Api::<Secret>::namespaced(client.clone(), &namespace), &secret).await?;

    if let Some(claim) = &plan.claim {
        create_tolerating_existing(&Api::<PersistentVolumeClaim>::namespaced(client.clone(), &namespace), claim)
            .await?;
    }
    Api::<Job>::namespaced(client.clone(), &namespace)
        .create(&PostParams::default(), &plan.job)
        .await?;
    info!("started {} job {}/{}", mode.job_type(), namespace, name);
    Ok(name)
}

/// Waits for `name` to succeed or fail, then removes the job, its pods, its claim and its secret
/// whatever the outcome. Returns whether the job succeeded.
pub async fn check_job(client: &Client, namespace: &str, name: &str, poll: PollConfig) -> Result<bool> {
    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
    let (jobs_ref, job_name) = (&jobs, name);
    let outcome = poll_until(&format!("job {namespace}/{name}"), poll, move || async move {
        let job = jobs_ref.get(job_name).await?;
        let status = job.status.unwrap_or_default();
        if status.succeeded.unwrap_or_default() > 0 {
            Ok(Some(true))
        } else if status.failed.unwrap_or_default() > 0 {
            Ok(Some(false))
        } else {
            Ok(None)
        }
    })
    .await;

    if let Err(e) = delete_job_resources(client, namespace, name).await {
        warn!("failed to clean up job {}/{}: {}", namespace, name, e);
    }
    outcome
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str, params: &DeleteParams) -> Result<()>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    match api.delete(name, params).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_job_resources(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let background = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    };
    delete_ignoring_missing(&Api::<Job>::namespaced(client.clone(), namespace), name, &background).await?;
    Api::<Pod>::namespaced(client.clone(), namespace)
        .delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(&format!("job-name={name}")),
        )
        .await?;
    delete_ignoring_missing(
        &Api::<PersistentVolumeClaim>::namespaced(client.clone(), namespace),
        name,
        &DeleteParams::default(),
    )
    .await?;
    delete_ignoring_missing(
        &Api::<Secret>::namespaced(client.clone(), namespace),
        name,
        &DeleteParams::default(),
    )
    .await?;
    Ok(())
}

/// Labels selecting the jobs of one kind run for `xdb`.
pub fn job_selector(xdb: &Xdb, mode: JobMode) -> BTreeMap<String, String> {
    let mut labels = xdb.offshoot_labels();
    labels.insert(LABEL_JOB_TYPE.to_string(), mode.job_type().to_string());
    labels
}
