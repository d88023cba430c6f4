use super::{storage::SnapshotStorageSpec, volume::VolumeSource};
use crate::api::{
    AGENT_COREOS_PROMETHEUS, ANNOTATION_XDB_VERSION, GENERIC_KEY_PREFIX, LABEL_DATABASE_KIND, LABEL_DATABASE_NAME,
    XDB_KEY_PREFIX,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, PersistentVolumeClaimSpec, ResourceRequirements, SecretVolumeSource, Toleration,
};
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Generate the Kubernetes wrapper struct `Xdb` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "Xdb", group = "kubedb.com", version = "v1alpha1", namespaced)]
#[kube(status = "XdbStatus", shortname = "xd")]
#[kube(printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#)]
#[kube(printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct XdbSpec {
    /// Version of Xdb to be deployed.
    pub version: String,
    /// Number of instances to deploy, defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Storage spec to specify how storage shall be used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<PersistentVolumeClaimSpec>,
    /// Database authentication secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_secret: Option<SecretVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Init is used to initialize database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitSpec>,
    /// BackupSchedule spec to specify how database backup will be taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_schedule: Option<BackupScheduleSpec>,
    /// If DoNotPause is true, deleting this object recreates it instead of pausing the database.
    #[serde(default)]
    pub do_not_pause: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_source: Option<ScriptSourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_source: Option<SnapshotSourceSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSourceSpec {
    pub script_path: String,
    #[serde(flatten)]
    pub volume_source: VolumeSource,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    pub cron_expression: String,
    #[serde(flatten)]
    pub storage: SnapshotStorageSpec,
    /// Compute resources for the backup job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSpec {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusSpec {
    /// Namespace of the ServiceMonitor, defaults to the database namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

/// The status object of `Xdb`
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct XdbStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DatabasePhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum DatabasePhase {
    Creating,
    Initializing,
    Running,
    Failed,
}

impl fmt::Display for DatabasePhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DatabasePhase::Creating => write!(f, "Creating"),
            DatabasePhase::Initializing => write!(f, "Initializing"),
            DatabasePhase::Running => write!(f, "Running"),
            DatabasePhase::Failed => write!(f, "Failed"),
        }
    }
}

impl XdbSpec {
    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }

    pub fn database_secret_name(&self) -> Option<&str> {
        self.database_secret.as_ref().and_then(|s| s.secret_name.as_deref())
    }

    /// True when metrics are scraped through the Prometheus operator and an exporter sidecar is needed.
    pub fn exports_metrics(&self) -> bool {
        self.monitor
            .as_ref()
            .is_some_and(|m| m.agent == AGENT_COREOS_PROMETHEUS && m.prometheus.is_some())
    }
}

fn is_operator_key(key: &str) -> bool {
    key.starts_with(GENERIC_KEY_PREFIX) || key.starts_with(XDB_KEY_PREFIX)
}

impl Xdb {
    pub fn offshoot_name(&self) -> String {
        self.name_any()
    }

    pub fn offshoot_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_DATABASE_NAME.to_string(), self.name_any()),
            (LABEL_DATABASE_KIND.to_string(), Self::kind(&()).to_string()),
        ])
    }

    /// User labels minus operator-owned keys, plus the ownership labels.
    pub fn statefulset_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.offshoot_labels();
        for (key, value) in self.labels() {
            if !is_operator_key(key) {
                labels.insert(key.clone(), value.clone());
            }
        }
        labels
    }

    pub fn statefulset_annotations(&self) -> BTreeMap<String, String> {
        let mut annotations: BTreeMap<String, String> = self
            .annotations()
            .iter()
            .filter(|(key, _)| !is_operator_key(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        annotations.insert(ANNOTATION_XDB_VERSION.to_string(), self.spec.version.clone());
        annotations
    }

    /// Name of the admin secret generated when the spec does not reference one.
    pub fn admin_secret_name(&self) -> String {
        format!("{}-admin-auth", self.name_any())
    }

    pub fn service_monitor_name(&self) -> String {
        format!("kubedb-{}-{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Path the exporter serves this database's metrics on.
    pub fn metrics_path(&self) -> String {
        format!(
            "/kubedb.com/v1alpha1/namespaces/{}/xdbs/{}/metrics",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
