use super::storage::SnapshotStorageSpec;
use crate::api::DATABASE_NAME_PREFIX;
use crate::util::errors::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "Snapshot", group = "kubedb.com", version = "v1alpha1", namespaced)]
#[kube(status = "SnapshotStatus", shortname = "snap")]
#[kube(printcolumn = r#"{"name":"Database","type":"string","jsonPath":".spec.databaseName"}"#)]
#[kube(printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSpec {
    /// Name of the Xdb this snapshot backs up
    pub database_name: String,
    #[serde(flatten)]
    pub storage: SnapshotStorageSpec,
    /// Compute resources for the backup job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SnapshotPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum SnapshotPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SnapshotPhase::Pending => write!(f, "Pending"),
            SnapshotPhase::Running => write!(f, "Running"),
            SnapshotPhase::Succeeded => write!(f, "Succeeded"),
            SnapshotPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl Snapshot {
    /// Folder inside the container that holds this database's snapshots.
    ///
    /// `<prefix>/kubedb/<namespace>/<database>`; the prefix is empty for local storage.
    pub fn location(&self) -> Result<String> {
        let backend = self.spec.storage.backend()?;
        let namespace = self.namespace().unwrap_or_default();
        let path = backend
            .prefix()
            .split('/')
            .chain([DATABASE_NAME_PREFIX, namespace.as_str(), self.spec.database_name.as_str()])
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Ok(path)
    }

    pub fn phase(&self) -> Option<SnapshotPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }
}
