use super::xdb::XdbSpec;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Retained state of a deleted `Xdb`, from which it can be resumed or wiped out.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "DormantDatabase", group = "kubedb.com", version = "v1alpha1", namespaced)]
#[kube(status = "DormantDatabaseStatus", shortname = "drmn")]
#[kube(printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseSpec {
    pub origin: Origin,
    /// Delete the retained data, snapshots and unreferenced secrets
    #[serde(default)]
    pub wipe_out: bool,
    /// Recreate the database from `origin`
    #[serde(default)]
    pub resume: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Origin {
    pub metadata: OriginMeta,
    pub spec: OriginSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct OriginMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct OriginSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xdb: Option<XdbSpec>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pausing_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wiping_out_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DormantDatabasePhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum DormantDatabasePhase {
    Pausing,
    Paused,
    WipingOut,
    WipedOut,
    Resuming,
    Failed,
}

impl fmt::Display for DormantDatabasePhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DormantDatabasePhase::Pausing => write!(f, "Pausing"),
            DormantDatabasePhase::Paused => write!(f, "Paused"),
            DormantDatabasePhase::WipingOut => write!(f, "WipingOut"),
            DormantDatabasePhase::WipedOut => write!(f, "WipedOut"),
            DormantDatabasePhase::Resuming => write!(f, "Resuming"),
            DormantDatabasePhase::Failed => write!(f, "Failed"),
        }
    }
}

impl DormantDatabase {
    pub fn phase(&self) -> Option<DormantDatabasePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// A resume has been requested or is underway.
    pub fn is_resuming(&self) -> bool {
        self.spec.resume || self.phase() == Some(DormantDatabasePhase::Resuming)
    }
}
