use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, EmptyDirVolumeSource, HostPathVolumeSource, NFSVolumeSource,
    PersistentVolumeClaimVolumeSource, SecretVolumeSource, Volume,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The volume sources a script or a local backup directory can be mounted from.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs: Option<NFSVolumeSource>,
}

impl VolumeSource {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn to_volume(&self, name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            config_map: self.config_map.clone(),
            secret: self.secret.clone(),
            persistent_volume_claim: self.persistent_volume_claim.clone(),
            host_path: self.host_path.clone(),
            empty_dir: self.empty_dir.clone(),
            nfs: self.nfs.clone(),
            ..Default::default()
        }
    }
}
