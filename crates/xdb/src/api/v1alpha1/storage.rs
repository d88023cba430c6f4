use crate::util::errors::{Error, Result};
use super::volume::VolumeSource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const AWS_REGION: &str = "AWS_REGION";
pub const GOOGLE_PROJECT_ID: &str = "GOOGLE_PROJECT_ID";
pub const GOOGLE_SERVICE_ACCOUNT_JSON_KEY: &str = "GOOGLE_SERVICE_ACCOUNT_JSON_KEY";
pub const AZURE_ACCOUNT_NAME: &str = "AZURE_ACCOUNT_NAME";
pub const AZURE_ACCOUNT_KEY: &str = "AZURE_ACCOUNT_KEY";

// Object storage config keys understood by the backup image.
pub const CONFIG_S3_ACCESS_KEY_ID: &str = "access_key_id";
pub const CONFIG_S3_SECRET_KEY: &str = "secret_key";
pub const CONFIG_S3_ENDPOINT: &str = "endpoint";
pub const CONFIG_S3_REGION: &str = "region";
pub const CONFIG_S3_DISABLE_SSL: &str = "disable_ssl";
pub const CONFIG_GOOGLE_PROJECT_ID: &str = "project_id";
pub const CONFIG_GOOGLE_JSON: &str = "json";
pub const CONFIG_AZURE_ACCOUNT: &str = "account";
pub const CONFIG_AZURE_KEY: &str = "key";
pub const CONFIG_LOCAL_PATH: &str = "path";

const DEFAULT_S3_REGION: &str = "us-east-1";

const SWIFT_CREDENTIALS: &[(&str, &str)] = &[
    ("OS_USERNAME", "username"),
    ("OS_PASSWORD", "key"),
    ("OS_REGION_NAME", "region"),
    ("OS_AUTH_URL", "tenant_auth_url"),
    ("OS_USER_DOMAIN_NAME", "domain"),
    ("OS_PROJECT_NAME", "tenant_name"),
    ("OS_PROJECT_DOMAIN_NAME", "tenant_domain"),
    ("OS_TENANT_ID", "tenant_id"),
    ("OS_TENANT_NAME", "tenant_name"),
    ("ST_AUTH", "tenant_auth_url"),
    ("ST_USER", "username"),
    ("ST_KEY", "key"),
    ("OS_STORAGE_URL", "storage_url"),
    ("OS_AUTH_TOKEN", "auth_token"),
];

/// Where a snapshot is written to. Exactly one backend must be set.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStorageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Spec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swift: Option<SwiftSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Spec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcsSpec {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureSpec {
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalSpec {
    #[serde(flatten)]
    pub volume_source: VolumeSource,
    pub path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SwiftSpec {
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    S3,
    Gcs,
    Azure,
    Local,
    Swift,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::S3 => "s3",
            Provider::Gcs => "google",
            Provider::Azure => "azure",
            Provider::Local => "local",
            Provider::Swift => "swift",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A configured storage backend.
pub trait Backend: Send + Sync {
    fn provider(&self) -> Provider;

    /// Bucket, container or directory the backend writes into.
    fn container(&self) -> &str;

    fn prefix(&self) -> &str {
        ""
    }

    /// Keys the storage secret must carry for this backend.
    fn required_credentials(&self) -> &'static [&'static str] {
        &[]
    }

    /// Maps the storage secret onto object storage config keys.
    fn credentials(&self, secret: &BTreeMap<String, String>) -> BTreeMap<String, String>;

    /// Whether a storage secret has to be referenced at all.
    fn needs_secret(&self) -> bool {
        true
    }
}

fn copy_keys(secret: &BTreeMap<String, String>, mapping: &[(&str, &str)]) -> BTreeMap<String, String> {
    mapping
        .iter()
        .filter_map(|(from, to)| secret.get(*from).map(|v| (to.to_string(), v.clone())))
        .collect()
}

impl Backend for S3Spec {
    fn provider(&self) -> Provider {
        Provider::S3
    }

    fn container(&self) -> &str {
        &self.bucket
    }

    fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or_default()
    }

    fn required_credentials(&self) -> &'static [&'static str] {
        &[AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY]
    }

    fn credentials(&self, secret: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut config = copy_keys(
            secret,
            &[
                (AWS_ACCESS_KEY_ID, CONFIG_S3_ACCESS_KEY_ID),
                (AWS_SECRET_ACCESS_KEY, CONFIG_S3_SECRET_KEY),
            ],
        );
        let region = secret.get(AWS_REGION).map(String::as_str).unwrap_or(DEFAULT_S3_REGION);
        config.insert(CONFIG_S3_REGION.into(), region.into());
        if let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.is_empty()) {
            config.insert(CONFIG_S3_ENDPOINT.into(), endpoint.into());
            if endpoint.starts_with("http://") {
                config.insert(CONFIG_S3_DISABLE_SSL.into(), "true".into());
            }
        }
        config
    }
}

impl Backend for GcsSpec {
    fn provider(&self) -> Provider {
        Provider::Gcs
    }

    fn container(&self) -> &str {
        &self.bucket
    }

    fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or_default()
    }

    fn required_credentials(&self) -> &'static [&'static str] {
        &[GOOGLE_PROJECT_ID, GOOGLE_SERVICE_ACCOUNT_JSON_KEY]
    }

    fn credentials(&self, secret: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        copy_keys(
            secret,
            &[
                (GOOGLE_PROJECT_ID, CONFIG_GOOGLE_PROJECT_ID),
                (GOOGLE_SERVICE_ACCOUNT_JSON_KEY, CONFIG_GOOGLE_JSON),
            ],
        )
    }
}

impl Backend for AzureSpec {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    fn container(&self) -> &str {
        &self.container
    }

    fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or_default()
    }

    fn required_credentials(&self) -> &'static [&'static str] {
        &[AZURE_ACCOUNT_NAME, AZURE_ACCOUNT_KEY]
    }

    fn credentials(&self, secret: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        copy_keys(
            secret,
            &[(AZURE_ACCOUNT_NAME, CONFIG_AZURE_ACCOUNT), (AZURE_ACCOUNT_KEY, CONFIG_AZURE_KEY)],
        )
    }
}

impl Backend for LocalSpec {
    fn provider(&self) -> Provider {
        Provider::Local
    }

    fn container(&self) -> &str {
        &self.path
    }

    fn credentials(&self, _: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        BTreeMap::from([(CONFIG_LOCAL_PATH.to_string(), self.path.clone())])
    }

    fn needs_secret(&self) -> bool {
        false
    }
}

impl Backend for SwiftSpec {
    fn provider(&self) -> Provider {
        Provider::Swift
    }

    fn container(&self) -> &str {
        &self.container
    }

    fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or_default()
    }

    fn credentials(&self, secret: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        copy_keys(secret, SWIFT_CREDENTIALS)
    }
}

impl SnapshotStorageSpec {
    pub fn backends(&self) -> Vec<&dyn Backend> {
        let mut backends: Vec<&dyn Backend> = Vec::new();
        if let Some(s3) = &self.s3 {
            backends.push(s3);
        }
        if let Some(gcs) = &self.gcs {
            backends.push(gcs);
        }
        if let Some(azure) = &self.azure {
            backends.push(azure);
        }
        if let Some(local) = &self.local {
            backends.push(local);
        }
        if let Some(swift) = &self.swift {
            backends.push(swift);
        }
        backends
    }

    pub fn backend(&self) -> Result<&dyn Backend> {
        match self.backends().as_slice() {
            [backend] => Ok(*backend),
            [] => Err(Error::ValidationError("no storage provider is configured".into())),
            _ => Err(Error::ValidationError(
                "multiple storage providers are configured".into(),
            )),
        }
    }

    /// `<provider>:<container>`, the bucket argument handed to backup and restore jobs.
    pub fn location(&self) -> Result<String> {
        let backend = self.backend()?;
        Ok(format!("{}:{}", backend.provider(), backend.container()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn location_names_provider_and_container() {
        let spec = SnapshotStorageSpec {
            gcs: Some(GcsSpec {
                bucket: "backups".into(),
                prefix: None,
            }),
            ..Default::default()
        };
        assert_eq!(spec.location().unwrap(), "google:backups");

        let spec = SnapshotStorageSpec {
            local: Some(LocalSpec {
                path: "/var/backups".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(spec.location().unwrap(), "local:/var/backups");
        assert!(!spec.backend().unwrap().needs_secret());
    }

    #[test]
    fn exactly_one_backend_is_accepted() {
        assert!(matches!(
            SnapshotStorageSpec::default().backend(),
            Err(Error::ValidationError(_))
        ));
        let both = SnapshotStorageSpec {
            azure: Some(AzureSpec {
                container: "c".into(),
                prefix: None,
            }),
            swift: Some(SwiftSpec {
                container: "c".into(),
                prefix: None,
            }),
            ..Default::default()
        };
        assert!(both.backend().is_err());
    }

    #[test]
    fn s3_credentials_follow_endpoint_scheme() {
        let s3 = S3Spec {
            endpoint: Some("http://minio:9000".into()),
            bucket: "b".into(),
            prefix: Some("team".into()),
        };
        let config = s3.credentials(&secret(&[(AWS_ACCESS_KEY_ID, "id"), (AWS_SECRET_ACCESS_KEY, "key")]));
        assert_eq!(config[CONFIG_S3_ACCESS_KEY_ID], "id");
        assert_eq!(config[CONFIG_S3_SECRET_KEY], "key");
        assert_eq!(config[CONFIG_S3_ENDPOINT], "http://minio:9000");
        assert_eq!(config[CONFIG_S3_DISABLE_SSL], "true");
        assert_eq!(config[CONFIG_S3_REGION], DEFAULT_S3_REGION);
        assert_eq!(s3.prefix(), "team");
    }

    #[test]
    fn swift_credentials_map_openstack_keys() {
        let swift = SwiftSpec {
            container: "c".into(),
            prefix: None,
        };
        let config = swift.credentials(&secret(&[("OS_USERNAME", "u"), ("OS_PASSWORD", "p"), ("UNRELATED", "x")]));
        assert_eq!(config.len(), 2);
        assert_eq!(config["username"], "u");
        assert_eq!(config["key"], "p");
    }
}
