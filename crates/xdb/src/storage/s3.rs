use super::Container;
use crate::api::v1alpha1::storage::{
    CONFIG_S3_ACCESS_KEY_ID, CONFIG_S3_ENDPOINT, CONFIG_S3_REGION, CONFIG_S3_SECRET_KEY,
};
use crate::util::errors::{Error, Result};
use async_trait::async_trait;
use aws_credential_types::{provider::SharedCredentialsProvider, Credentials};
use aws_sdk_s3::{error::DisplayErrorContext, primitives::ByteStream};
use std::collections::BTreeMap;

/// An S3 (or S3 compatible) bucket.
#[derive(Debug, Clone)]
pub struct S3Container {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Container {
    /// Builds a client from the object storage config keys of an S3 context.
    pub fn connect(config: &BTreeMap<String, String>, bucket: &str) -> Self {
        let value = |key: &str| config.get(key).cloned().unwrap_or_default();
        let creds = Credentials::new(
            value(CONFIG_S3_ACCESS_KEY_ID),
            value(CONFIG_S3_SECRET_KEY),
            None,
            None,
            "xdb-operator",
        );

        let mut sdk = aws_config::SdkConfig::builder()
            .credentials_provider(SharedCredentialsProvider::new(creds))
            .region(aws_config::Region::new(value(CONFIG_S3_REGION)));
        if let Some(endpoint) = config.get(CONFIG_S3_ENDPOINT) {
            sdk = sdk.endpoint_url(endpoint);
        }
        let sdk = sdk.build();

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk)
            .force_path_style(true)
            .behavior_version_latest()
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: bucket.to_string(),
        }
    }
}

fn s3_error<E: std::error::Error>(op: &str, e: E) -> Error {
    Error::StorageError(format!("s3 {op}: {}", DisplayErrorContext(e)))
}

#[async_trait]
impl Container for S3Container {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| s3_error("put", e))?;
        Ok(())
    }

    async fn items(&self, prefix: &str, cursor: Option<String>, limit: usize) -> Result<(Vec<String>, Option<String>)> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(i32::try_from(limit).unwrap_or(i32::MAX))
            .set_continuation_token(cursor)
            .send()
            .await
            .map_err(|e| s3_error("list", e))?;

        let keys = output
            .contents()
            .iter()
            .filter_map(|object| object.key().map(str::to_string))
            .collect();
        let next = match output.is_truncated() {
            Some(true) => output.next_continuation_token().map(str::to_string),
            _ => None,
        };
        Ok((keys, next))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_error("delete", e))?;
        Ok(())
    }
}
