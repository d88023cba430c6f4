use crate::util::errors::{is_conflict, is_not_found, Error, Result};
use kube::{
    api::{Api, Patch, PatchParams},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::fmt::Debug;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

/// Backoff bounds for [`try_patch`] and [`try_patch_status`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Object,
    Status,
}

/// Applies `transform` to the latest version of `name` and submits the difference as a merge patch.
///
/// The patch carries the fetched `resourceVersion`, so a concurrent writer makes it fail with a
/// conflict and the whole read-transform-submit cycle is retried. `status` changes are dropped,
/// use [`try_patch_status`] for those.
pub async fn try_patch<K, F>(api: &Api<K>, name: &str, policy: &RetryPolicy, transform: F) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
    F: FnMut(&mut K),
{
    retry_patch(api, name, Target::Object, policy, transform).await
}

/// Same as [`try_patch`] against the status subresource.
pub async fn try_patch_status<K, F>(api: &Api<K>, name: &str, policy: &RetryPolicy, transform: F) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
    F: FnMut(&mut K),
{
    retry_patch(api, name, Target::Status, policy, transform).await
}

async fn retry_patch<K, F>(
    api: &Api<K>,
    name: &str,
    target: Target,
    policy: &RetryPolicy,
    mut transform: F,
) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
    F: FnMut(&mut K),
{
    let kind = K::kind(&()).to_string();
    let start = Instant::now();
    let mut delay = policy.initial;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let reason = match patch_once(api, name, target, &mut transform).await {
            Ok(object) => return Ok(object),
            Err(Error::KubeError(e)) if is_not_found(&e) => {
                return Err(Error::NotFound(format!("{kind} {name}")));
            }
            Err(Error::KubeError(e)) if is_conflict(&e) => {
                debug!(kind = %kind, name, attempts, "patch conflict, retrying");
                e.to_string()
            }
            Err(e @ Error::JsonSerializationError(_)) => return Err(e),
            Err(e) => {
                warn!(kind = %kind, name, attempts, "patch failed, retrying: {}", e);
                e.to_string()
            }
        };

        if start.elapsed() >= policy.timeout {
            return Err(Error::PatchFailed {
                kind,
                name: name.to_string(),
                attempts,
                reason,
            });
        }
        sleep(delay).await;
        delay = policy.next_delay(delay);
    }
}

async fn patch_once<K, F>(api: &Api<K>, name: &str, target: Target, transform: &mut F) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
    F: FnMut(&mut K),
{
    let current = api.get(name).await?;
    let mut modified = current.clone();
    transform(&mut modified);

    let diff = merge_diff(&serde_json::to_value(&current)?, &serde_json::to_value(&modified)?);
    let Some(Value::Object(mut body)) = diff else {
        return Ok(current);
    };
    match target {
        Target::Object => {
            body.remove("status");
        }
        Target::Status => body.retain(|k, _| k == "status"),
    }
    if body.is_empty() {
        return Ok(current);
    }

    if let Some(rv) = current.resource_version() {
        let metadata = body
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            metadata.insert("resourceVersion".into(), Value::String(rv));
        }
    }

    let body = Value::Object(body);
    let pp = PatchParams::default();
    let patched = match target {
        Target::Object => api.patch(name, &pp, &Patch::Merge(&body)).await?,
        Target::Status => api.patch_status(name, &pp, &Patch::Merge(&body)).await?,
    };
    Ok(patched)
}

/// Computes the JSON merge patch (RFC 7386) turning `original` into `modified`.
///
/// Returns `None` when both documents are equal. Arrays are replaced wholesale.
pub fn merge_diff(original: &Value, modified: &Value) -> Option<Value> {
    match (original, modified) {
        (Value::Object(original), Value::Object(modified)) => {
            let mut patch = Map::new();
            for (key, new) in modified {
                match original.get(key) {
                    Some(old) => {
                        if let Some(diff) = merge_diff(old, new) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), new.clone());
                    }
                }
            }
            for key in original.keys() {
                if !modified.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        _ if original == modified => None,
        _ => Some(modified.clone()),
    }
}
