pub mod errors;
pub mod metrics;
pub mod patch;
pub mod telemetry;
pub mod wait;

use std::collections::BTreeMap;

/// Renders equality-based labels as a selector string, `k1=v1,k2=v2`.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
