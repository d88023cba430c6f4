use crate::api::v1alpha1::{DormantDatabase, Snapshot, Xdb};
use crate::util::{
    errors::{is_not_found, Result},
    wait::{poll_until, PollConfig},
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, PostParams},
    Client, CustomResourceExt, ResourceExt,
};
use tracing::{debug, info};

pub fn custom_resource_definitions() -> Vec<CustomResourceDefinition> {
    vec![Xdb::crd(), DormantDatabase::crd(), Snapshot::crd()]
}

fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
}

/// Registers missing definitions and waits until the API server serves them.
pub async fn ensure_custom_resource_definitions(client: &Client, poll: PollConfig) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    for crd in custom_resource_definitions() {
        let name = crd.name_any();
        match api.get(&name).await {
            Ok(_) => {
                debug!("CustomResourceDefinition {} already registered", name);
                continue;
            }
            Err(e) if is_not_found(&e) => {
                api.create(&PostParams::default(), &crd).await?;
                info!("registered CustomResourceDefinition {}", name);
            }
            Err(e) => return Err(e.into()),
        }

        let (crds, crd_name) = (&api, name.as_str());
        poll_until(&format!("CustomResourceDefinition {name} established"), poll, move || async move {
            match crds.get(crd_name).await {
                Ok(crd) if is_established(&crd) => Ok(Some(())),
                Ok(_) => Ok(None),
                Err(e) if is_not_found(&e) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await?;
    }
    Ok(())
}
