use crate::api::{v1alpha1::Xdb, GROUP};
use crate::util::errors::{is_not_found, Error, Result};
use k8s_openapi::api::{
    core::v1::ServiceAccount,
    rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
};
use kube::{
    api::{Api, DeleteParams, ObjectMeta, PostParams},
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use tracing::info;

fn meta(name: &str, namespace: &str, xdb: &Xdb) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(xdb.offshoot_labels()),
        ..Default::default()
    }
}

/// Role letting the database pods read their own `Xdb` and admin secret.
pub fn role(xdb: &Xdb, namespace: &str) -> Role {
    let name = xdb.offshoot_name();
    let mut rules = vec![PolicyRule {
        api_groups: Some(vec![GROUP.to_string()]),
        resources: Some(vec![Xdb::plural(&()).to_string()]),
        resource_names: Some(vec![name.clone()]),
        verbs: vec!["get".to_string()],
        ..Default::default()
    }];
    if let Some(secret) = xdb.spec.database_secret_name() {
        rules.push(PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_string()]),
            resource_names: Some(vec![secret.to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        });
    }
    Role {
        metadata: meta(&name, namespace, xdb),
        rules: Some(rules),
    }
}

pub fn service_account(xdb: &Xdb, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: meta(&xdb.offshoot_name(), namespace, xdb),
        ..Default::default()
    }
}

pub fn role_binding(xdb: &Xdb, namespace: &str) -> RoleBinding {
    let name = xdb.offshoot_name();
    RoleBinding {
        metadata: meta(&name, namespace, xdb),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

async fn create_if_missing<K>(client: &Client, namespace: &str, obj: &K) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    if api.get_opt(&obj.name_any()).await?.is_none() {
        api.create(&PostParams::default(), obj).await?;
        info!("created {} {}/{}", K::kind(&()), namespace, obj.name_any());
    }
    Ok(())
}

/// Creates the Role, ServiceAccount and RoleBinding of `xdb` that do not exist yet.
pub async fn ensure_rbac(client: &Client, xdb: &Xdb) -> Result<()> {
    let namespace = xdb
        .namespace()
        .ok_or_else(|| Error::MetadataMissing("Xdb has no namespace".into()))?;
    create_if_missing(client, &namespace, &role(xdb, &namespace)).await?;
    create_if_missing(client, &namespace, &service_account(xdb, &namespace)).await?;
    create_if_missing(client, &namespace, &role_binding(xdb, &namespace)).await?;
    Ok(())
}

async fn delete_ignoring_missing<K>(client: &Client, namespace: &str, name: &str) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Removes the access-control objects named `name`; missing objects are not an error.
pub async fn delete_rbac(client: &Client, namespace: &str, name: &str) -> Result<()> {
    delete_ignoring_missing::<RoleBinding>(client, namespace, name).await?;
    delete_ignoring_missing::<ServiceAccount>(client, namespace, name).await?;
    delete_ignoring_missing::<Role>(client, namespace, name).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::XdbSpec;
    use crate::fixtures::ApiServer;
    use k8s_openapi::api::core::v1::SecretVolumeSource;

    fn xdb() -> Xdb {
        let mut xdb = Xdb::new(
            "db1",
            XdbSpec {
                version: "1.0".into(),
                database_secret: Some(SecretVolumeSource {
                    secret_name: Some("db1-admin-auth".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        xdb.metadata.namespace = Some("default".into());
        xdb
    }

    #[test]
    fn role_is_scoped_to_the_database_and_its_secret() {
        let role = role(&xdb(), "default");
        let rules = role.rules.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].resources.as_deref(), Some(&["xdbs".to_string()][..]));
        assert_eq!(rules[0].resource_names.as_deref(), Some(&["db1".to_string()][..]));
        assert_eq!(rules[1].resource_names.as_deref(), Some(&["db1-admin-auth".to_string()][..]));
    }

    #[tokio::test]
    async fn ensure_and_delete_are_idempotent() {
        let (client, server) = ApiServer::start();
        ensure_rbac(&client, &xdb()).await.unwrap();
        ensure_rbac(&client, &xdb()).await.unwrap();
        assert_eq!(server.count_requests("POST"), 3);
        assert!(server.get::<RoleBinding>("default", "db1").is_some());

        delete_rbac(&client, "default", "db1").await.unwrap();
        delete_rbac(&client, "default", "db1").await.unwrap();
        assert!(server.get::<Role>("default", "db1").is_none());
        assert!(server.get::<ServiceAccount>("default", "db1").is_none());
    }
}
