//! Namespaced custom-resource access.
//!
//! Runners talk to the cluster through [`CustomObjectApi`] so tests can swap in
//! a fake. [`KubeCustomObjects`] is the `kube` implementation over
//! `DynamicObject`.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::discovery::ApiResource;
use serde_json::Value;

use crate::error::RunnerError;

/// Create, read and delete one kind of custom resource by name.
///
/// Implementations map HTTP 404 to [`RunnerError::NotFound`] (carrying the
/// resource name) and 409 to [`RunnerError::Conflict`].
#[async_trait]
pub trait CustomObjectApi: Send + Sync {
    /// The resource kind, used in error messages.
    fn kind(&self) -> &str;

    async fn create(&self, namespace: &str, body: &Value) -> Result<Value, RunnerError>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Value, RunnerError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), RunnerError>;
}

/// Describe a namespaced custom resource without API discovery.
pub fn api_resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: format!("{group}/{version}"),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

pub struct KubeCustomObjects {
    client: kube::Client,
    resource: ApiResource,
}

impl KubeCustomObjects {
    pub fn new(client: kube::Client, resource: ApiResource) -> Self {
        Self { client, resource }
    }

    /// Build for an already split `group` and `version`.
    pub fn for_kind(
        client: kube::Client,
        group: &str,
        version: &str,
        kind: &str,
        plural: &str,
    ) -> Self {
        Self::new(client, api_resource(group, version, kind, plural))
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }

    fn map_error(&self, err: kube::Error, name: &str) -> RunnerError {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => RunnerError::not_found(name),
            kube::Error::Api(ae) if ae.code == 409 => RunnerError::Conflict {
                kind: self.resource.kind.clone(),
                name: name.to_string(),
            },
            other => RunnerError::Kube(other),
        }
    }
}

#[async_trait]
impl CustomObjectApi for KubeCustomObjects {
    fn kind(&self) -> &str {
        &self.resource.kind
    }

    async fn create(&self, namespace: &str, body: &Value) -> Result<Value, RunnerError> {
        let object: DynamicObject = serde_json::from_value(body.clone())?;
        let name = object.metadata.name.clone().unwrap_or_default();
        let created = self
            .api(namespace)
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| self.map_error(e, &name))?;
        Ok(serde_json::to_value(created)?)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Value, RunnerError> {
        let object = self
            .api(namespace)
            .get(name)
            .await
            .map_err(|e| self.map_error(e, name))?;
        Ok(serde_json::to_value(object)?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), RunnerError> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| self.map_error(e, name))?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;

    #[test]
    fn test_api_resource_from_configured_version() {
        let config = RunnerConfig::default();
        let (group, version) = config.group_version().unwrap();
        let resource = api_resource(group, version, "TrainJob", &config.train_job_plural);
        assert_eq!(resource.api_version, config.train_job_api_version);
        assert_eq!(resource.group, "trainer.kubeflow.org");
        assert_eq!(resource.version, "v1alpha1");
        assert_eq!(resource.plural, "trainjobs");
    }
}
