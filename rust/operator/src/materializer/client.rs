use async_trait::async_trait;
use snafu::Snafu;
use stackable_operator::{
    client::Client,
    kube::{
        api::{ApiResource, DynamicObject, GroupVersionKind, PostParams},
        discovery::{self, Scope},
        Api, ResourceExt,
    },
};

use crate::error::{Classify, ErrorClass};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("no API resource is registered for kind [{kind}] in [{api_version}]"))]
    UnknownKind { api_version: String, kind: String },

    #[snafu(display("{kind} [{name}] already exists"))]
    AlreadyExists { kind: String, name: String },

    #[snafu(display("{kind} [{name}] was modified since it was read"))]
    Conflict { kind: String, name: String },

    #[snafu(display("failed to discover the API resource for [{api_version}] [{kind}]"))]
    Discovery {
        source: stackable_operator::kube::Error,
        api_version: String,
        kind: String,
    },

    #[snafu(display("failed to {verb} {kind} [{name}]"))]
    Request {
        source: stackable_operator::kube::Error,
        verb: &'static str,
        kind: String,
        name: String,
    },
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::UnknownKind { .. } => ErrorClass::Configuration,
            Error::AlreadyExists { .. } | Error::Conflict { .. } => ErrorClass::Conflict,
            Error::Discovery { .. } | Error::Request { .. } => ErrorClass::Transient,
        }
    }
}

/// The REST mapping of a kind: its resource name and whether it lives in a namespace.
#[derive(Clone, Debug)]
pub struct ApiMapping {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// The cluster operations resource creation needs, abstracted for testability.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiMapping>;

    async fn create(
        &self,
        mapping: &ApiMapping,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    async fn get(&self, mapping: &ApiMapping, namespace: &str, name: &str)
        -> Result<DynamicObject>;

    /// Replaces the object. Fails with [`Error::Conflict`] if the object's `resourceVersion` is
    /// no longer current.
    async fn replace(
        &self,
        mapping: &ApiMapping,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;
}

/// [`ResourceClient`] backed by the Kubernetes API, using discovery to map kinds to resources.
pub struct KubeResourceClient {
    client: stackable_operator::kube::Client,
}

impl KubeResourceClient {
    pub fn new(client: &Client) -> Self {
        Self {
            client: client.as_kube_client(),
        }
    }

    fn api(&self, mapping: &ApiMapping, namespace: &str) -> Api<DynamicObject> {
        if mapping.namespaced {
            Api::namespaced_with(self.client.clone(), namespace, &mapping.resource)
        } else {
            Api::all_with(self.client.clone(), &mapping.resource)
        }
    }
}

pub fn api_version(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

fn has_reason(error: &stackable_operator::kube::Error, reason: &str) -> bool {
    matches!(error, stackable_operator::kube::Error::Api(response) if response.reason == reason)
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiMapping> {
        let api_version = api_version(gvk);
        match discovery::pinned_kind(&self.client, gvk).await {
            Ok((resource, capabilities)) => Ok(ApiMapping {
                resource,
                namespaced: matches!(capabilities.scope, Scope::Namespaced),
            }),
            Err(stackable_operator::kube::Error::Discovery(_)) => UnknownKindSnafu {
                api_version,
                kind: &gvk.kind,
            }
            .fail(),
            Err(stackable_operator::kube::Error::Api(response)) if response.code == 404 => {
                UnknownKindSnafu {
                    api_version,
                    kind: &gvk.kind,
                }
                .fail()
            }
            Err(source) => Err(Error::Discovery {
                source,
                api_version,
                kind: gvk.kind.clone(),
            }),
        }
    }

    async fn create(
        &self,
        mapping: &ApiMapping,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let kind = &mapping.resource.kind;
        let name = object.name_any();
        match self
            .api(mapping, namespace)
            .create(&PostParams::default(), object)
            .await
        {
            Ok(created) => Ok(created),
            Err(error) if has_reason(&error, "AlreadyExists") => {
                AlreadyExistsSnafu { kind, name }.fail()
            }
            Err(source) => Err(Error::Request {
                source,
                verb: "create",
                kind: kind.clone(),
                name,
            }),
        }
    }

    async fn get(
        &self,
        mapping: &ApiMapping,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject> {
        self.api(mapping, namespace)
            .get(name)
            .await
            .map_err(|source| Error::Request {
                source,
                verb: "get",
                kind: mapping.resource.kind.clone(),
                name: name.to_string(),
            })
    }

    async fn replace(
        &self,
        mapping: &ApiMapping,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let kind = &mapping.resource.kind;
        let name = object.name_any();
        match self
            .api(mapping, namespace)
            .replace(&name, &PostParams::default(), object)
            .await
        {
            Ok(replaced) => Ok(replaced),
            Err(error) if has_reason(&error, "Conflict") => ConflictSnafu { kind, name }.fail(),
            Err(source) => Err(Error::Request {
                source,
                verb: "update",
                kind: kind.clone(),
                name,
            }),
        }
    }
}
