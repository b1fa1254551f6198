//! Creates rendered manifests on the cluster, owned by the service instance they were rendered
//! for. Singleton resources that already exist gain an additional owner instead.

pub mod client;

use std::{sync::Arc, time::Duration};

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference, kube::api::DynamicObject,
};

use crate::{
    error::{Classify, ErrorClass},
    manifest::Manifest,
    registry::{self, Registry, WellKnownKey},
    renderer::RenderedTemplate,
};

pub use client::{ApiMapping, KubeResourceClient, ResourceClient};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("registry defines no namespace to create {kind} [{name}] in"))]
    MissingNamespace { kind: String, name: String },

    #[snafu(display("failed to build owner reference for {kind} [{name}]"))]
    OwnerReference {
        source: registry::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to resolve API mapping"))]
    ResolveMapping { source: client::Error },

    #[snafu(display("failed to create resource"))]
    Create { source: client::Error },

    #[snafu(display("failed to read existing singleton"))]
    GetExisting { source: client::Error },

    #[snafu(display("existing singleton {kind} [{name}] has owner references unexpectedly missing"))]
    OwnerReferencesMissing { kind: String, name: String },

    #[snafu(display("failed to add owner to singleton"))]
    UpdateOwners { source: client::Error },

    #[snafu(display(
        "singleton {kind} [{name}] was modified concurrently in each of {attempts} attempts"
    ))]
    MergeConflict {
        kind: String,
        name: String,
        attempts: u32,
    },

    #[snafu(display("materializing {kind} [{name}] did not finish within {timeout:?}"))]
    Timeout {
        source: tokio::time::error::Elapsed,
        kind: String,
        name: String,
        timeout: Duration,
    },
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::MissingNamespace { .. } | Error::OwnerReferencesMissing { .. } => {
                ErrorClass::Configuration
            }
            Error::OwnerReference { source, .. } => source.class(),
            Error::ResolveMapping { source }
            | Error::Create { source }
            | Error::GetExisting { source }
            | Error::UpdateOwners { source } => source.class(),
            Error::MergeConflict { .. } => ErrorClass::Conflict,
            Error::Timeout { .. } => ErrorClass::Transient,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MaterializerConfig {
    /// Deadline for materializing one template, including every singleton merge attempt.
    pub operation_timeout: Duration,

    /// How often a singleton merge is attempted before giving up on concurrent writers.
    pub merge_attempts: u32,

    /// Delay before the n-th retry of a singleton merge is `n * merge_backoff`.
    pub merge_backoff: Duration,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(60),
            merge_attempts: 5,
            merge_backoff: Duration::from_millis(100),
        }
    }
}

pub struct Materializer {
    client: Arc<dyn ResourceClient>,
    config: MaterializerConfig,
}

impl Materializer {
    pub fn new(client: Arc<dyn ResourceClient>, config: MaterializerConfig) -> Self {
        Self { client, config }
    }

    /// Creates the rendered manifest, or does nothing for a template without one.
    pub async fn create(&self, rendered: &RenderedTemplate, registry: &Registry) -> Result<()> {
        let Some(manifest) = &rendered.manifest else {
            tracing::debug!(template = %rendered.name, "nothing to create");
            return Ok(());
        };
        let kind = manifest.kind();
        let name = manifest.name();

        let namespace = registry
            .get(WellKnownKey::Namespace)
            .with_context(|| MissingNamespaceSnafu { kind, name: &name })?;
        let owner = registry
            .owner_reference()
            .with_context(|_| OwnerReferenceSnafu { kind, name: &name })?;

        tokio::time::timeout(
            self.config.operation_timeout,
            self.materialize(manifest, rendered.singleton, namespace, owner),
        )
        .await
        .with_context(|_| TimeoutSnafu {
            kind,
            name: &name,
            timeout: self.config.operation_timeout,
        })?
    }

    async fn materialize(
        &self,
        manifest: &Manifest,
        singleton: bool,
        namespace: &str,
        owner: OwnerReference,
    ) -> Result<()> {
        let mapping = self
            .client
            .resolve(manifest.gvk())
            .await
            .context(ResolveMappingSnafu)?;

        let mut object: DynamicObject = manifest.object().clone();
        if mapping.namespaced {
            object.metadata.namespace = Some(namespace.to_string());
        }
        object.metadata.owner_references = Some(vec![owner.clone()]);

        match self.client.create(&mapping, namespace, &object).await {
            Ok(_) => {
                tracing::info!(
                    kind = manifest.kind(),
                    name = %manifest.name(),
                    namespace,
                    "created resource"
                );
                Ok(())
            }
            Err(client::Error::AlreadyExists { .. }) if singleton => {
                self.merge_owner(&mapping, namespace, &manifest.name(), &owner)
                    .await
            }
            Err(source) => Err(source).context(CreateSnafu),
        }
    }

    /// Appends `owner` to the owner references of an existing singleton, retrying while the
    /// object is modified between read and write.
    async fn merge_owner(
        &self,
        mapping: &ApiMapping,
        namespace: &str,
        name: &str,
        owner: &OwnerReference,
    ) -> Result<()> {
        let kind = mapping.resource.kind.as_str();

        for attempt in 1..=self.config.merge_attempts {
            let mut existing = self
                .client
                .get(mapping, namespace, name)
                .await
                .context(GetExistingSnafu)?;
            let owners = existing
                .metadata
                .owner_references
                .as_mut()
                .context(OwnerReferencesMissingSnafu { kind, name })?;

            if owners.iter().any(|existing| existing.uid == owner.uid) {
                tracing::debug!(kind, name, owner = %owner.name, "singleton is already owned");
                return Ok(());
            }
            owners.push(owner.clone());

            match self.client.replace(mapping, namespace, &existing).await {
                Ok(_) => {
                    tracing::info!(kind, name, owner = %owner.name, "added owner to singleton");
                    return Ok(());
                }
                Err(client::Error::Conflict { .. }) => {
                    tracing::warn!(
                        kind,
                        name,
                        attempt,
                        attempts = self.config.merge_attempts,
                        "singleton was modified concurrently, retrying owner merge"
                    );
                    if attempt < self.config.merge_attempts {
                        tokio::time::sleep(self.config.merge_backoff * attempt).await;
                    }
                }
                Err(source) => return Err(source).context(UpdateOwnersSnafu),
            }
        }

        MergeConflictSnafu {
            kind,
            name,
            attempts: self.config.merge_attempts,
        }
        .fail()
    }
}
