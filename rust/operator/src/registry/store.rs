//! Durable backing objects for registry entries.

use std::collections::BTreeMap;

use async_trait::async_trait;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    client::Client,
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::{api::PostParams, Api},
};

use crate::{
    error::{Classify, ErrorClass},
    registry::RegistryData,
};

/// Secret data key holding the serialized entry.
pub const REGISTRY_DATA_KEY: &str = "registry";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to get registry Secret [{name}]"))]
    GetSecret {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("failed to create registry Secret [{name}]"))]
    CreateSecret {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("failed to update registry Secret [{name}]"))]
    ReplaceSecret {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("registry entry [{name}] was modified concurrently"))]
    Conflict { name: String },

    #[snafu(display("registry Secret [{name}] has no registry data"))]
    MissingEntryData { name: String },

    #[snafu(display("failed to decode registry entry [{name}]"))]
    DecodeEntry {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("failed to encode registry entry [{name}]"))]
    EncodeEntry {
        source: serde_json::Error,
        name: String,
    },
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::GetSecret { .. }
            | Error::CreateSecret { .. }
            | Error::ReplaceSecret { .. }
            | Error::Conflict { .. } => ErrorClass::Transient,
            Error::MissingEntryData { .. }
            | Error::DecodeEntry { .. }
            | Error::EncodeEntry { .. } => ErrorClass::Configuration,
        }
    }
}

/// A registry entry as persisted, together with the identity and version of its backing object.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredEntry {
    pub name: String,

    /// Assigned by the store on first save.
    pub uid: Option<String>,

    /// Version token of the backing object, `None` until first saved. Saves are conditioned on it.
    pub resource_version: Option<String>,

    pub data: RegistryData,
}

impl StoredEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: None,
            resource_version: None,
            data: RegistryData::default(),
        }
    }
}

#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<StoredEntry>>;

    /// Creates the entry when it has no version yet, otherwise replaces it if it is unchanged
    /// since it was read. Returns the entry as stored.
    async fn save(&self, entry: &StoredEntry) -> Result<StoredEntry>;
}

/// Keeps each registry entry in a `Secret`, which is also the owner of every resource created
/// for the service instance.
pub struct SecretRegistryStore {
    client: stackable_operator::kube::Client,
    namespace: String,
}

impl SecretRegistryStore {
    pub fn new(client: &Client, namespace: impl Into<String>) -> Self {
        Self {
            client: client.as_kube_client(),
            namespace: namespace.into(),
        }
    }

    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Builds the Secret backing `entry`. The entry's version is carried over so that replacing the
/// Secret fails if it changed since it was read.
fn to_secret(namespace: &str, entry: &StoredEntry) -> Result<Secret> {
    let payload = serde_json::to_vec(&entry.data).with_context(|_| EncodeEntrySnafu {
        name: entry.name.clone(),
    })?;

    let mut metadata = ObjectMetaBuilder::new()
        .name(entry.name.clone())
        .namespace(namespace)
        .build();
    metadata.resource_version = entry.resource_version.clone();

    Ok(Secret {
        metadata,
        data: Some(BTreeMap::from([(
            REGISTRY_DATA_KEY.to_string(),
            ByteString(payload),
        )])),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    })
}

fn from_secret(name: &str, secret: Secret) -> Result<StoredEntry> {
    let payload = secret
        .data
        .as_ref()
        .and_then(|data| data.get(REGISTRY_DATA_KEY))
        .with_context(|| MissingEntryDataSnafu { name })?;
    let data = serde_json::from_slice(&payload.0).context(DecodeEntrySnafu { name })?;

    Ok(StoredEntry {
        name: name.to_string(),
        uid: secret.metadata.uid,
        resource_version: secret.metadata.resource_version,
        data,
    })
}

fn is_conflict(error: &stackable_operator::kube::Error) -> bool {
    matches!(error, stackable_operator::kube::Error::Api(response) if response.code == 409)
}

#[async_trait]
impl RegistryStore for SecretRegistryStore {
    async fn load(&self, name: &str) -> Result<Option<StoredEntry>> {
        self.api()
            .get_opt(name)
            .await
            .context(GetSecretSnafu { name })?
            .map(|secret| from_secret(name, secret))
            .transpose()
    }

    async fn save(&self, entry: &StoredEntry) -> Result<StoredEntry> {
        let secret = to_secret(&self.namespace, entry)?;
        let name = entry.name.as_str();

        let stored = match entry.resource_version {
            None => self
                .api()
                .create(&PostParams::default(), &secret)
                .await
                .context(CreateSecretSnafu { name })?,
            Some(_) => match self.api().replace(name, &PostParams::default(), &secret).await {
                Ok(stored) => stored,
                Err(error) if is_conflict(&error) => return ConflictSnafu { name }.fail(),
                Err(error) => return Err(error).context(ReplaceSecretSnafu { name }),
            },
        };

        tracing::debug!(
            registry = %name,
            resource_version = stored.metadata.resource_version.as_deref(),
            "persisted registry entry"
        );
        from_secret(name, stored)
    }
}

#[cfg(test)]
mod tests {
    use stackable_operator::kube::core::ErrorResponse;

    use super::*;
    use crate::registry::{ProvisioningPhase, WellKnownKey};

    fn entry() -> StoredEntry {
        let mut entry = StoredEntry::new("registry-instance-a");
        entry.resource_version = Some("7".to_string());
        entry
            .data
            .well_known
            .insert(WellKnownKey::InstanceId, "instance-a".to_string());
        entry
            .data
            .user
            .insert("user.name".to_string(), "alice".to_string());
        entry.data.phase = ProvisioningPhase::Prepared;
        entry
    }

    #[test]
    fn test_secret_carries_entry_and_version() {
        let entry = entry();
        let mut secret = to_secret("default", &entry).unwrap();

        assert_eq!(secret.metadata.name.as_deref(), Some("registry-instance-a"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(secret.metadata.resource_version.as_deref(), Some("7"));
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        assert_eq!(
            secret.data.as_ref().map(|data| data.keys().collect::<Vec<_>>()),
            Some(vec![&REGISTRY_DATA_KEY.to_string()])
        );

        secret.metadata.uid = Some("uid-1".to_string());
        let decoded = from_secret("registry-instance-a", secret).unwrap();
        assert_eq!(
            decoded,
            StoredEntry {
                uid: Some("uid-1".to_string()),
                ..entry
            }
        );
    }

    #[test]
    fn test_new_entry_has_no_version() {
        let secret = to_secret("default", &StoredEntry::new("registry-instance-a")).unwrap();
        assert_eq!(secret.metadata.resource_version, None);
    }

    #[test]
    fn test_secret_without_entry_data() {
        let secret = Secret {
            metadata: ObjectMetaBuilder::new().name("registry-instance-a").build(),
            ..Secret::default()
        };

        let error = from_secret("registry-instance-a", secret).unwrap_err();
        assert!(matches!(&error, Error::MissingEntryData { name } if name == "registry-instance-a"));
        assert_eq!(error.class(), ErrorClass::Configuration);
    }

    #[test]
    fn test_secret_with_malformed_entry_data() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                REGISTRY_DATA_KEY.to_string(),
                ByteString(b"not json".to_vec()),
            )])),
            ..Secret::default()
        };

        assert!(matches!(
            from_secret("registry-instance-a", secret),
            Err(Error::DecodeEntry { .. })
        ));
    }

    #[test]
    fn test_is_conflict() {
        let response = |code: u16, reason: &str| {
            stackable_operator::kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: String::new(),
                reason: reason.to_string(),
                code,
            })
        };

        assert!(is_conflict(&response(409, "Conflict")));
        assert!(!is_conflict(&response(404, "NotFound")));
    }
}
