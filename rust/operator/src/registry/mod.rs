//! Per service instance key/value state, persisted after every change so that the synchronous
//! and asynchronous provisioning phases survive a restart in between.
//!
//! Well-known keys are supplied by the broker front end and are write-once. User keys are the
//! destinations of parameters and may be overwritten, but are never deleted.

pub mod store;

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use strum::{AsRefStr, Display, EnumString};

use crate::error::{Classify, ErrorClass};

pub use store::{RegistryStore, SecretRegistryStore, StoredEntry};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display(
        "registry key [{key}] is already bound to [{existing}], refusing to set [{requested}]"
    ))]
    AlreadyBound {
        key: WellKnownKey,
        existing: String,
        requested: String,
    },

    #[snafu(display("failed to load registry entry [{name}]"))]
    Load { source: store::Error, name: String },

    #[snafu(display("failed to persist registry entry [{name}]"))]
    Persist { source: store::Error, name: String },

    #[snafu(display("registry entry [{name}] has not been persisted and has no uid"))]
    NotPersisted { name: String },

    #[snafu(display("registry entry [{name}] cannot move from phase {from} to {to}"))]
    InvalidTransition {
        name: String,
        from: ProvisioningPhase,
        to: ProvisioningPhase,
    },

    #[snafu(display("request parameters stored in the registry are not valid JSON"))]
    MalformedParameters { source: serde_json::Error },
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::AlreadyBound { .. } => ErrorClass::AlreadyBound,
            Error::Load { source, .. } | Error::Persist { source, .. } => source.class(),
            Error::NotPersisted { .. }
            | Error::InvalidTransition { .. }
            | Error::MalformedParameters { .. } => ErrorClass::Configuration,
        }
    }
}

#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum WellKnownKey {
    ServiceId,
    PlanId,
    Namespace,
    InstanceId,
    /// The request parameters of the catalog request, as JSON.
    Parameters,
}

/// Progress of one provisioning lifecycle.
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, PartialEq, Serialize)]
pub enum ProvisioningPhase {
    #[default]
    Pending,
    Prepared,
    Executing,
    Completed,
    Failed,
}

impl ProvisioningPhase {
    pub fn can_transition_to(self, next: ProvisioningPhase) -> bool {
        use ProvisioningPhase::*;

        match (self, next) {
            // An interrupted execution is left for inspection rather than silently re-run.
            (Executing, Prepared) => false,
            (_, Prepared) => true,
            (Prepared, Executing) => true,
            (Prepared | Executing, Failed) => true,
            (Executing, Completed) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryData {
    #[serde(default)]
    pub well_known: BTreeMap<WellKnownKey, String>,

    #[serde(default)]
    pub user: BTreeMap<String, String>,

    #[serde(default)]
    pub phase: ProvisioningPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub fn registry_name(instance_id: &str) -> String {
    format!("registry-{instance_id}")
}

pub struct Registry {
    store: Arc<dyn RegistryStore>,
    entry: StoredEntry,
}

impl Registry {
    /// Loads the entry for `instance_id`, creating it if this is the first request for the
    /// instance. The instance identity is bound as a well-known key.
    pub async fn open(store: Arc<dyn RegistryStore>, instance_id: &str) -> Result<Self> {
        let name = registry_name(instance_id);
        let entry = match store.load(&name).await.context(LoadSnafu { name: &name })? {
            Some(entry) => entry,
            None => {
                tracing::info!(registry = %name, "creating registry entry");
                store
                    .save(&StoredEntry::new(&name))
                    .await
                    .context(PersistSnafu { name: &name })?
            }
        };

        let mut registry = Self { store, entry };
        registry.set(WellKnownKey::InstanceId, instance_id).await?;
        Ok(registry)
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn get(&self, key: WellKnownKey) -> Option<&str> {
        self.entry.data.well_known.get(&key).map(String::as_str)
    }

    pub fn get_user(&self, key: &str) -> Option<&str> {
        self.entry.data.user.get(key).map(String::as_str)
    }

    /// Resolves a key by name. User keys shadow well-known keys of the same name.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.get_user(name).or_else(|| {
            name.parse::<WellKnownKey>()
                .ok()
                .and_then(|key| self.get(key))
        })
    }

    /// Binds a well-known key. Setting the value it already has is a no-op.
    pub async fn set(&mut self, key: WellKnownKey, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        match self.get(key) {
            Some(existing) if existing == value => return Ok(()),
            Some(existing) => {
                return AlreadyBoundSnafu {
                    key,
                    existing,
                    requested: value,
                }
                .fail()
            }
            None => {}
        }

        let mut data = self.entry.data.clone();
        data.well_known.insert(key, value);
        self.persist(data).await
    }

    pub async fn set_user(&mut self, key: &str, value: &str) -> Result<()> {
        self.set_user_all([(key, value)]).await
    }

    /// Sets several user keys with a single write: either all of them are persisted or none is.
    pub async fn set_user_all<'a>(
        &mut self,
        values: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<()> {
        let mut data = self.entry.data.clone();
        for (key, value) in values {
            data.user.insert(key.to_string(), value.to_string());
        }

        if data == self.entry.data {
            return Ok(());
        }
        self.persist(data).await
    }

    /// The request parameters supplied by the caller, or an empty object if there were none.
    pub fn request_parameters(&self) -> Result<serde_json::Value> {
        match self.get(WellKnownKey::Parameters) {
            Some(parameters) => serde_json::from_str(parameters).context(MalformedParametersSnafu),
            None => Ok(serde_json::Value::Object(serde_json::Map::new())),
        }
    }

    pub fn phase(&self) -> ProvisioningPhase {
        self.entry.data.phase
    }

    pub fn last_error(&self) -> Option<&str> {
        self.entry.data.last_error.as_deref()
    }

    pub async fn transition(&mut self, next: ProvisioningPhase) -> Result<()> {
        self.transition_with(next, None).await
    }

    /// Moves to [`ProvisioningPhase::Failed`], recording why.
    pub async fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition_with(ProvisioningPhase::Failed, Some(message.into()))
            .await
    }

    async fn transition_with(
        &mut self,
        next: ProvisioningPhase,
        last_error: Option<String>,
    ) -> Result<()> {
        let from = self.phase();
        ensure!(
            from.can_transition_to(next),
            InvalidTransitionSnafu {
                name: self.name(),
                from,
                to: next,
            }
        );

        tracing::debug!(registry = self.name(), %from, to = %next, "changing provisioning phase");
        let mut data = self.entry.data.clone();
        data.phase = next;
        data.last_error = last_error;
        self.persist(data).await
    }

    /// The reference every created resource carries back to this instance. It points at the
    /// backing object, so deleting the entry on deprovision garbage-collects the resources.
    pub fn owner_reference(&self) -> Result<OwnerReference> {
        let uid = self
            .entry
            .uid
            .clone()
            .with_context(|| NotPersistedSnafu { name: self.name() })?;

        Ok(OwnerReference {
            api_version: "v1".to_string(),
            kind: "Secret".to_string(),
            name: self.entry.name.clone(),
            uid,
            // Singleton resources have several owners, and only one of them may be the controller.
            controller: None,
            block_owner_deletion: Some(true),
        })
    }

    async fn persist(&mut self, data: RegistryData) -> Result<()> {
        let candidate = StoredEntry {
            data,
            ..self.entry.clone()
        };
        self.entry = self
            .store
            .save(&candidate)
            .await
            .context(PersistSnafu { name: self.name() })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::test_util::MemoryRegistryStore;

    async fn open(store: &Arc<MemoryRegistryStore>) -> Registry {
        Registry::open(store.clone(), "instance-a")
            .await
            .expect("registry opens")
    }

    #[tokio::test]
    async fn test_open_binds_instance_identity() {
        let store = Arc::new(MemoryRegistryStore::default());
        let registry = open(&store).await;

        assert_eq!(registry.name(), "registry-instance-a");
        assert_eq!(registry.get(WellKnownKey::InstanceId), Some("instance-a"));
        assert_eq!(registry.phase(), ProvisioningPhase::Pending);
        assert_eq!(
            store.entry("registry-instance-a").map(|entry| entry.data),
            Some(registry.entry.data.clone())
        );
    }

    #[tokio::test]
    async fn test_well_known_keys_are_write_once() {
        let store = Arc::new(MemoryRegistryStore::default());
        let mut registry = open(&store).await;

        registry
            .set(WellKnownKey::Namespace, "default")
            .await
            .expect("first write succeeds");
        registry
            .set(WellKnownKey::Namespace, "default")
            .await
            .expect("writing the same value again is idempotent");

        let error = registry
            .set(WellKnownKey::Namespace, "other")
            .await
            .expect_err("rebinding must fail");
        assert!(matches!(
            &error,
            Error::AlreadyBound { key: WellKnownKey::Namespace, existing, requested }
                if existing == "default" && requested == "other"
        ));
        assert_eq!(error.class(), ErrorClass::AlreadyBound);
        assert_eq!(registry.get(WellKnownKey::Namespace), Some("default"));
    }

    #[tokio::test]
    async fn test_user_keys_may_be_overwritten() {
        let store = Arc::new(MemoryRegistryStore::default());
        let mut registry = open(&store).await;

        registry.set_user("user.name", "alice").await.unwrap();
        registry.set_user("user.name", "bob").await.unwrap();

        assert_eq!(registry.get_user("user.name"), Some("bob"));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let store = Arc::new(MemoryRegistryStore::default());
        let mut registry = open(&store).await;
        registry.set(WellKnownKey::ServiceId, "svc1").await.unwrap();
        registry
            .set_user_all([("password", "secret"), ("admin-password", "secret")])
            .await
            .unwrap();
        registry.transition(ProvisioningPhase::Prepared).await.unwrap();
        let uid = registry.owner_reference().unwrap().uid;

        let reopened = open(&store).await;
        assert_eq!(reopened.get(WellKnownKey::ServiceId), Some("svc1"));
        assert_eq!(reopened.get_user("password"), Some("secret"));
        assert_eq!(reopened.get_user("admin-password"), Some("secret"));
        assert_eq!(reopened.phase(), ProvisioningPhase::Prepared);
        assert_eq!(reopened.owner_reference().unwrap().uid, uid);
    }

    #[tokio::test]
    async fn test_unchanged_writes_are_not_persisted() {
        let store = Arc::new(MemoryRegistryStore::default());
        let mut registry = open(&store).await;
        registry.set_user("user.name", "alice").await.unwrap();
        let saves = store.saves();

        registry.set_user("user.name", "alice").await.unwrap();
        registry
            .set(WellKnownKey::InstanceId, "instance-a")
            .await
            .unwrap();

        assert_eq!(store.saves(), saves);
    }

    #[tokio::test]
    async fn test_lookup_prefers_user_keys() {
        let store = Arc::new(MemoryRegistryStore::default());
        let mut registry = open(&store).await;
        registry.set(WellKnownKey::PlanId, "plan1").await.unwrap();

        assert_eq!(registry.lookup("plan-id"), Some("plan1"));
        assert_eq!(registry.lookup("instance-id"), Some("instance-a"));
        assert_eq!(registry.lookup("unknown"), None);

        registry.set_user("plan-id", "shadowed").await.unwrap();
        assert_eq!(registry.lookup("plan-id"), Some("shadowed"));
    }

    #[tokio::test]
    async fn test_request_parameters() {
        let store = Arc::new(MemoryRegistryStore::default());
        let mut registry = open(&store).await;
        assert_eq!(
            registry.request_parameters().unwrap(),
            serde_json::json!({})
        );

        registry
            .set(WellKnownKey::Parameters, r#"{"username":"alice"}"#)
            .await
            .unwrap();
        assert_eq!(
            registry.request_parameters().unwrap(),
            serde_json::json!({"username": "alice"})
        );
    }

    #[tokio::test]
    async fn test_owner_reference_points_at_backing_object() {
        let store = Arc::new(MemoryRegistryStore::default());
        let registry = open(&store).await;

        let owner = registry.owner_reference().unwrap();
        assert_eq!(owner.api_version, "v1");
        assert_eq!(owner.kind, "Secret");
        assert_eq!(owner.name, "registry-instance-a");
        assert_eq!(owner.uid, "uid-registry-instance-a");
        assert_eq!(owner.controller, None);
        assert_eq!(owner.block_owner_deletion, Some(true));
    }

    #[tokio::test]
    async fn test_fail_records_error() {
        let store = Arc::new(MemoryRegistryStore::default());
        let mut registry = open(&store).await;
        registry.transition(ProvisioningPhase::Prepared).await.unwrap();
        registry.transition(ProvisioningPhase::Executing).await.unwrap();
        registry.fail("boom").await.unwrap();

        assert_eq!(registry.phase(), ProvisioningPhase::Failed);
        assert_eq!(registry.last_error(), Some("boom"));

        registry.transition(ProvisioningPhase::Prepared).await.unwrap();
        assert_eq!(registry.last_error(), None);
    }

    #[rstest]
    #[case(ProvisioningPhase::Pending, ProvisioningPhase::Prepared, true)]
    #[case(ProvisioningPhase::Pending, ProvisioningPhase::Executing, false)]
    #[case(ProvisioningPhase::Pending, ProvisioningPhase::Completed, false)]
    #[case(ProvisioningPhase::Prepared, ProvisioningPhase::Prepared, true)]
    #[case(ProvisioningPhase::Prepared, ProvisioningPhase::Executing, true)]
    #[case(ProvisioningPhase::Prepared, ProvisioningPhase::Failed, true)]
    #[case(ProvisioningPhase::Executing, ProvisioningPhase::Prepared, false)]
    #[case(ProvisioningPhase::Executing, ProvisioningPhase::Completed, true)]
    #[case(ProvisioningPhase::Executing, ProvisioningPhase::Failed, true)]
    #[case(ProvisioningPhase::Completed, ProvisioningPhase::Prepared, true)]
    #[case(ProvisioningPhase::Completed, ProvisioningPhase::Executing, false)]
    #[case(ProvisioningPhase::Failed, ProvisioningPhase::Prepared, true)]
    #[case(ProvisioningPhase::Failed, ProvisioningPhase::Completed, false)]
    fn test_phase_transitions(
        #[case] from: ProvisioningPhase,
        #[case] to: ProvisioningPhase,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }
}
