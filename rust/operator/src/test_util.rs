//! In-memory stand-ins for the registry backing store and the cluster API.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use stackable_operator::{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    kube::{
        api::{ApiResource, DynamicObject, GroupVersionKind},
        core::ErrorResponse,
        ResourceExt,
    },
};

use crate::{
    materializer::client::{self, ApiMapping, ResourceClient},
    registry::store::{self, RegistryStore, StoredEntry},
};

#[derive(Default)]
pub struct MemoryRegistryStore {
    entries: Mutex<BTreeMap<String, StoredEntry>>,
    saves: AtomicUsize,
}

impl MemoryRegistryStore {
    pub fn entry(&self, name: &str) -> Option<StoredEntry> {
        self.entries.lock().unwrap().get(name).cloned()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn load(&self, name: &str) -> Result<Option<StoredEntry>, store::Error> {
        Ok(self.entry(name))
    }

    async fn save(&self, entry: &StoredEntry) -> Result<StoredEntry, store::Error> {
        let mut entries = self.entries.lock().unwrap();
        let current_version = entries
            .get(&entry.name)
            .and_then(|current| current.resource_version.clone());
        if current_version != entry.resource_version {
            return Err(store::Error::Conflict {
                name: entry.name.clone(),
            });
        }

        let version = current_version
            .and_then(|version| version.parse::<u64>().ok())
            .unwrap_or_default()
            + 1;
        let stored = StoredEntry {
            uid: Some(format!("uid-{}", entry.name)),
            resource_version: Some(version.to_string()),
            ..entry.clone()
        };
        entries.insert(entry.name.clone(), stored.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Call {
    Create { kind: String, name: String },
    Get { kind: String, name: String },
    Replace { kind: String, name: String },
}

impl Call {
    pub fn create(kind: &str, name: &str) -> Self {
        Call::Create {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn get(kind: &str, name: &str) -> Self {
        Call::Get {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn replace(kind: &str, name: &str) -> Self {
        Call::Replace {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

type ObjectKey = (String, String, String);

#[derive(Default)]
struct ClusterState {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    calls: Vec<Call>,
    unknown_kinds: BTreeSet<String>,
    pending_conflicts: usize,
    latency: Option<Duration>,
    last_version: u64,
}

impl ClusterState {
    fn store(&mut self, key: ObjectKey, mut object: DynamicObject) -> DynamicObject {
        self.last_version += 1;
        object.metadata.resource_version = Some(self.last_version.to_string());
        object
            .metadata
            .uid
            .get_or_insert_with(|| format!("uid-{}", key.2));
        self.objects.insert(key, object.clone());
        object
    }
}

/// A cluster that knows every kind except the ones it is told to forget. Cluster-scoped kinds
/// are not modelled apart from `Namespace`.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.state()
            .objects
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn forget_kind(&self, kind: &str) {
        self.state().unknown_kinds.insert(kind.to_string());
    }

    /// Makes the next `count` replace calls fail as if another writer had added an owner first.
    pub fn inject_conflicts(&self, count: usize) {
        self.state().pending_conflicts = count;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    /// Adds an object as if it had been created by someone else.
    pub fn seed(&self, object: Value) {
        let object: DynamicObject = serde_json::from_value(object).expect("illegal test object");
        let kind = object.types.as_ref().expect("object has a kind").kind.clone();
        let key = (kind, object.namespace().unwrap_or_default(), object.name_any());
        self.state().store(key, object);
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn key(mapping: &ApiMapping, namespace: &str, name: &str) -> ObjectKey {
        let namespace = if mapping.namespaced { namespace } else { "" };
        (
            mapping.resource.kind.clone(),
            namespace.to_string(),
            name.to_string(),
        )
    }
}

fn not_found(verb: &'static str, kind: &str, name: &str) -> client::Error {
    client::Error::Request {
        source: stackable_operator::kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{kind} {name} not found"),
            reason: "NotFound".to_string(),
            code: 404,
        }),
        verb,
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

#[async_trait]
impl ResourceClient for FakeCluster {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiMapping, client::Error> {
        self.delay().await;
        if self.state().unknown_kinds.contains(&gvk.kind) {
            return Err(client::Error::UnknownKind {
                api_version: client::api_version(gvk),
                kind: gvk.kind.clone(),
            });
        }
        Ok(ApiMapping {
            resource: ApiResource::from_gvk(gvk),
            namespaced: gvk.kind != "Namespace",
        })
    }

    async fn create(
        &self,
        mapping: &ApiMapping,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, client::Error> {
        self.delay().await;
        let kind = &mapping.resource.kind;
        let name = object.name_any();
        let mut state = self.state();
        state.calls.push(Call::create(kind, &name));

        let key = Self::key(mapping, namespace, &name);
        if state.objects.contains_key(&key) {
            return Err(client::Error::AlreadyExists {
                kind: kind.clone(),
                name,
            });
        }
        Ok(state.store(key, object.clone()))
    }

    async fn get(
        &self,
        mapping: &ApiMapping,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, client::Error> {
        self.delay().await;
        let kind = &mapping.resource.kind;
        let mut state = self.state();
        state.calls.push(Call::get(kind, name));

        state
            .objects
            .get(&Self::key(mapping, namespace, name))
            .cloned()
            .ok_or_else(|| not_found("get", kind, name))
    }

    async fn replace(
        &self,
        mapping: &ApiMapping,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, client::Error> {
        self.delay().await;
        let kind = &mapping.resource.kind;
        let name = object.name_any();
        let mut state = self.state();
        state.calls.push(Call::replace(kind, &name));

        let key = Self::key(mapping, namespace, &name);
        let Some(mut current) = state.objects.get(&key).cloned() else {
            return Err(not_found("update", kind, &name));
        };

        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            current
                .metadata
                .owner_references
                .get_or_insert_with(Vec::new)
                .push(OwnerReference {
                    api_version: "v1".to_string(),
                    kind: "Secret".to_string(),
                    name: "registry-concurrent-writer".to_string(),
                    uid: "uid-concurrent-writer".to_string(),
                    ..OwnerReference::default()
                });
            state.store(key, current);
            return Err(client::Error::Conflict {
                kind: kind.clone(),
                name,
            });
        }

        if current.metadata.resource_version != object.metadata.resource_version {
            return Err(client::Error::Conflict {
                kind: kind.clone(),
                name,
            });
        }
        let mut replaced = object.clone();
        replaced.metadata.uid = current.metadata.uid;
        Ok(state.store(key, replaced))
    }
}
