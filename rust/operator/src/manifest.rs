//! Schema-less resource documents, so that any kind can be created from configuration.

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::kube::{
    api::{DynamicObject, GroupVersionKind},
    ResourceExt,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("manifest is not a Kubernetes object"))]
    Parse { source: serde_json::Error },

    #[snafu(display("manifest defines no apiVersion or kind"))]
    MissingTypeMeta,

    #[snafu(display("manifest defines no name"))]
    MissingName,
}

/// A concrete resource manifest of an arbitrary kind.
#[derive(Clone, Debug)]
pub struct Manifest {
    gvk: GroupVersionKind,
    object: DynamicObject,
}

impl Manifest {
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let object: DynamicObject = serde_json::from_value(value).context(ParseSnafu)?;

        let types = object.types.as_ref().context(MissingTypeMetaSnafu)?;
        ensure!(
            !types.api_version.is_empty() && !types.kind.is_empty(),
            MissingTypeMetaSnafu
        );
        ensure!(
            object.metadata.name.as_deref().is_some_and(|name| !name.is_empty()),
            MissingNameSnafu
        );

        let (group, version) = match types.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", types.api_version.as_str()),
        };
        let gvk = GroupVersionKind::gvk(group, version, &types.kind);

        Ok(Self { gvk, object })
    }

    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    pub fn kind(&self) -> &str {
        &self.gvk.kind
    }

    pub fn name(&self) -> String {
        self.object.name_any()
    }

    /// Looks up a nested field below the top level of the object, e.g. `["spec", "replicas"]`.
    /// `metadata` is not reachable this way, see [`Manifest::object`].
    pub fn field(&self, path: &[&str]) -> Option<&serde_json::Value> {
        path.iter()
            .try_fold(&self.object.data, |value, key| value.get(*key))
    }

    pub fn object(&self) -> &DynamicObject {
        &self.object
    }
}
