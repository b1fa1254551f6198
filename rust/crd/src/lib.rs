pub mod parameter;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
    utils::crds::raw_object_schema,
};
use strum::{Display, EnumString};

use crate::parameter::ConfigurationParameter;

pub const APP_NAME: &str = "service-broker";
pub const OPERATOR_NAME: &str = "servicebroker.stackable.tech";

#[derive(Snafu, Debug, PartialEq)]
pub enum Error {
    #[snafu(display("template [{name}] is defined more than once"))]
    DuplicateTemplate { name: String },

    #[snafu(display(
        "bindings [{first}] and [{second}] both match service [{service}], plan [{plan}]"
    ))]
    DuplicateBinding {
        first: String,
        second: String,
        service: String,
        plan: String,
    },

    #[snafu(display("binding [{binding}] references undefined template [{template}]"))]
    UndefinedTemplate { binding: String, template: String },

    #[snafu(display(
        "parameter [{parameter}] of binding [{binding}] reads [{pointer}], which is not a JSON pointer starting with /"
    ))]
    InvalidParameterPointer {
        binding: String,
        parameter: String,
        pointer: String,
    },
}

/// Static configuration of the service broker: the resource templates it may create and the
/// bindings that select them for a service/plan pair.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "servicebroker.stackable.tech",
    version = "v1alpha1",
    kind = "ServiceBrokerConfig",
    shortname = "sbc",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerConfigSpec {
    /// Named resource templates. A template without a `template` object only declares a name
    /// and creates nothing.
    #[serde(default)]
    pub templates: Vec<ConfigurationTemplate>,

    /// Bindings from a service and plan to the parameters and templates used to provision it.
    #[serde(default)]
    pub bindings: Vec<ConfigurationBinding>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationTemplate {
    pub name: String,

    /// The raw Kubernetes object. String values may contain `{{ registry "key" }}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "raw_object_schema")]
    pub template: Option<serde_json::Value>,

    /// Singleton resources are shared between service instances. When one already exists it
    /// gains an additional owner instead of failing creation.
    #[serde(default)]
    pub singleton: bool,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationBinding {
    pub name: String,

    /// Service ID as advertised in the service catalog.
    pub service: String,

    /// Plan ID as advertised in the service catalog.
    pub plan: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_instance: Option<TemplateList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_binding: Option<TemplateList>,
}

/// Ordered parameters and template names. Templates are created in the order listed here.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateList {
    #[serde(default)]
    pub parameters: Vec<ConfigurationParameter>,

    #[serde(default)]
    pub templates: Vec<String>,
}

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ResourceType {
    ServiceInstance,
    ServiceBinding,
}

impl ConfigurationBinding {
    pub fn templates_for(&self, resource_type: ResourceType) -> Option<&TemplateList> {
        match resource_type {
            ResourceType::ServiceInstance => self.service_instance.as_ref(),
            ResourceType::ServiceBinding => self.service_binding.as_ref(),
        }
    }
}

impl ServiceBrokerConfigSpec {
    /// Checks the invariants lookups rely on: unique template names, at most one binding per
    /// service/plan pair, no references to undefined templates and well-formed JSON pointers
    /// into the request parameters.
    pub fn validate(&self) -> Result<(), Error> {
        let mut names = BTreeSet::new();
        for template in &self.templates {
            if !names.insert(template.name.as_str()) {
                return DuplicateTemplateSnafu {
                    name: template.name.clone(),
                }
                .fail();
            }
        }

        for (index, binding) in self.bindings.iter().enumerate() {
            if let Some(first) = self.bindings[..index]
                .iter()
                .find(|other| other.service == binding.service && other.plan == binding.plan)
            {
                return DuplicateBindingSnafu {
                    first: first.name.clone(),
                    second: binding.name.clone(),
                    service: binding.service.clone(),
                    plan: binding.plan.clone(),
                }
                .fail();
            }

            let lists = [&binding.service_instance, &binding.service_binding];
            for template in lists.into_iter().flatten().flat_map(|list| &list.templates) {
                if !names.contains(template.as_str()) {
                    return UndefinedTemplateSnafu {
                        binding: binding.name.clone(),
                        template: template.clone(),
                    }
                    .fail();
                }
            }

            let parameters = lists.into_iter().flatten().flat_map(|list| &list.parameters);
            for parameter in parameters {
                // The empty pointer addresses the whole request document.
                if let Some(pointer) = parameter
                    .request_pointers()
                    .into_iter()
                    .find(|pointer| !pointer.is_empty() && !pointer.starts_with('/'))
                {
                    return InvalidParameterPointerSnafu {
                        binding: binding.name.clone(),
                        parameter: parameter.name.clone(),
                        pointer,
                    }
                    .fail();
                }
            }
        }

        Ok(())
    }
}
