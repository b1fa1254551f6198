use snafu::{OptionExt, Snafu};
use stackable_service_broker_crd::{
    parameter::ConfigurationParameter, ConfigurationTemplate, ResourceType,
    ServiceBrokerConfigSpec,
};

use crate::error::{Classify, ErrorClass};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display(
        "unable to locate {resource_type} template bindings for service [{service_id}], plan [{plan_id}]"
    ))]
    BindingNotFound {
        resource_type: ResourceType,
        service_id: String,
        plan_id: String,
    },

    #[snafu(display("binding [{binding}] has no {resource_type} templates"))]
    MissingResourceType {
        binding: String,
        resource_type: ResourceType,
    },

    #[snafu(display("template [{name}] is not defined"))]
    TemplateNotFound { name: String },
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }
}

/// The parameters and templates used to provision one resource type of a service plan.
#[derive(Clone, Copy, Debug)]
pub struct TemplateBinding<'a> {
    pub resource_type: ResourceType,
    pub service_id: &'a str,
    pub plan_id: &'a str,
    pub parameters: &'a [ConfigurationParameter],
    pub templates: &'a [String],
}

/// Read-only lookups into the broker configuration.
#[derive(Clone, Copy, Debug)]
pub struct TemplateIndex<'a> {
    config: &'a ServiceBrokerConfigSpec,
}

impl<'a> TemplateIndex<'a> {
    pub fn new(config: &'a ServiceBrokerConfigSpec) -> Self {
        Self { config }
    }

    pub fn lookup(
        &self,
        resource_type: ResourceType,
        service_id: &str,
        plan_id: &str,
    ) -> Result<TemplateBinding<'a>> {
        let binding = self
            .config
            .bindings
            .iter()
            .find(|binding| binding.service == service_id && binding.plan == plan_id)
            .with_context(|| BindingNotFoundSnafu {
                resource_type,
                service_id,
                plan_id,
            })?;

        let list = binding
            .templates_for(resource_type)
            .with_context(|| MissingResourceTypeSnafu {
                binding: &binding.name,
                resource_type,
            })?;

        Ok(TemplateBinding {
            resource_type,
            service_id: &binding.service,
            plan_id: &binding.plan,
            parameters: &list.parameters,
            templates: &list.templates,
        })
    }

    pub fn template(&self, name: &str) -> Result<&'a ConfigurationTemplate> {
        self.config
            .templates
            .iter()
            .find(|template| template.name == name)
            .context(TemplateNotFoundSnafu { name })
    }
}
