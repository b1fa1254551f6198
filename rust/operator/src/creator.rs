//! Drives one provisioning lifecycle in two phases.
//!
//! [`Creator::prepare`] runs inline with the broker request: it resolves the binding, stores
//! every parameter in the registry and renders the templates, without touching the cluster.
//! [`Creator::run`] runs detached afterwards: it creates the rendered resources in declaration
//! order and reports the outcome to the [`OperationTracker`].
//!
//! A failed execution is not rolled back. Everything created so far is owned by the registry
//! entry and is garbage collected when the instance is deprovisioned.

use std::sync::Arc;

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_service_broker_crd::{ResourceType, ServiceBrokerConfigSpec};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    error::{Classify, ErrorClass},
    materializer::{self, Materializer},
    operation::{OperationCompletion, OperationFailure, OperationTracker},
    parameters,
    registry::{self, ProvisioningPhase, Registry, WellKnownKey},
    renderer::{self, RenderedTemplate},
    template_index::{self, TemplateBinding, TemplateIndex},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("registry has no {key} set"))]
    MissingRegistryKey { key: WellKnownKey },

    #[snafu(display("cannot {operation} while provisioning is {phase}"))]
    InvalidPhase {
        operation: &'static str,
        phase: ProvisioningPhase,
    },

    #[snafu(display("failed to read request parameters"))]
    RequestParameters { source: registry::Error },

    #[snafu(display("failed to look up template binding"))]
    LookupBinding { source: template_index::Error },

    #[snafu(display("failed to resolve parameter"))]
    ResolveParameter { source: parameters::Error },

    #[snafu(display("failed to render template"))]
    RenderTemplate { source: renderer::Error },

    #[snafu(display("failed to create resource for template [{template}]"))]
    CreateResource {
        source: materializer::Error,
        template: String,
    },

    #[snafu(display("failed to update provisioning phase"))]
    UpdatePhase { source: registry::Error },
}

impl Error {
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::MissingRegistryKey { .. } | Error::InvalidPhase { .. } => {
                ErrorClass::Configuration
            }
            Error::RequestParameters { source } | Error::UpdatePhase { source } => source.class(),
            Error::LookupBinding { source } => source.class(),
            Error::ResolveParameter { source } => source.class(),
            Error::RenderTemplate { source } => source.class(),
            Error::CreateResource { source, .. } => source.class(),
        }
    }
}

pub struct Creator {
    resource_type: ResourceType,
    config: Arc<ServiceBrokerConfigSpec>,
    registry: Registry,
    materializer: Arc<Materializer>,
    tracker: Arc<dyn OperationTracker>,
    templates: Option<Vec<RenderedTemplate>>,
}

impl Creator {
    pub fn new(
        resource_type: ResourceType,
        config: Arc<ServiceBrokerConfigSpec>,
        registry: Registry,
        materializer: Arc<Materializer>,
        tracker: Arc<dyn OperationTracker>,
    ) -> Self {
        Self {
            resource_type,
            config,
            registry,
            materializer,
            tracker,
            templates: None,
        }
    }

    pub fn phase(&self) -> ProvisioningPhase {
        self.registry.phase()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The templates rendered by [`Creator::prepare`], until they are consumed by execution.
    pub fn templates(&self) -> Option<&[RenderedTemplate]> {
        self.templates.as_deref()
    }

    /// Stores the parameters of the binding and renders its templates. Performs no cluster
    /// writes, so it may be retried.
    pub async fn prepare(&mut self) -> Result<()> {
        let phase = self.phase();
        ensure!(
            phase.can_transition_to(ProvisioningPhase::Prepared),
            InvalidPhaseSnafu {
                operation: "prepare",
                phase
            }
        );

        let config = self.config.clone();
        let index = TemplateIndex::new(&config);
        let binding = self.binding(&index)?;

        let input = self
            .registry
            .request_parameters()
            .context(RequestParametersSnafu)?;
        for parameter in binding.parameters {
            parameters::apply_parameter(parameter, &input, &mut self.registry)
                .await
                .context(ResolveParameterSnafu)?;
        }

        let templates = self.render(&index, &binding)?;
        self.registry
            .transition(ProvisioningPhase::Prepared)
            .await
            .context(UpdatePhaseSnafu)?;
        tracing::info!(
            registry = self.registry.name(),
            resource_type = %self.resource_type,
            templates = templates.len(),
            "prepared provisioning"
        );
        self.templates = Some(templates);
        Ok(())
    }

    /// Creates the prepared resources in declaration order, stopping at the first failure.
    ///
    /// If the templates rendered during preparation are gone because the process restarted
    /// in between, they are rendered again from the registry.
    pub async fn execute(&mut self) -> Result<()> {
        let phase = self.phase();
        ensure!(
            phase == ProvisioningPhase::Prepared,
            InvalidPhaseSnafu {
                operation: "execute",
                phase
            }
        );

        let templates = match self.templates.take() {
            Some(templates) => templates,
            None => {
                tracing::info!(
                    registry = self.registry.name(),
                    "rendering templates again to resume provisioning"
                );
                let config = self.config.clone();
                let index = TemplateIndex::new(&config);
                let binding = self.binding(&index)?;
                self.render(&index, &binding)?
            }
        };

        self.registry
            .transition(ProvisioningPhase::Executing)
            .await
            .context(UpdatePhaseSnafu)?;
        for rendered in &templates {
            self.materializer
                .create(rendered, &self.registry)
                .await
                .context(CreateResourceSnafu {
                    template: &rendered.name,
                })?;
        }

        self.registry
            .transition(ProvisioningPhase::Completed)
            .await
            .context(UpdatePhaseSnafu)
    }

    /// Executes, records the outcome in the registry and reports it to the tracker.
    pub async fn run(mut self) {
        let result = self.execute().await;
        let instance_id = self
            .registry
            .get(WellKnownKey::InstanceId)
            .unwrap_or_default()
            .to_string();

        let result = match result {
            Ok(()) => {
                tracing::info!(instance_id = %instance_id, "provisioning completed");
                Ok(())
            }
            Err(error) => {
                let class = error.class();
                let category = error.category();
                // A phase rejection means another execution owns the registry entry.
                let owns_entry = !matches!(error, Error::InvalidPhase { .. });
                let message = snafu::Report::from_error(error).to_string();
                tracing::warn!(
                    instance_id = %instance_id,
                    %class,
                    category,
                    message = %message,
                    "provisioning failed"
                );

                if owns_entry {
                    if let Err(error) = self.registry.fail(message.as_str()).await {
                        tracing::warn!(
                            instance_id = %instance_id,
                            error = %snafu::Report::from_error(error),
                            "failed to record provisioning failure"
                        );
                    }
                }
                Err(OperationFailure {
                    class,
                    category,
                    message,
                })
            }
        };

        self.tracker
            .complete(OperationCompletion {
                instance_id,
                result,
            })
            .await;
    }

    fn binding<'a>(&self, index: &TemplateIndex<'a>) -> Result<TemplateBinding<'a>> {
        let service_id = self.required_key(WellKnownKey::ServiceId)?;
        let plan_id = self.required_key(WellKnownKey::PlanId)?;
        index
            .lookup(self.resource_type, service_id, plan_id)
            .context(LookupBindingSnafu)
    }

    fn render(
        &self,
        index: &TemplateIndex<'_>,
        binding: &TemplateBinding<'_>,
    ) -> Result<Vec<RenderedTemplate>> {
        binding
            .templates
            .iter()
            .map(|name| {
                renderer::render_template(index, name, &self.registry).context(RenderTemplateSnafu)
            })
            .collect()
    }

    fn required_key(&self, key: WellKnownKey) -> Result<&str> {
        self.registry
            .get(key)
            .context(MissingRegistryKeySnafu { key })
    }
}
