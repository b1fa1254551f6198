//! Provisioning engine of the service broker: turns a service/plan request into cluster
//! resources, rendered from the templates of a [`ServiceBrokerConfig`] and owned by the service
//! instance they were created for.
//!
//! [`ServiceBrokerConfig`]: stackable_service_broker_crd::ServiceBrokerConfig

pub mod creator;
pub mod error;
pub mod manifest;
pub mod materializer;
pub mod operation;
pub mod parameters;
pub mod registry;
pub mod renderer;
pub mod template_index;

#[cfg(test)]
mod test_util;
