use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use stackable_operator::{
    kube::CustomResourceExt, logging::TracingTarget, shared::yaml::SerializeOptions,
    utils::cluster_info::KubernetesClusterInfoOpts, YamlSchema,
};
use stackable_service_broker_crd::{ResourceType, ServiceBrokerConfig, APP_NAME, OPERATOR_NAME};
use stackable_service_broker_provisioner::{
    creator::Creator,
    materializer::{KubeResourceClient, Materializer, MaterializerConfig},
    operation::OperationCompletion,
    registry::{ProvisioningPhase, Registry, SecretRegistryStore, WellKnownKey},
};
use tokio::sync::mpsc;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print the ServiceBrokerConfig CRD
    Crd,

    /// Provision one service instance, or resume provisioning it after a restart
    Provision(ProvisionArgs),
}

#[derive(clap::Args)]
struct ProvisionArgs {
    /// Name of the ServiceBrokerConfig holding templates and bindings
    #[arg(long, env = "SERVICE_BROKER_CONFIG")]
    config: String,

    /// Namespace of the ServiceBrokerConfig, the registry and the created resources
    #[arg(long, env = "SERVICE_BROKER_NAMESPACE")]
    namespace: String,

    /// Unique identity of the service instance. Names its registry and the registry key
    /// `instance-id`
    #[arg(long)]
    instance_id: String,

    /// Service ID from the catalog, used with the plan ID to select the binding
    #[arg(long)]
    service_id: String,

    /// Plan ID from the catalog, used with the service ID to select the binding
    #[arg(long)]
    plan_id: String,

    /// Request parameters as a JSON object
    #[arg(long, default_value = "{}")]
    parameters: String,

    /// Which template list of the binding to create, `service-instance` or `service-binding`
    #[arg(long, default_value = "service-instance")]
    resource_type: ResourceType,

    /// Deadline in seconds for creating a single resource
    #[arg(long, default_value_t = 60)]
    operation_timeout: u64,

    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    tracing_target: TracingTarget,

    #[command(flatten)]
    cluster_info_opts: KubernetesClusterInfoOpts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => ServiceBrokerConfig::crd()
            .print_yaml_schema(built_info::PKG_VERSION, SerializeOptions::default())?,
        Command::Provision(args) => {
            stackable_operator::logging::initialize_logging(
                "SERVICE_BROKER_LOG",
                APP_NAME,
                args.tracing_target,
            );
            tracing::info!(
                built_info.pkg_version = built_info::PKG_VERSION,
                built_info.git_version = built_info::GIT_VERSION,
                built_info.target = built_info::TARGET,
                built_info.built_time_utc = built_info::BUILT_TIME_UTC,
                built_info.rustc_version = built_info::RUSTC_VERSION,
                "Starting {description}",
                description = built_info::PKG_DESCRIPTION
            );

            provision(args).await?;
        }
    }

    Ok(())
}

async fn provision(args: ProvisionArgs) -> anyhow::Result<()> {
    let parameters: serde_json::Value =
        serde_json::from_str(&args.parameters).context("request parameters are not valid JSON")?;
    anyhow::ensure!(
        parameters.is_object(),
        "request parameters must be a JSON object"
    );

    let client = stackable_operator::client::initialize_operator(
        Some(OPERATOR_NAME.to_string()),
        &args.cluster_info_opts,
    )
    .await?;

    let config = client
        .get::<ServiceBrokerConfig>(&args.config, &args.namespace)
        .await
        .with_context(|| format!("failed to read ServiceBrokerConfig [{}]", args.config))?;
    config.spec.validate()?;

    let store = Arc::new(SecretRegistryStore::new(&client, &args.namespace));
    let mut registry = Registry::open(store, &args.instance_id).await?;
    registry
        .set(WellKnownKey::ServiceId, args.service_id.as_str())
        .await?;
    registry
        .set(WellKnownKey::PlanId, args.plan_id.as_str())
        .await?;
    registry
        .set(WellKnownKey::Namespace, args.namespace.as_str())
        .await?;
    registry
        .set(WellKnownKey::Parameters, parameters.to_string())
        .await?;

    let materializer = Arc::new(Materializer::new(
        Arc::new(KubeResourceClient::new(&client)),
        MaterializerConfig {
            operation_timeout: Duration::from_secs(args.operation_timeout),
            ..MaterializerConfig::default()
        },
    ));
    let (tracker, mut completions) = mpsc::unbounded_channel::<OperationCompletion>();
    let mut creator = Creator::new(
        args.resource_type,
        Arc::new(config.spec),
        registry,
        materializer,
        Arc::new(tracker),
    );

    if creator.phase() == ProvisioningPhase::Prepared {
        tracing::info!(
            instance_id = %args.instance_id,
            "instance is already prepared, resuming"
        );
    } else {
        creator.prepare().await?;
    }
    tokio::spawn(creator.run()).await?;

    let completion = completions
        .recv()
        .await
        .context("provisioning finished without reporting completion")?;
    match completion.result {
        Ok(()) => {
            tracing::info!(instance_id = %completion.instance_id, "instance provisioned");
            Ok(())
        }
        Err(failure) => anyhow::bail!(
            "provisioning instance [{}] failed ({}, {}): {}",
            completion.instance_id,
            failure.class,
            failure.category,
            failure.message
        ),
    }
}
