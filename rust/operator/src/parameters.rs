//! Resolves parameter declarations against the request parameters and the registry, and routes
//! the results to their registry destinations.

use rand::{distributions::Alphanumeric, seq::SliceRandom, Rng};
use serde_json::Value;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_service_broker_crd::parameter::{
    ConfigurationParameter, ConfigurationParameterSource, FormatArgument, FormatSource,
    GeneratePasswordSource, ParameterType,
};

use crate::{
    error::{Classify, ErrorClass},
    registry::{self, Registry},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("parameter [{name}] must have at least one destination"))]
    NoDestinations { name: String },

    #[snafu(display("parameter [{name}] must have a registry destination"))]
    MissingRegistryDestination { name: String },

    #[snafu(display("unable to populate required parameter [{name}]"))]
    RequiredParameterMissing { name: String },

    #[snafu(display("parameter [{name}] is not a {expected:?}: {value}"))]
    TypeMismatch {
        name: String,
        expected: ParameterType,
        value: Value,
    },

    #[snafu(display(
        "parameter [{name}] format string has {placeholders} placeholders but {arguments} arguments"
    ))]
    FormatArity {
        name: String,
        placeholders: usize,
        arguments: usize,
    },

    #[snafu(display("parameter [{name}] cannot generate a password from an empty dictionary"))]
    EmptyDictionary { name: String },

    #[snafu(display("failed to store parameter [{name}]"))]
    StoreParameter {
        source: registry::Error,
        name: String,
    },
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::StoreParameter { source, .. } => source.class(),
            _ => ErrorClass::Configuration,
        }
    }
}

fn destinations(parameter: &ConfigurationParameter) -> Result<Vec<&str>> {
    ensure!(
        !parameter.destinations.is_empty(),
        NoDestinationsSnafu {
            name: &parameter.name
        }
    );

    parameter
        .destinations
        .iter()
        .map(|destination| {
            destination
                .registry
                .as_deref()
                .with_context(|| MissingRegistryDestinationSnafu {
                    name: &parameter.name,
                })
        })
        .collect()
}

/// Evaluates a parameter, falling back to its default. Returns `None` when no value is available
/// and `required` is not set.
pub fn resolve_parameter(
    parameter: &ConfigurationParameter,
    input: &Value,
    registry: &Registry,
    required: bool,
) -> Result<Option<String>> {
    let name = parameter.name.as_str();
    destinations(parameter)?;

    let value = match &parameter.source {
        Some(source) => resolve_source(name, source, input, registry)?,
        None => None,
    };
    let Some(value) = value.or_else(|| parameter.default.clone().map(Value::String)) else {
        ensure!(!required, RequiredParameterMissingSnafu { name });
        return Ok(None);
    };

    match (parameter.type_, value) {
        (ParameterType::String, Value::String(value)) => Ok(Some(value)),
        (expected, value) => TypeMismatchSnafu {
            name,
            expected,
            value,
        }
        .fail(),
    }
}

/// Resolves a parameter and writes the value to every destination in a single registry write.
pub async fn apply_parameter(
    parameter: &ConfigurationParameter,
    input: &Value,
    registry: &mut Registry,
) -> Result<Option<String>> {
    let destinations = destinations(parameter)?;
    let value = resolve_parameter(parameter, input, registry, parameter.required)?;

    match &value {
        Some(value) => {
            tracing::debug!(
                parameter = %parameter.name,
                ?destinations,
                "storing parameter"
            );
            registry
                .set_user_all(destinations.iter().map(|key| (*key, value.as_str())))
                .await
                .context(StoreParameterSnafu {
                    name: &parameter.name,
                })?;
        }
        None => tracing::debug!(parameter = %parameter.name, "parameter has no value, skipping"),
    }

    Ok(value)
}

fn resolve_source(
    name: &str,
    source: &ConfigurationParameterSource,
    input: &Value,
    registry: &Registry,
) -> Result<Option<Value>> {
    Ok(match source {
        ConfigurationParameterSource::Parameter(pointer) => request_parameter(input, pointer),
        ConfigurationParameterSource::Registry(key) => registry_value(registry, key),
        ConfigurationParameterSource::Literal(literal) => Some(Value::String(literal.clone())),
        ConfigurationParameterSource::Format(format) => {
            format_string(name, format, input, registry)?.map(Value::String)
        }
        ConfigurationParameterSource::GeneratePassword(generate) => {
            Some(Value::String(generate_password(name, generate)?))
        }
    })
}

fn request_parameter(input: &Value, pointer: &str) -> Option<Value> {
    input.pointer(pointer).filter(|value| !value.is_null()).cloned()
}

fn registry_value(registry: &Registry, key: &str) -> Option<Value> {
    registry.lookup(key).map(|value| Value::String(value.to_string()))
}

/// Fills the positional `{}` placeholders. Absent if any argument is absent.
fn format_string(
    name: &str,
    format: &FormatSource,
    input: &Value,
    registry: &Registry,
) -> Result<Option<String>> {
    let pieces: Vec<&str> = format.string.split("{}").collect();
    ensure!(
        pieces.len() - 1 == format.parameters.len(),
        FormatAritySnafu {
            name,
            placeholders: pieces.len() - 1,
            arguments: format.parameters.len(),
        }
    );

    let mut arguments = Vec::with_capacity(format.parameters.len());
    for argument in &format.parameters {
        let value = match argument {
            FormatArgument::Parameter(pointer) => request_parameter(input, pointer),
            FormatArgument::Registry(key) => registry_value(registry, key),
            FormatArgument::Literal(literal) => Some(Value::String(literal.clone())),
        };
        match value {
            Some(Value::String(value)) => arguments.push(value),
            Some(value) => arguments.push(value.to_string()),
            None => return Ok(None),
        }
    }

    let mut output = pieces[0].to_string();
    for (argument, piece) in arguments.iter().zip(&pieces[1..]) {
        output.push_str(argument);
        output.push_str(piece);
    }
    Ok(Some(output))
}

fn generate_password(name: &str, generate: &GeneratePasswordSource) -> Result<String> {
    let mut rng = rand::thread_rng();
    match &generate.dictionary {
        None => Ok((&mut rng)
            .sample_iter(&Alphanumeric)
            .take(generate.length)
            .map(char::from)
            .collect()),
        Some(dictionary) => {
            let dictionary: Vec<char> = dictionary.chars().collect();
            ensure!(!dictionary.is_empty(), EmptyDictionarySnafu { name });
            Ok((0..generate.length)
                .filter_map(|_| dictionary.choose(&mut rng))
                .collect())
        }
    }
}
