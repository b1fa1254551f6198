use serde::{Deserialize, Serialize};
use stackable_operator::schemars::{self, JsonSchema};

/// Declares how to obtain one value and where in the registry to store it.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationParameter {
    pub name: String,

    /// Fail provisioning when neither the source nor the default yields a value.
    #[serde(default)]
    pub required: bool,

    #[serde(default, rename = "type")]
    pub type_: ParameterType,

    /// Used when the source yields nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ConfigurationParameterSource>,

    /// Every resolved value is written to all of these. At least one is required.
    #[serde(default)]
    pub destinations: Vec<ConfigurationParameterDestination>,
}

impl ConfigurationParameter {
    /// JSON pointers into the request parameters read by this parameter's source.
    pub fn request_pointers(&self) -> Vec<&str> {
        match &self.source {
            Some(ConfigurationParameterSource::Parameter(pointer)) => vec![pointer.as_str()],
            Some(ConfigurationParameterSource::Format(format)) => format
                .parameters
                .iter()
                .filter_map(|argument| match argument {
                    FormatArgument::Parameter(pointer) => Some(pointer.as_str()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ParameterType {
    #[default]
    String,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigurationParameterSource {
    /// A JSON pointer (RFC 6901) into the request parameters, e.g. `/database/user`.
    Parameter(String),

    /// The value of a registry key.
    Registry(String),

    Literal(String),

    /// Positional `{}` placeholders in `string` are filled from `parameters` in order.
    Format(FormatSource),

    GeneratePassword(GeneratePasswordSource),
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatSource {
    pub string: String,

    #[serde(default)]
    pub parameters: Vec<FormatArgument>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FormatArgument {
    Parameter(String),
    Registry(String),
    Literal(String),
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePasswordSource {
    pub length: usize,

    /// Characters to draw from. Alphanumeric when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationParameterDestination {
    /// Registry key the value is stored under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}
