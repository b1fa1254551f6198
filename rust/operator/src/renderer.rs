//! Substitutes registry values into templates.
//!
//! String values in a template may contain `{{ registry "key" }}` placeholders. A string that
//! consists of exactly one placeholder whose key is not set is removed from its parent object or
//! array, which allows optional fields. Everywhere else an unset key is an error.

use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_service_broker_crd::ConfigurationTemplate;

use crate::{
    error::{Classify, ErrorClass},
    manifest::{self, Manifest},
    registry::Registry,
    template_index::{self, TemplateIndex},
};

const PLACEHOLDER_START: &str = "{{";
const PLACEHOLDER_END: &str = "}}";
const REGISTRY_DIRECTIVE: &str = "registry";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to look up template"))]
    LookupTemplate { source: template_index::Error },

    #[snafu(display("template [{template}] contains an unterminated placeholder"))]
    UnterminatedPlaceholder { template: String },

    #[snafu(display("template [{template}] contains unsupported placeholder [{placeholder}]"))]
    UnsupportedPlaceholder {
        template: String,
        placeholder: String,
    },

    #[snafu(display("template [{template}] references unset registry key [{key}]"))]
    UnsetRegistryKey { template: String, key: String },

    #[snafu(display("template [{template}] does not render to a valid manifest"))]
    InvalidManifest {
        source: manifest::Error,
        template: String,
    },
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::LookupTemplate { source } => source.class(),
            _ => ErrorClass::Configuration,
        }
    }
}

/// A template after substitution.
#[derive(Clone, Debug)]
pub struct RenderedTemplate {
    pub name: String,

    /// `None` for templates that only exist to declare parameters.
    pub manifest: Option<Manifest>,

    pub singleton: bool,
}

impl RenderedTemplate {
    pub fn is_no_manifest(&self) -> bool {
        self.manifest.is_none()
    }
}

pub fn render_template(
    index: &TemplateIndex<'_>,
    name: &str,
    registry: &Registry,
) -> Result<RenderedTemplate> {
    let template = index.template(name).context(LookupTemplateSnafu)?;
    render(template, registry)
}

pub fn render(template: &ConfigurationTemplate, registry: &Registry) -> Result<RenderedTemplate> {
    let name = template.name.as_str();
    let manifest = match &template.template {
        None => {
            tracing::debug!(template = name, "template has no manifest");
            None
        }
        Some(raw) => {
            let value = substitute(name, raw.clone(), registry)?.unwrap_or(Value::Null);
            Some(Manifest::from_value(value).context(InvalidManifestSnafu { template: name })?)
        }
    };

    Ok(RenderedTemplate {
        name: name.to_string(),
        manifest,
        singleton: template.singleton,
    })
}

/// Returns `None` if the value is to be removed from its parent.
fn substitute(template: &str, value: Value, registry: &Registry) -> Result<Option<Value>> {
    Ok(match value {
        Value::String(string) => substitute_string(template, &string, registry)?.map(Value::String),
        Value::Array(items) => {
            let mut substituted = Vec::with_capacity(items.len());
            for item in items {
                substituted.extend(substitute(template, item, registry)?);
            }
            Some(Value::Array(substituted))
        }
        Value::Object(fields) => {
            let mut substituted = Map::with_capacity(fields.len());
            for (key, field) in fields {
                if let Some(field) = substitute(template, field, registry)? {
                    substituted.insert(key, field);
                }
            }
            Some(Value::Object(substituted))
        }
        other => Some(other),
    })
}

fn substitute_string(template: &str, input: &str, registry: &Registry) -> Result<Option<String>> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find(PLACEHOLDER_START) {
        let after_start = &rest[start + PLACEHOLDER_START.len()..];
        let end = after_start
            .find(PLACEHOLDER_END)
            .context(UnterminatedPlaceholderSnafu { template })?;
        let key = registry_key(template, &after_start[..end])?;
        let whole = start == 0 && after_start[end + PLACEHOLDER_END.len()..].is_empty();

        output.push_str(&rest[..start]);
        match registry.lookup(key) {
            Some(value) => output.push_str(value),
            None if whole && output.is_empty() => return Ok(None),
            None => return UnsetRegistryKeySnafu { template, key }.fail(),
        }
        rest = &after_start[end + PLACEHOLDER_END.len()..];
    }

    output.push_str(rest);
    Ok(Some(output))
}

/// Parses the inside of a placeholder, `registry "key"`.
fn registry_key<'a>(template: &str, placeholder: &'a str) -> Result<&'a str> {
    placeholder
        .trim()
        .strip_prefix(REGISTRY_DIRECTIVE)
        .filter(|argument| argument.starts_with(char::is_whitespace))
        .map(str::trim)
        .and_then(|argument| argument.strip_prefix('"'))
        .and_then(|argument| argument.strip_suffix('"'))
        .filter(|key| !key.is_empty() && !key.contains('"'))
        .with_context(|| UnsupportedPlaceholderSnafu {
            template,
            placeholder: placeholder.trim(),
        })
}
