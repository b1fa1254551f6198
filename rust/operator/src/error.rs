use strum::Display;

/// How the broker front end should treat a failure.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorClass {
    /// Static misconfiguration: missing binding, missing required parameter, malformed template,
    /// unknown kind or missing namespace. Retrying the same request cannot succeed.
    Configuration,

    /// A write-once registry key was set to a different value.
    AlreadyBound,

    /// The target resource already exists, or could not be updated due to concurrent writers.
    Conflict,

    /// Network or API server failures. The caller may retry the whole request.
    Transient,
}

impl ErrorClass {
    pub fn is_permanent(self) -> bool {
        !matches!(self, ErrorClass::Transient)
    }
}

pub trait Classify {
    fn class(&self) -> ErrorClass;
}
