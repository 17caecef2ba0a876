//! Field-level validation errors in the style of the Kubernetes API server.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

const DNS1123_SUBDOMAIN_REGEX: &str =
    r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";

/// A path to a field, rendered as `spec.sources[0].name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPath(String);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    pub path: FieldPath,
    pub kind: FieldErrorKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldErrorKind {
    /// Holds the offending value, JSON encoded.
    Invalid(String),
    Duplicate(String),
    Forbidden,
    Required,
}

/// Accumulates field errors for a single object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldErrors(Vec<FieldError>);

/// A rejected object.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind} {name:?} is invalid: {}", join(.errors))]
pub struct Invalid {
    /// Qualified kind, e.g. `ServiceDefaults.consul.hashicorp.com`.
    pub kind: String,
    pub name: String,
    pub errors: Vec<FieldError>,
}

// === impl FieldPath ===

impl FieldPath {
    pub fn new(root: &str) -> Self {
        Self(root.to_string())
    }

    pub fn child(&self, name: &str) -> Self {
        Self(format!("{}.{}", self.0, name))
    }

    pub fn index(&self, i: usize) -> Self {
        Self(format!("{}[{}]", self.0, i))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === impl FieldError ===

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FieldErrorKind::Invalid(value) => {
                write!(f, "{}: Invalid value: {}: {}", self.path, value, self.detail)
            }
            FieldErrorKind::Duplicate(value) => {
                write!(f, "{}: Duplicate value: {}", self.path, value)
            }
            FieldErrorKind::Forbidden => write!(f, "{}: Forbidden: {}", self.path, self.detail),
            FieldErrorKind::Required => {
                write!(f, "{}: Required value: {}", self.path, self.detail)
            }
        }
    }
}

// === impl FieldErrors ===

impl FieldErrors {
    pub fn invalid<V: Serialize + ?Sized>(
        &mut self,
        path: &FieldPath,
        value: &V,
        detail: impl Into<String>,
    ) {
        let value = serde_json::to_string(value).unwrap_or_else(|_| "<unknown>".to_string());
        self.0.push(FieldError {
            path: path.clone(),
            kind: FieldErrorKind::Invalid(value),
            detail: detail.into(),
        });
    }

    pub fn duplicate<V: Serialize + ?Sized>(&mut self, path: &FieldPath, value: &V) {
        let value = serde_json::to_string(value).unwrap_or_else(|_| "<unknown>".to_string());
        self.0.push(FieldError {
            path: path.clone(),
            kind: FieldErrorKind::Duplicate(value),
            detail: String::new(),
        });
    }

    pub fn forbidden(&mut self, path: &FieldPath, detail: impl Into<String>) {
        self.0.push(FieldError {
            path: path.clone(),
            kind: FieldErrorKind::Forbidden,
            detail: detail.into(),
        });
    }

    pub fn required(&mut self, path: &FieldPath, detail: impl Into<String>) {
        self.0.push(FieldError {
            path: path.clone(),
            kind: FieldErrorKind::Required,
            detail: detail.into(),
        });
    }

    /// Records an error unless `value` is one of `allowed`.
    pub fn one_of(&mut self, path: &FieldPath, value: &str, allowed: &[&str]) {
        if !allowed.contains(&value) {
            self.invalid(path, value, not_in_slice_message(allowed));
        }
    }

    pub fn extend(&mut self, other: FieldErrors) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Produces an [`Invalid`] error for the object if any errors were
    /// recorded.
    pub fn into_result<K>(self, obj: &K) -> Result<(), Invalid>
    where
        K: kube::Resource<DynamicType = ()>,
    {
        if self.0.is_empty() {
            return Ok(());
        }

        Err(Invalid {
            kind: format!("{}.{}", K::kind(&()), K::group(&())),
            name: obj.meta().name.clone().unwrap_or_default(),
            errors: self.0,
        })
    }
}

impl IntoIterator for FieldErrors {
    type Item = FieldError;
    type IntoIter = std::vec::IntoIter<FieldError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Formats an allow-list as `must be one of "a", "b"`.
pub fn not_in_slice_message(allowed: &[&str]) -> String {
    let quoted = allowed
        .iter()
        .map(|s| format!("{s:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("must be one of {quoted}")
}

pub fn is_hostname(s: &str) -> bool {
    let regex = Regex::new(DNS1123_SUBDOMAIN_REGEX).expect("should_compile");
    s.len() <= 253 && regex.is_match(s)
}

pub fn is_ip(s: &str) -> bool {
    s.parse::<std::net::IpAddr>().is_ok()
}

pub fn is_port(port: i64) -> bool {
    (1..=65535).contains(&port)
}

fn join(errors: &[FieldError]) -> String {
    match errors {
        [error] => error.to_string(),
        errors => format!(
            "[{}]",
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_paths() {
        let path = FieldPath::new("spec").child("sources").index(2).child("name");
        assert_eq!(path.to_string(), "spec.sources[2].name");
    }

    #[test]
    fn renders_invalid_value() {
        let mut errs = FieldErrors::default();
        errs.one_of(
            &FieldPath::new("spec").child("protocol"),
            "foo",
            &["tcp", "http", "http2", "grpc"],
        );
        let error = errs.into_iter().next().unwrap();
        assert_eq!(
            error.to_string(),
            r#"spec.protocol: Invalid value: "foo": must be one of "tcp", "http", "http2", "grpc""#
        );
    }

    #[test]
    fn renders_required_value() {
        let mut errs = FieldErrors::default();
        errs.required(
            &FieldPath::new("spec").child("sources"),
            "at least one source must be specified",
        );
        let error = errs.into_iter().next().unwrap();
        assert_eq!(
            error.to_string(),
            "spec.sources: Required value: at least one source must be specified"
        );
    }

    #[test]
    fn hostnames() {
        assert!(is_hostname("api.example.com"));
        assert!(!is_hostname("-bad.example.com"));
        assert!(!is_hostname("UPPER.example.com"));
        assert!(is_ip("10.0.0.1"));
        assert!(is_ip("::1"));
        assert!(!is_ip("10.0.0"));
    }
}
