use std::{fmt, str::FromStr};

use crate::{
    config::{DEFAULT_REFERENCE_TAG, DEFAULT_REPO_NAMESPACE},
    CaskError,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An image reference of the form `name[:tag]`.
///
/// A single-segment name (no `/`) lives under the `library/` namespace on
/// Docker Hub; the tag defaults to `latest` when omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// The image name, possibly namespaced (e.g. `alpine` or `grafana/loki`).
    name: String,

    /// The image tag.
    tag: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Reference {
    /// Returns the image name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the image tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns the repository path used in registry URLs, applying the
    /// `library/` namespace to single-segment names.
    pub fn repository(&self) -> String {
        if self.name.contains('/') {
            self.name.clone()
        } else {
            format!("{}/{}", DEFAULT_REPO_NAMESPACE, self.name)
        }
    }

    /// Returns a filesystem-safe identifier for this reference, with `:` and
    /// `/` mapped to `_`.
    pub fn safe_id(&self) -> String {
        format!("{}_{}", self.name.replace('/', "_"), self.tag)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Reference {
    type Err = CaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CaskError::ImageReference("input string is empty".into()));
        }

        let (name, tag) = match s.split_once(':') {
            Some((name, tag)) => (name, tag),
            None => (s, DEFAULT_REFERENCE_TAG),
        };

        if name.is_empty() || tag.is_empty() || tag.contains(':') {
            return Err(CaskError::ImageReference(format!(
                "expected `name[:tag]`, got '{}'",
                s
            )));
        }

        let name_ok = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/".contains(c));
        let tag_ok = tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c));

        if !name_ok || !tag_ok {
            return Err(CaskError::ImageReference(format!(
                "invalid characters in '{}'",
                s
            )));
        }

        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_parse_name_and_tag() {
        let reference: Reference = "alpine:3.20".parse().unwrap();
        assert_eq!(reference.name(), "alpine");
        assert_eq!(reference.tag(), "3.20");
        assert_eq!(reference.to_string(), "alpine:3.20");
    }

    #[test]
    fn test_reference_default_tag() {
        let reference: Reference = "busybox".parse().unwrap();
        assert_eq!(reference.tag(), "latest");
    }

    #[test]
    fn test_reference_library_namespace() {
        let single: Reference = "alpine:latest".parse().unwrap();
        assert_eq!(single.repository(), "library/alpine");

        let namespaced: Reference = "grafana/loki:2.9".parse().unwrap();
        assert_eq!(namespaced.repository(), "grafana/loki");
    }

    #[test]
    fn test_reference_safe_id() {
        let reference: Reference = "grafana/loki:2.9".parse().unwrap();
        assert_eq!(reference.safe_id(), "grafana_loki_2.9");
    }

    #[test]
    fn test_reference_rejects_invalid_input() {
        assert!("".parse::<Reference>().is_err());
        assert!(":latest".parse::<Reference>().is_err());
        assert!("alpine:".parse::<Reference>().is_err());
        assert!("alpine:la:test".parse::<Reference>().is_err());
        assert!("Alp ine:latest".parse::<Reference>().is_err());
    }
}
