//! Component URL parsing.
//!
//! Component URLs name the packaged program to start:
//!
//! ```text
//! scheme://host/path[#resource]
//!
//! realm-pkg://packages.local/observer#meta/observer.sandbox
//! file:///bin/sleep
//! ```
//!
//! Parsing is deliberately strict and allowlist-based: the scheme selects a
//! [`PackageLoader`](crate::loader::PackageLoader), the host and path name
//! the package, and the optional fragment names a resource inside it. An
//! unparseable URL never creates any state -- the creation pipeline binds
//! the caller's controller to a stub that is born terminated with
//! `URL_INVALID`.

use crate::error::{Error, Result};

/// Maximum component URL length in bytes.
///
/// **Security**: Prevents pathological inputs from reaching loaders and
/// storage-path derivation.
pub const MAX_URL_LEN: usize = 512;

/// Valid characters for the scheme (first char must be alphabetic).
const SCHEME_VALID_CHARS: &str = "abcdefghijklmnopqrstuvwxyz0123456789+-.";

/// Valid characters for host, path, and resource segments.
const URL_BODY_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@+%";

/// A parsed component URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentUrl {
    scheme: String,
    host: String,
    path: String,
    resource: Option<String>,
}

impl ComponentUrl {
    /// Parses a component URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] for anything that does not match
    /// `scheme://host/path[#resource]`. Path traversal components (`..`)
    /// are rejected outright since URL paths feed filesystem derivation.
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        if url.is_empty() {
            return Err(invalid("empty URL"));
        }
        if url.len() > MAX_URL_LEN {
            return Err(invalid("URL exceeds maximum length"));
        }

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| invalid("missing '://' separator"))?;

        if scheme.is_empty()
            || !scheme.chars().next().is_some_and(|c| c.is_ascii_lowercase())
            || !scheme.chars().all(|c| SCHEME_VALID_CHARS.contains(c))
        {
            return Err(invalid("invalid scheme"));
        }

        let (body, resource) = match rest.split_once('#') {
            Some((body, res)) => {
                if res.is_empty() {
                    return Err(invalid("empty resource fragment"));
                }
                (body, Some(res.to_string()))
            }
            None => (rest, None),
        };

        if body.is_empty() {
            return Err(invalid("missing host and path"));
        }
        if !body.chars().all(|c| URL_BODY_VALID_CHARS.contains(c)) {
            return Err(invalid("URL contains invalid characters"));
        }

        let (host, path) = match body.split_once('/') {
            Some((host, path)) => (host.to_string(), format!("/{path}")),
            None => (body.to_string(), String::from("/")),
        };

        for segment in path.split('/').chain(resource.as_deref().unwrap_or("").split('/')) {
            if segment == ".." {
                return Err(invalid("path traversal in URL"));
            }
        }

        Ok(Self {
            scheme: scheme.to_string(),
            host,
            path,
            resource,
        })
    }

    /// The URL scheme (selects the package loader).
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The host component (may be empty for `file://` URLs).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The path component, always starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The optional resource fragment.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The last path segment, used as the default component label.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or(&self.host)
    }

    /// The canonical form without the resource fragment.
    ///
    /// Used for isolated-storage derivation and runner deduplication, where
    /// two URLs naming the same package must compare equal.
    pub fn without_resource(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path)
    }
}

impl std::fmt::Display for ComponentUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host, self.path)?;
        if let Some(res) = &self.resource {
            write!(f, "#{res}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_package_url() {
        let url = ComponentUrl::parse("realm-pkg://packages.local/observer#meta/observer.sandbox")
            .unwrap();
        assert_eq!(url.scheme(), "realm-pkg");
        assert_eq!(url.host(), "packages.local");
        assert_eq!(url.path(), "/observer");
        assert_eq!(url.resource(), Some("meta/observer.sandbox"));
        assert_eq!(url.name(), "observer");
    }

    #[test]
    fn test_parse_file_url() {
        let url = ComponentUrl::parse("file:///bin/sleep").unwrap();
        assert_eq!(url.scheme(), "file");
        assert_eq!(url.host(), "");
        assert_eq!(url.path(), "/bin/sleep");
        assert_eq!(url.name(), "sleep");
    }

    #[test]
    fn test_display_round_trips() {
        for raw in [
            "realm-pkg://packages.local/observer#meta/observer.sandbox",
            "file:///bin/true",
        ] {
            assert_eq!(ComponentUrl::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ComponentUrl::parse("").is_err());
        assert!(ComponentUrl::parse("no-separator").is_err());
        assert!(ComponentUrl::parse("://missing-scheme").is_err());
        assert!(ComponentUrl::parse("pkg://host/a/../b").is_err());
        assert!(ComponentUrl::parse("pkg://host/a#").is_err());
        assert!(ComponentUrl::parse(&format!("pkg://h/{}", "x".repeat(MAX_URL_LEN))).is_err());
    }

    #[test]
    fn test_without_resource_is_canonical() {
        let a = ComponentUrl::parse("pkg://host/runner#meta/runner.sandbox").unwrap();
        let b = ComponentUrl::parse("pkg://host/runner").unwrap();
        assert_eq!(a.without_resource(), b.without_resource());
    }
}
