//! The typed secret-reference list: `NAME=scheme://location` entries.
//!
//! Resolution of a reference to an actual value happens in the container
//! engine at command-execution time (§4.7); this module only parses,
//! validates, and edits the reference list itself.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Schemes accepted for a secret reference.
///
/// The design notes (§9) flag a documented/actual mismatch upstream: docs
/// describe `{file, env, op, vault}` but some source paths only accept
/// `{file, env, op}`. Per the resolution recorded in the grounding ledger,
/// the documented set is authoritative — `vault` is accepted.
const VALID_SCHEMES: &[&str] = &["file", "env", "op", "vault"];

/// One `NAME=scheme://location` secret reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    /// The identifier the agent sees as an environment variable name.
    pub name: String,
    /// The scheme, one of [`VALID_SCHEMES`].
    pub scheme: String,
    /// The scheme-specific location (file path, env var name, op item path, …).
    pub location: String,
}

impl SecretRef {
    /// Parse a `NAME=scheme://location` string.
    ///
    /// # Errors
    /// Returns [`Error::SecretInvalid`] if the string doesn't split on `=`,
    /// the name is empty or not identifier-shaped, or the scheme isn't in
    /// the closed set.
    pub fn parse(entry: &str) -> Result<Self> {
        let (name, rest) = entry.split_once('=').ok_or_else(|| Error::SecretInvalid {
            reason: format!("{entry:?} is missing '=' separator"),
        })?;
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::SecretInvalid {
                reason: format!("{name:?} is not a valid identifier"),
            });
        }
        let (scheme, location) = rest.split_once("://").ok_or_else(|| Error::SecretInvalid {
            reason: format!("{rest:?} is missing a '://' scheme separator"),
        })?;
        if !VALID_SCHEMES.contains(&scheme) {
            return Err(Error::SecretInvalid {
                reason: format!(
                    "scheme {scheme:?} is not one of {VALID_SCHEMES:?}"
                ),
            });
        }
        Ok(Self {
            name: name.to_owned(),
            scheme: scheme.to_owned(),
            location: location.to_owned(),
        })
    }

    /// Render back to `NAME=scheme://location`.
    #[must_use]
    pub fn to_entry(&self) -> String {
        format!("{}={}://{}", self.name, self.scheme, self.location)
    }
}

/// An ordered list of secret references, unique by name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    entries: Vec<SecretRef>,
}

impl SecretSpec {
    /// An empty spec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an already-parsed list, e.g. when loading config.
    #[must_use]
    pub fn from_entries(entries: Vec<SecretRef>) -> Self {
        Self { entries }
    }

    /// Add a secret reference. O(n) duplicate-name scan.
    ///
    /// # Errors
    /// Returns [`Error::SecretInvalid`] if `entry` fails to parse or a
    /// secret with the same name already exists. On error, the spec is left
    /// unmutated.
    pub fn add(&mut self, entry: &str) -> Result<()> {
        let parsed = SecretRef::parse(entry)?;
        if self.entries.iter().any(|e| e.name == parsed.name) {
            return Err(Error::SecretInvalid {
                reason: format!("secret {:?} already exists", parsed.name),
            });
        }
        self.entries.push(parsed);
        Ok(())
    }

    /// Delete a secret by name. O(n).
    ///
    /// # Errors
    /// Returns [`Error::SecretInvalid`] if no secret with that name exists.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        if self.entries.len() == before {
            return Err(Error::SecretInvalid {
                reason: format!("secret {name:?} not found"),
            });
        }
        Ok(())
    }

    /// Names in insertion order.
    #[must_use]
    pub fn list(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Look up a secret reference by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SecretRef> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Borrow the full entry list, in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[SecretRef] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_all_documented_schemes() {
        for scheme in VALID_SCHEMES {
            let entry = format!("API_KEY={scheme}://some/place");
            let parsed = SecretRef::parse(&entry).unwrap();
            assert_eq!(parsed.scheme, *scheme);
        }
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        let err = SecretRef::parse("X=ftp://host/path").unwrap_err();
        assert!(matches!(err, Error::SecretInvalid { .. }));
    }

    #[test]
    fn round_trip_preserves_entry() {
        let parsed = SecretRef::parse("DB_PASS=op://vault/item/field").unwrap();
        assert_eq!(parsed.to_entry(), "DB_PASS=op://vault/item/field");
    }

    #[test]
    fn add_rejects_duplicate_name_without_mutating() {
        let mut spec = SecretSpec::new();
        spec.add("X=env://FOO").unwrap();
        let err = spec.add("X=file:///etc/foo").unwrap_err();
        assert!(matches!(err, Error::SecretInvalid { .. }));
        assert_eq!(spec.list(), vec!["X"]);
    }

    #[test]
    fn delete_unknown_name_is_explicit_error() {
        let mut spec = SecretSpec::new();
        let err = spec.delete("nope").unwrap_err();
        assert!(matches!(err, Error::SecretInvalid { .. }));
    }

    #[test]
    fn list_preserves_insertion_order() {
        let mut spec = SecretSpec::new();
        spec.add("B=env://B").unwrap();
        spec.add("A=env://A").unwrap();
        assert_eq!(spec.list(), vec!["B", "A"]);
    }

    #[test]
    fn secret_round_trip_add_list_get() {
        let mut spec = SecretSpec::new();
        spec.add("TOKEN=vault://secret/data/token").unwrap();
        assert!(spec.list().contains(&"TOKEN"));
        assert_eq!(spec.get("TOKEN").unwrap().to_entry(), "TOKEN=vault://secret/data/token");
    }
}
