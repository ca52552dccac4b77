//! Identifier encoding.
//!
//! Logical names are folded, truncated and quoted so they are valid for the
//! target dialect. Encoding is deterministic: the same name always produces
//! the same physical identifier. [`IdentifierScope`] detects two logical names
//! landing on the same physical identifier.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::dialect::Dialect;
use crate::error::{MigrateError, Result};

/// Number of hex characters kept from the SHA-256 suffix.
const SUFFIX_HEX_LEN: usize = 8;

/// Encodes a logical name for `dialect`.
///
/// In order: lower-cases when the dialect folds unquoted identifiers,
/// truncates over-long names to a prefix plus `_` and 8 hex chars of the
/// name's SHA-256, then quotes reserved words and names outside `[a-z0-9_]`.
#[must_use]
pub fn encode(name: &str, dialect: Dialect) -> String {
    let sql = dialect.sql();
    let folded = if sql.folds_unquoted_identifiers() {
        name.to_lowercase()
    } else {
        name.to_string()
    };
    let truncated = truncate(&folded, name, sql.max_identifier_len());
    if needs_quoting(&truncated, dialect) {
        sql.quote_identifier(&truncated)
    } else {
        truncated
    }
}

/// Truncates `folded` to `max_len` bytes, appending a hash of `original`.
fn truncate(folded: &str, original: &str, max_len: usize) -> String {
    if folded.len() <= max_len {
        return folded.to_string();
    }

    let digest = hex::encode(Sha256::digest(original.as_bytes()));
    let suffix = &digest[..SUFFIX_HEX_LEN];
    let mut cut = max_len - SUFFIX_HEX_LEN - 1;
    while !folded.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{suffix}", &folded[..cut])
}

fn needs_quoting(name: &str, dialect: Dialect) -> bool {
    let plain = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    let leading_digit = name.bytes().next().is_some_and(|b| b.is_ascii_digit());
    !plain || leading_digit || dialect.sql().is_reserved(name)
}

/// Strips quoting from an encoded identifier.
///
/// Collisions are detected on the unquoted form, since `"user"` and `user`
/// name the same object once folded.
fn unquoted(encoded: &str, dialect: Dialect) -> String {
    let q = dialect.sql().quote_char();
    encoded
        .strip_prefix(q)
        .and_then(|s| s.strip_suffix(q))
        .map_or_else(
            || encoded.to_string(),
            |inner| inner.replace(&format!("{q}{q}"), &q.to_string()),
        )
}

/// A namespace in which encoded identifiers must stay distinct.
#[derive(Debug)]
pub struct IdentifierScope {
    dialect: Dialect,
    label: String,
    claimed: HashMap<String, String>,
}

impl IdentifierScope {
    /// Creates an empty scope. `label` names it in collision errors.
    #[must_use]
    pub fn new(dialect: Dialect, label: impl Into<String>) -> Self {
        Self {
            dialect,
            label: label.into(),
            claimed: HashMap::new(),
        }
    }

    /// Encodes `name` and claims the result in this scope.
    ///
    /// Encoding the same logical name twice is allowed and returns the same
    /// identifier.
    ///
    /// # Errors
    ///
    /// Returns `InvalidModel` for an empty name, and `IdentifierCollision`
    /// when a different logical name already claimed the physical identifier.
    pub fn encode(&mut self, name: &str) -> Result<String> {
        self.claim(name, name)
    }

    /// Encodes a derived `name` on behalf of `owner`.
    ///
    /// Derived names such as `uq_{table}_{column}` can coincide for different
    /// owners. When another owner already holds the identifier, 8 hex chars of
    /// the SHA-256 of `owner` are appended so each owner keeps its own name.
    /// The same owner always gets the same identifier back.
    ///
    /// # Errors
    ///
    /// Returns `InvalidModel` for an empty name, and `IdentifierCollision`
    /// if the suffixed name is taken as well.
    pub fn encode_for(&mut self, owner: &str, name: &str) -> Result<String> {
        match self.claim(owner, name) {
            Err(MigrateError::IdentifierCollision { .. }) => {
                let digest = hex::encode(Sha256::digest(owner.as_bytes()));
                self.claim(owner, &format!("{name}_{}", &digest[..SUFFIX_HEX_LEN]))
            }
            other => other,
        }
    }

    fn claim(&mut self, owner: &str, name: &str) -> Result<String> {
        if name.is_empty() {
            return Err(MigrateError::invalid_model(
                &self.label,
                "identifier is empty",
            ));
        }
        if name.contains('\0') {
            return Err(MigrateError::invalid_model(
                &self.label,
                format!("identifier {name:?} contains a null byte"),
            ));
        }

        let encoded = encode(name, self.dialect);
        let key = unquoted(&encoded, self.dialect);
        match self.claimed.get(&key) {
            Some(existing) if existing != owner => Err(MigrateError::IdentifierCollision {
                first: existing.clone(),
                second: owner.to_string(),
                physical: key,
                scope: self.label.clone(),
                dialect: self.dialect,
            }),
            Some(_) => Ok(encoded),
            None => {
                self.claimed.insert(key, owner.to_string());
                Ok(encoded)
            }
        }
    }
}
