//! Secret reference resolution
//!
//! Stored secret values may reference `{env.VAR}`; resolution happens on
//! read so rotated environment values are picked up without a reload.

use regex::Regex;

use crate::{Error, Result};

/// Resolves `{env.VAR}` references inside secret values
#[derive(Debug, Clone)]
pub struct SecretResolver {
    env_pattern: Regex,
}

impl SecretResolver {
    /// Create a new secret resolver
    ///
    /// # Errors
    ///
    /// Returns an error if the reference pattern fails to compile.
    pub fn new() -> Result<Self> {
        let env_pattern =
            Regex::new(r"\{env\.([^}]+)\}").map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { env_pattern })
    }

    /// Resolve every reference in `value`.
    ///
    /// An unset variable is an error: a credential must never silently
    /// become the empty string.
    pub fn resolve(&self, value: &str) -> Result<String> {
        let mut missing = None;
        let resolved = self
            .env_pattern
            .replace_all(value, |caps: &regex::Captures| {
                let var_name = &caps[1];
                std::env::var(var_name).unwrap_or_else(|_| {
                    missing.get_or_insert_with(|| var_name.to_string());
                    String::new()
                })
            })
            .into_owned();

        match missing {
            Some(var) => Err(Error::Config(format!(
                "Secret references unset environment variable '{var}'"
            ))),
            None => Ok(resolved),
        }
    }
}
