//! Handle configuration.
//!
//! A [`HandleConfig`] is fixed when a [`Handle`](crate::handle::Handle) is
//! built and shared by every operator the handle creates, sub-operators
//! included.
//!
//! # Environment
//!
//! [`HandleConfig::from_env`] starts from [`HandleConfig::default`] and
//! applies, when set:
//!
//! - `BRINY_CONV_BACKEND`: `cpu`, `wgpu` or `cuda`
//! - `BRINY_CONV_WORKSPACE_LIMIT`: largest workspace, in bytes, the
//!   heuristic may pick an algorithm for
//! - `BRINY_CONV_MAX_OPERATORS`: cap on live operators per handle

use crate::backend::{get_backend, Backend};
use crate::error::{ConvError, Result};

pub const ENV_BACKEND: &str = "BRINY_CONV_BACKEND";
pub const ENV_WORKSPACE_LIMIT: &str = "BRINY_CONV_WORKSPACE_LIMIT";
pub const ENV_MAX_OPERATORS: &str = "BRINY_CONV_MAX_OPERATORS";

/// Settings shared by a handle and all operators created from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleConfig {
    pub backend: Backend,
    /// Heuristic selection skips algorithms needing more scratch than this.
    /// Forced algorithms are not subject to the limit.
    pub workspace_limit: usize,
    /// Maximum number of operators alive at once; `None` is unbounded.
    pub max_operators: Option<usize>,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            backend: get_backend(),
            workspace_limit: usize::MAX,
            max_operators: None,
        }
    }
}

impl HandleConfig {
    /// Reads overrides from the process environment.
    ///
    /// # Errors
    /// - [`ConvError::UnsupportedConfiguration`] if a variable is set to a
    ///   value that does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`HandleConfig::from_env`], with an arbitrary key lookup.
    ///
    /// # Errors
    /// - [`ConvError::UnsupportedConfiguration`] if a value does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(raw) = lookup(ENV_BACKEND) {
            cfg.backend = raw
                .parse()
                .map_err(|()| ConvError::unsupported(format!("{ENV_BACKEND}={raw}")))?;
        }
        if let Some(raw) = lookup(ENV_WORKSPACE_LIMIT) {
            cfg.workspace_limit = parse_count(ENV_WORKSPACE_LIMIT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_OPERATORS) {
            cfg.max_operators = Some(parse_count(ENV_MAX_OPERATORS, &raw)?);
        }

        Ok(cfg)
    }

    #[must_use]
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    #[must_use]
    pub fn with_workspace_limit(mut self, bytes: usize) -> Self {
        self.workspace_limit = bytes;
        self
    }

    #[must_use]
    pub fn with_max_operators(mut self, n: usize) -> Self {
        self.max_operators = Some(n);
        self
    }
}

fn parse_count(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|e| ConvError::unsupported(format!("{key}={raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let cfg = HandleConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.workspace_limit, usize::MAX);
        assert_eq!(cfg.max_operators, None);
    }

    #[test]
    fn variables_override_defaults() {
        let cfg = HandleConfig::from_lookup(lookup(&[
            (ENV_BACKEND, "wgpu"),
            (ENV_WORKSPACE_LIMIT, "4096"),
            (ENV_MAX_OPERATORS, " 3 "),
        ]))
        .unwrap();
        assert_eq!(cfg.backend, Backend::Wgpu);
        assert_eq!(cfg.workspace_limit, 4096);
        assert_eq!(cfg.max_operators, Some(3));
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(HandleConfig::from_lookup(lookup(&[(ENV_BACKEND, "tpu")])).is_err());
        assert!(HandleConfig::from_lookup(lookup(&[(ENV_WORKSPACE_LIMIT, "-1")])).is_err());
    }
}
