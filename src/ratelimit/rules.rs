//! Named rate limit types.
//!
//! A [`ConfigRegistry`] maps a small set of type names (`api`, `user`, `ip`,
//! `login`) to default [`RateLimitConfig`] values. It is built once at
//! startup, optionally overridden from a YAML rules file, and handed to
//! whoever needs it; there is no process-wide registry.
//!
//! Rules files look like:
//!
//! ```yaml
//! types:
//!   api:
//!     algorithm: sliding_window
//!     limit: 100
//!     window: 60
//!   uploads:
//!     algorithm: token_bucket
//!     limit: 10
//!     window: 60
//!     burst: 20
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::algorithm::{Algorithm, RateLimitConfig};
use super::limiter::{RateLimitResult, RateLimiter};
use crate::error::{RateLimitError, Result};

/// A rules document overriding or extending the named types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    /// Map of type name to its rule
    #[serde(default)]
    pub types: BTreeMap<String, TypeRule>,
}

/// Limits for one named type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeRule {
    /// Algorithm name, e.g. `token_bucket`
    pub algorithm: String,
    /// Maximum requests per window
    pub limit: u64,
    /// Window in seconds
    pub window: u64,
    /// Optional bucket capacity
    #[serde(default)]
    pub burst: Option<u64>,
    /// Optional token refill rate per second
    #[serde(default)]
    pub refill_rate: Option<f64>,
}

impl RuleSet {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }
}

/// Registry of named rate limit configurations.
pub struct ConfigRegistry<C = ()> {
    types: HashMap<String, RateLimitConfig<C>>,
}

impl<C> ConfigRegistry<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// Create a registry holding the built-in `api`, `user`, `ip` and `login` types.
    pub fn with_defaults() -> Self {
        let mut types = HashMap::new();
        types.insert(
            "api".to_string(),
            RateLimitConfig::new(Algorithm::SlidingWindow, 100, 60),
        );
        types.insert(
            "user".to_string(),
            RateLimitConfig::new(Algorithm::TokenBucket, 1000, 3600).with_burst(100),
        );
        types.insert(
            "ip".to_string(),
            RateLimitConfig::new(Algorithm::FixedWindow, 300, 60),
        );
        types.insert(
            "login".to_string(),
            RateLimitConfig::new(Algorithm::LeakyBucket, 5, 300),
        );
        Self { types }
    }

    /// Built-in types overridden by the rules in a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut registry = Self::with_defaults();
        registry.apply_rules(RuleSet::from_file(path)?)?;
        Ok(registry)
    }

    /// Built-in types overridden by the rules in a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut registry = Self::with_defaults();
        registry.apply_rules(RuleSet::from_yaml(yaml)?)?;
        Ok(registry)
    }

    /// Merge `rules` into the registry.
    ///
    /// Every rule is validated before any is applied. Hooks already attached
    /// to an overridden type are kept.
    pub fn apply_rules(&mut self, rules: RuleSet) -> Result<()> {
        let mut parsed = Vec::with_capacity(rules.types.len());
        for (name, rule) in rules.types {
            let algorithm: Algorithm = rule.algorithm.parse()?;
            let mut config: RateLimitConfig<C> =
                RateLimitConfig::new(algorithm, rule.limit, rule.window);
            config.burst = rule.burst;
            config.refill_rate = rule.refill_rate;
            config
                .validate()
                .map_err(|e| RateLimitError::Config(format!("type {}: {}", name, e)))?;
            parsed.push((name, config));
        }

        for (name, mut config) in parsed {
            if let Some(existing) = self.types.remove(&name) {
                config.key_generator = existing.key_generator;
                config.skip_if = existing.skip_if;
            }
            debug!(
                name = %name,
                algorithm = %config.algorithm,
                limit = config.limit,
                window = config.window,
                "Registered rate limit type"
            );
            self.types.insert(name, config);
        }
        Ok(())
    }

    /// Add or replace a named type.
    pub fn register(&mut self, name: impl Into<String>, config: RateLimitConfig<C>) -> Result<()> {
        config.validate()?;
        self.types.insert(name.into(), config);
        Ok(())
    }

    /// Attach a key generator to an existing type.
    pub fn set_key_generator<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: Fn(&C) -> String + Send + Sync + 'static,
    {
        self.get_mut(name)?.key_generator = Some(Arc::new(f));
        Ok(())
    }

    /// Attach a skip predicate to an existing type.
    pub fn set_skip_if<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.get_mut(name)?.skip_if = Some(Arc::new(f));
        Ok(())
    }

    /// Look up a named type.
    pub fn get(&self, name: &str) -> Result<&RateLimitConfig<C>> {
        self.types
            .get(name)
            .ok_or_else(|| RateLimitError::UnknownType(name.to_string()))
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut RateLimitConfig<C>> {
        self.types
            .get_mut(name)
            .ok_or_else(|| RateLimitError::UnknownType(name.to_string()))
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Rate limit key for `identifier` under `name`.
    ///
    /// Uses the type's key generator when it has one, otherwise `{name}:{identifier}`.
    pub fn resolve_key(&self, name: &str, identifier: &str, context: &C) -> Result<String> {
        let config = self.get(name)?;
        Ok(match &config.key_generator {
            Some(generate) => generate(context),
            None => format!("{}:{}", name, identifier),
        })
    }

    /// Check the rate limit of a named type.
    pub async fn check_by_type(
        &self,
        limiter: &RateLimiter,
        name: &str,
        identifier: &str,
        context: &C,
    ) -> Result<RateLimitResult> {
        let config = self.get(name)?;
        let key = self.resolve_key(name, identifier, context)?;
        limiter.check(&key, config, context).await
    }
}

impl<C> Default for ConfigRegistry<C> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<C> std::fmt::Debug for ConfigRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigRegistry")
            .field("types", &self.types)
            .finish()
    }
}
