use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use crate::buffer::{DEFAULT_PAGE_CAPACITY, DEFAULT_POOL_SIZE};
use crate::conventions::ActionConventions;

const ENV_PREFIX: &str = "ROVER_SSR_";

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub log_level: String,
    /// Chunks per output page
    pub page_capacity: usize,
    /// Cleared pages kept for reuse
    pub page_pool_size: usize,
    pub handler_attribute_prefix: String,
    pub action_attribute_prefix: String,
    pub fingerprint_attribute: String,
    pub handler_field_name: String,
    pub update_attribute: String,
    /// Origin that redirect targets are compared against
    pub base_origin: String,
    /// Signing key for cross-origin redirect tokens (None = ephemeral key)
    pub redirect_key: Option<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            page_capacity: DEFAULT_PAGE_CAPACITY,
            page_pool_size: DEFAULT_POOL_SIZE,
            handler_attribute_prefix: "on".to_string(),
            action_attribute_prefix: "hx-".to_string(),
            fingerprint_attribute: "data-handler".to_string(),
            handler_field_name: "_handler".to_string(),
            update_attribute: "data-update".to_string(),
            base_origin: "http://localhost".to_string(),
            redirect_key: None,
        }
    }
}

impl RenderConfig {
    /// Load `.env` if present, then override defaults from `ROVER_SSR_*`
    /// variables.
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from: {:?}", path),
            Err(e) => tracing::debug!("No .env file found: {}", e),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(level) = var("LOG_LEVEL") {
            let level = level.to_lowercase();
            match level.as_str() {
                "debug" | "info" | "warn" | "error" | "nope" => config.log_level = level,
                _ => {
                    return Err(anyhow!(
                        "log_level must be one of: debug, info, warn, error, nope"
                    ));
                }
            }
        }
        if let Some(capacity) = var("PAGE_CAPACITY") {
            config.page_capacity = parse_positive(&capacity).context("invalid PAGE_CAPACITY")?;
        }
        if let Some(pool) = var("PAGE_POOL_SIZE") {
            config.page_pool_size = pool
                .trim()
                .parse()
                .with_context(|| format!("invalid PAGE_POOL_SIZE '{}'", pool))?;
        }
        if let Some(prefix) = var("HANDLER_PREFIX") {
            config.handler_attribute_prefix = prefix;
        }
        if let Some(prefix) = var("ACTION_PREFIX") {
            config.action_attribute_prefix = prefix;
        }
        if let Some(name) = var("FINGERPRINT_ATTRIBUTE") {
            config.fingerprint_attribute = name;
        }
        if let Some(name) = var("HANDLER_FIELD") {
            config.handler_field_name = name;
        }
        if let Some(name) = var("UPDATE_ATTRIBUTE") {
            config.update_attribute = name;
        }
        if let Some(origin) = var("BASE_ORIGIN") {
            url::Url::parse(&origin)
                .with_context(|| format!("invalid BASE_ORIGIN '{}'", origin))?;
            config.base_origin = origin;
        }
        config.redirect_key = var("REDIRECT_KEY").filter(|k| !k.is_empty());

        Ok(config)
    }

    pub fn conventions(&self) -> ActionConventions {
        ActionConventions {
            handler_prefix: Arc::from(self.handler_attribute_prefix.as_str()),
            action_prefix: Arc::from(self.action_attribute_prefix.as_str()),
            fingerprint_attribute: Arc::from(self.fingerprint_attribute.as_str()),
            handler_field_name: Arc::from(self.handler_field_name.as_str()),
            update_attribute: Arc::from(self.update_attribute.as_str()),
        }
    }

    /// Install the fmt subscriber. `nope` keeps logging off; a subscriber
    /// that is already installed is left alone.
    pub fn init_tracing(&self) {
        if self.log_level == "nope" {
            return;
        }
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&self.log_level)),
            )
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .try_init();
    }
}

fn parse_positive(value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err(anyhow!("value must be greater than zero")),
        Err(e) => Err(anyhow!("'{}' is not a number: {}", value, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = RenderConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.page_capacity, DEFAULT_PAGE_CAPACITY);
        assert_eq!(config.action_attribute_prefix, "hx-");
        assert!(config.redirect_key.is_none());
    }

    #[test]
    fn test_overrides_from_variables() {
        let config = RenderConfig::from_lookup(lookup(&[
            ("ROVER_SSR_LOG_LEVEL", "DEBUG"),
            ("ROVER_SSR_PAGE_CAPACITY", "8"),
            ("ROVER_SSR_ACTION_PREFIX", "data-"),
            ("ROVER_SSR_BASE_ORIGIN", "https://app.example.com"),
            ("ROVER_SSR_REDIRECT_KEY", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.page_capacity, 8);
        assert_eq!(&*config.conventions().action_prefix, "data-");
        assert_eq!(config.base_origin, "https://app.example.com");
        assert_eq!(config.redirect_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(RenderConfig::from_lookup(lookup(&[("ROVER_SSR_LOG_LEVEL", "loud")])).is_err());
        assert!(RenderConfig::from_lookup(lookup(&[("ROVER_SSR_PAGE_CAPACITY", "0")])).is_err());
        assert!(RenderConfig::from_lookup(lookup(&[("ROVER_SSR_PAGE_CAPACITY", "many")])).is_err());
        assert!(RenderConfig::from_lookup(lookup(&[("ROVER_SSR_BASE_ORIGIN", "not a url")])).is_err());
    }

    #[test]
    fn test_init_tracing_is_repeatable() {
        let config = RenderConfig {
            log_level: "debug".to_string(),
            ..RenderConfig::default()
        };
        config.init_tracing();
        config.init_tracing();

        let silent = RenderConfig {
            log_level: "nope".to_string(),
            ..RenderConfig::default()
        };
        silent.init_tracing();
    }
}
