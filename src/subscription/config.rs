//! Configuration of the subscription coordination client.
//!
//! ```rust,no_run
//! use nakadi_subscription::subscription::SubscriptionConfig;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SubscriptionConfig::from_env()?;
//! if let Err(errors) = config.validate() {
//!     for error in errors {
//!         eprintln!("invalid configuration: {}", error);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use super::keys::RecordEncoding;
use crate::constants::{
    DEFAULT_PARTITION_PROGRESS_LOG_INTERVAL, DEFAULT_ROOT_PATH, DEFAULT_UNREGISTER_MAX_DELAY_MS,
    DEFAULT_UNREGISTER_MAX_RETRIES, DEFAULT_UNREGISTER_MIN_DELAY_MS,
    DEFAULT_WATCH_REARM_MAX_DELAY_MS, DEFAULT_WATCH_REARM_MAX_RETRIES,
    DEFAULT_WATCH_REARM_MIN_DELAY_MS,
};
use crate::store::validate_path;

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Root node under which `locks/` and `subscriptions/` live.
    pub root_path: String,

    /// Encoding used when writing partition records. Reads accept both.
    ///
    /// Keep `Legacy` while any existing deployment reads the same store.
    pub record_encoding: RecordEncoding,

    /// Reject partition updates that are not legal state machine transitions.
    ///
    /// When disabled, only the record invariants are checked and the caller
    /// is trusted to request legal transitions.
    pub strict_transitions: bool,

    /// Log a progress line every N partitions while filling a subscription.
    pub partition_progress_log_interval: usize,

    /// Retries of the guaranteed session delete on connection loss.
    pub unregister_max_retries: usize,
    pub unregister_min_delay: Duration,
    pub unregister_max_delay: Duration,

    /// Retries of a listener's watch rearm on connection loss.
    ///
    /// A listener whose rearm still fails after these retries stops and
    /// reports the error from [`ListenerHandle::cancel`](super::ListenerHandle::cancel).
    pub watch_rearm_max_retries: usize,
    pub watch_rearm_min_delay: Duration,
    pub watch_rearm_max_delay: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            root_path: DEFAULT_ROOT_PATH.to_string(),
            record_encoding: RecordEncoding::Legacy,
            strict_transitions: true,
            partition_progress_log_interval: DEFAULT_PARTITION_PROGRESS_LOG_INTERVAL,
            unregister_max_retries: DEFAULT_UNREGISTER_MAX_RETRIES,
            unregister_min_delay: Duration::from_millis(DEFAULT_UNREGISTER_MIN_DELAY_MS),
            unregister_max_delay: Duration::from_millis(DEFAULT_UNREGISTER_MAX_DELAY_MS),
            watch_rearm_max_retries: DEFAULT_WATCH_REARM_MAX_RETRIES,
            watch_rearm_min_delay: Duration::from_millis(DEFAULT_WATCH_REARM_MIN_DELAY_MS),
            watch_rearm_max_delay: Duration::from_millis(DEFAULT_WATCH_REARM_MAX_DELAY_MS),
        }
    }
}

impl SubscriptionConfig {
    /// Validate the configuration and return any errors found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = validate_path(&self.root_path) {
            errors.push(format!("root_path: {}", e));
        }

        if self.partition_progress_log_interval == 0 {
            errors.push("partition_progress_log_interval must be greater than 0".to_string());
        }

        if self.unregister_min_delay > self.unregister_max_delay {
            errors.push(format!(
                "unregister_min_delay ({:?}) must not exceed unregister_max_delay ({:?})",
                self.unregister_min_delay, self.unregister_max_delay
            ));
        }

        if self.watch_rearm_min_delay > self.watch_rearm_max_delay {
            errors.push(format!(
                "watch_rearm_min_delay ({:?}) must not exceed watch_rearm_max_delay ({:?})",
                self.watch_rearm_min_delay, self.watch_rearm_max_delay
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `SUBSCRIPTION_ROOT_PATH`: root node (default `/nakadi`)
    /// - `SUBSCRIPTION_RECORD_ENCODING`: `legacy` or `json` (default `legacy`)
    /// - `SUBSCRIPTION_STRICT_TRANSITIONS`: `true`/`false` (default `true`)
    /// - `SUBSCRIPTION_PROGRESS_LOG_INTERVAL`: partitions between progress lines
    /// - `SUBSCRIPTION_UNREGISTER_MAX_RETRIES`
    /// - `SUBSCRIPTION_UNREGISTER_MIN_DELAY_MS`
    /// - `SUBSCRIPTION_UNREGISTER_MAX_DELAY_MS`
    /// - `SUBSCRIPTION_WATCH_REARM_MAX_RETRIES`
    /// - `SUBSCRIPTION_WATCH_REARM_MIN_DELAY_MS`
    /// - `SUBSCRIPTION_WATCH_REARM_MAX_DELAY_MS`
    ///
    /// Unset variables fall back to the defaults. Malformed values are errors.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Self::default();

        let root_path =
            std::env::var("SUBSCRIPTION_ROOT_PATH").unwrap_or_else(|_| defaults.root_path.clone());
        validate_path(&root_path)
            .map_err(|e| format!("Invalid SUBSCRIPTION_ROOT_PATH: {}", e))?;

        let record_encoding = match std::env::var("SUBSCRIPTION_RECORD_ENCODING") {
            Ok(v) => v
                .parse()
                .map_err(|e| format!("Invalid SUBSCRIPTION_RECORD_ENCODING: {}", e))?,
            Err(_) => defaults.record_encoding,
        };

        let strict_transitions = std::env::var("SUBSCRIPTION_STRICT_TRANSITIONS")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(defaults.strict_transitions);

        let partition_progress_log_interval: usize =
            parse_env("SUBSCRIPTION_PROGRESS_LOG_INTERVAL")?
                .unwrap_or(defaults.partition_progress_log_interval);

        let unregister_max_retries: usize = parse_env("SUBSCRIPTION_UNREGISTER_MAX_RETRIES")?
            .unwrap_or(defaults.unregister_max_retries);

        let unregister_min_delay = parse_env("SUBSCRIPTION_UNREGISTER_MIN_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.unregister_min_delay);

        let unregister_max_delay = parse_env("SUBSCRIPTION_UNREGISTER_MAX_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.unregister_max_delay);

        let watch_rearm_max_retries: usize = parse_env("SUBSCRIPTION_WATCH_REARM_MAX_RETRIES")?
            .unwrap_or(defaults.watch_rearm_max_retries);

        let watch_rearm_min_delay = parse_env("SUBSCRIPTION_WATCH_REARM_MIN_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.watch_rearm_min_delay);

        let watch_rearm_max_delay = parse_env("SUBSCRIPTION_WATCH_REARM_MAX_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.watch_rearm_max_delay);

        Ok(Self {
            root_path,
            record_encoding,
            strict_transitions,
            partition_progress_log_interval,
            unregister_max_retries,
            unregister_min_delay,
            unregister_max_delay,
            watch_rearm_max_retries,
            watch_rearm_min_delay,
            watch_rearm_max_delay,
        })
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map(Some)
            .map_err(|e| format!("Invalid {}: {}", name, e)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SubscriptionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.root_path, "/nakadi");
        assert_eq!(config.record_encoding, RecordEncoding::Legacy);
        assert!(config.strict_transitions);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = SubscriptionConfig {
            root_path: "nakadi/".to_string(),
            partition_progress_log_interval: 0,
            unregister_min_delay: Duration::from_secs(5),
            unregister_max_delay: Duration::from_secs(1),
            watch_rearm_min_delay: Duration::from_secs(3),
            watch_rearm_max_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors[3].contains("watch_rearm_min_delay"));
        assert!(errors[0].contains("root_path"));
    }
}
