//! Configuration for the booking engine

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest accepted payment window (30 days)
pub const MAX_PAYMENT_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pending-booking expiry
    pub expiry: ExpiryConfig,

    /// Session provisioning
    pub provisioning: ProvisioningConfig,

    /// Notification fan-out
    pub notifications: NotificationConfig,
}

/// Expiry sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    /// How long a pending booking waits for a payment outcome (seconds)
    pub payment_window_secs: u64,

    /// Sweep period (seconds)
    pub sweep_interval_secs: u64,

    /// Run the background sweeper
    pub enabled: bool,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            payment_window_secs: 900, // 15 minutes
            sweep_interval_secs: 30,
            enabled: true,
        }
    }
}

impl ExpiryConfig {
    /// Payment window as a chrono duration, capped at [`MAX_PAYMENT_WINDOW_SECS`]
    pub fn payment_window(&self) -> chrono::Duration {
        let secs = self.payment_window_secs.min(MAX_PAYMENT_WINDOW_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    /// Sweep period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Provisioning retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Per-attempt timeout (milliseconds)
    pub timeout_ms: u64,

    /// Max attempts for retryable failures
    pub max_attempts: u32,

    /// Initial retry delay (milliseconds)
    pub initial_backoff_ms: u64,

    /// Max retry delay (milliseconds)
    pub max_backoff_ms: u64,

    /// Start provisioning in the background as soon as a payment completes
    pub provision_on_payment: bool,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            provision_on_payment: true,
        }
    }
}

impl ProvisioningConfig {
    /// Per-attempt timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Initial retry delay
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Max retry delay
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Notification dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Number of delivery partitions (one worker each)
    pub partitions: u32,

    /// Bounded queue size per partition
    pub queue_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            partitions: 8,
            queue_capacity: 1024,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Some(secs) = env_number("BOOKING_PAYMENT_WINDOW_SECS")? {
            config.expiry.payment_window_secs = secs;
        }

        if let Some(secs) = env_number("BOOKING_SWEEP_INTERVAL_SECS")? {
            config.expiry.sweep_interval_secs = secs;
        }

        if let Ok(enabled) = std::env::var("BOOKING_SWEEPER_ENABLED") {
            config.expiry.enabled = enabled != "false" && enabled != "0";
        }

        if let Some(ms) = env_number("BOOKING_PROVISION_TIMEOUT_MS")? {
            config.provisioning.timeout_ms = ms;
        }

        if let Some(attempts) = env_number("BOOKING_PROVISION_MAX_ATTEMPTS")? {
            config.provisioning.max_attempts = to_u32("BOOKING_PROVISION_MAX_ATTEMPTS", attempts)?;
        }

        if let Ok(enabled) = std::env::var("BOOKING_PROVISION_ON_PAYMENT") {
            config.provisioning.provision_on_payment = enabled != "false" && enabled != "0";
        }

        if let Some(partitions) = env_number("BOOKING_NOTIFY_PARTITIONS")? {
            config.notifications.partitions = to_u32("BOOKING_NOTIFY_PARTITIONS", partitions)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.expiry.payment_window_secs == 0 {
            return Err(crate::Error::Config(
                "expiry.payment_window_secs must be > 0".to_string(),
            ));
        }
        if self.expiry.payment_window_secs > MAX_PAYMENT_WINDOW_SECS {
            return Err(crate::Error::Config(format!(
                "expiry.payment_window_secs must be <= {}",
                MAX_PAYMENT_WINDOW_SECS
            )));
        }
        if self.expiry.sweep_interval_secs == 0 {
            return Err(crate::Error::Config(
                "expiry.sweep_interval_secs must be > 0".to_string(),
            ));
        }
        if self.provisioning.max_attempts == 0 {
            return Err(crate::Error::Config(
                "provisioning.max_attempts must be > 0".to_string(),
            ));
        }
        if self.notifications.partitions == 0 || self.notifications.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "notifications.partitions and queue_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_number(key: &str) -> crate::Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|e| crate::Error::Config(format!("Invalid {}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

fn to_u32(key: &str, value: u64) -> crate::Result<u32> {
    u32::try_from(value)
        .map_err(|_| crate::Error::Config(format!("Invalid {}: {} is out of range", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.expiry.payment_window_secs, 900);
        assert_eq!(config.provisioning.max_attempts, 4);
        assert_eq!(config.notifications.partitions, 8);
        assert!(config.expiry.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[expiry]\npayment_window_secs = 60\n\n[notifications]\npartitions = 2"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.expiry.payment_window_secs, 60);
        assert_eq!(config.expiry.sweep_interval_secs, 30);
        assert_eq!(config.notifications.partitions, 2);
        assert_eq!(config.notifications.queue_capacity, 1024);
    }

    #[test]
    fn test_validate_rejects_zero_partitions() {
        let mut config = Config::default();
        config.notifications.partitions = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_payment_window() {
        let mut config = Config::default();
        config.expiry.payment_window_secs = 10_000_000_000_000;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        // Unvalidated values are capped instead of overflowing
        assert_eq!(
            config.expiry.payment_window(),
            chrono::Duration::seconds(MAX_PAYMENT_WINDOW_SECS as i64)
        );
        let cutoff = chrono::Utc::now() - config.expiry.payment_window();
        assert!(cutoff < chrono::Utc::now());

        config.expiry.payment_window_secs = MAX_PAYMENT_WINDOW_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oversized_counts_are_rejected_not_truncated() {
        assert_eq!(to_u32("BOOKING_NOTIFY_PARTITIONS", 16).unwrap(), 16);
        assert!(matches!(
            to_u32("BOOKING_PROVISION_MAX_ATTEMPTS", 4_294_967_297),
            Err(crate::Error::Config(_))
        ));
    }
}
