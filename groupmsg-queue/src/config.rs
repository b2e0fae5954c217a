use std::time::Duration;

use groupmsg_core::envs::{
    GM_QUEUE_APPLY_EMBEDDED_CHANGES_ENV, GM_QUEUE_BATCH_SIZE_ENV, GM_QUEUE_BATCH_SPACING_MS_ENV,
    GM_QUEUE_ENABLED_ENV, GM_QUEUE_RETRY_BASE_DELAY_MS_ENV, parse_env_var,
};
use serde::{Deserialize, Serialize};

/// Tunables of the incoming group message queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Accept and drain jobs at all
    pub enabled: bool,
    /// Try a group change carried by the message before asking the service
    pub apply_embedded_changes: bool,
    pub batch_size: usize,
    /// Batch size while the host runs in the background
    pub background_batch_size: usize,
    /// Pause between two consecutive batches of one drain
    pub batch_spacing: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            apply_embedded_changes: true,
            batch_size: 32,
            background_batch_size: 1,
            batch_spacing: Duration::from_millis(500),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(10 * 60),
        }
    }
}

impl QueueConfig {
    /// Defaults, overridden by whatever `GM_QUEUE_*` variables are set
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(enabled) = parse_env_var(GM_QUEUE_ENABLED_ENV)? {
            config.enabled = enabled;
        }
        if let Some(apply) = parse_env_var(GM_QUEUE_APPLY_EMBEDDED_CHANGES_ENV)? {
            config.apply_embedded_changes = apply;
        }
        if let Some(batch_size) = parse_env_var(GM_QUEUE_BATCH_SIZE_ENV)? {
            config.batch_size = batch_size;
        }
        if let Some(ms) = parse_env_var(GM_QUEUE_BATCH_SPACING_MS_ENV)? {
            config.batch_spacing = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env_var(GM_QUEUE_RETRY_BASE_DELAY_MS_ENV)? {
            config.retry_base_delay = Duration::from_millis(ms);
        }

        anyhow::ensure!(config.batch_size > 0, "{GM_QUEUE_BATCH_SIZE_ENV} must not be 0");
        anyhow::ensure!(
            !config.retry_base_delay.is_zero(),
            "{GM_QUEUE_RETRY_BASE_DELAY_MS_ENV} must not be 0"
        );
        Ok(config)
    }

    /// Batches never go below one job, whatever was configured
    pub(crate) fn batch_size_for(&self, in_background: bool) -> usize {
        let size = if in_background {
            self.background_batch_size
        } else {
            self.batch_size
        };
        size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_uses_smaller_batches() {
        let config = QueueConfig::default();
        assert_eq!(config.batch_size_for(false), 32);
        assert_eq!(config.batch_size_for(true), 1);

        let config = QueueConfig {
            background_batch_size: 0,
            ..QueueConfig::default()
        };
        assert_eq!(config.batch_size_for(true), 1);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = QueueConfig {
            apply_embedded_changes: false,
            batch_spacing: Duration::from_millis(5),
            ..QueueConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<QueueConfig>(&json).unwrap(), config);
    }

    #[test]
    fn env_overrides_defaults() {
        // SAFETY: no other test in this crate reads or writes these variables
        unsafe {
            std::env::set_var(GM_QUEUE_BATCH_SIZE_ENV, "8");
            std::env::set_var(GM_QUEUE_BATCH_SPACING_MS_ENV, " 250 ");
            std::env::set_var(GM_QUEUE_ENABLED_ENV, "false");
        }
        let config = QueueConfig::from_env().unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.batch_spacing, Duration::from_millis(250));
        assert!(!config.enabled);
        assert_eq!(config.retry_max_delay, QueueConfig::default().retry_max_delay);

        unsafe {
            std::env::set_var(GM_QUEUE_BATCH_SIZE_ENV, "0");
        }
        assert!(QueueConfig::from_env().is_err());

        unsafe {
            std::env::set_var(GM_QUEUE_BATCH_SIZE_ENV, "many");
        }
        let err = QueueConfig::from_env().unwrap_err();
        assert!(format!("{err:#}").contains(GM_QUEUE_BATCH_SIZE_ENV));

        unsafe {
            std::env::remove_var(GM_QUEUE_BATCH_SIZE_ENV);
            std::env::set_var(GM_QUEUE_RETRY_BASE_DELAY_MS_ENV, "0");
        }
        let err = QueueConfig::from_env().unwrap_err();
        assert!(format!("{err:#}").contains(GM_QUEUE_RETRY_BASE_DELAY_MS_ENV));

        unsafe {
            std::env::set_var(GM_QUEUE_RETRY_BASE_DELAY_MS_ENV, "20");
        }
        assert_eq!(
            QueueConfig::from_env().unwrap().retry_base_delay,
            Duration::from_millis(20)
        );

        unsafe {
            std::env::remove_var(GM_QUEUE_RETRY_BASE_DELAY_MS_ENV);
            std::env::remove_var(GM_QUEUE_BATCH_SPACING_MS_ENV);
            std::env::remove_var(GM_QUEUE_ENABLED_ENV);
        }
    }
}
