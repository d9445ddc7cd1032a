//! Configuration for the record store
//!
//! Provides presets for the common deployment shapes (single process,
//! multi-process shared file, throwaway scratch stores) and a validator.

use std::time::Duration;

/// Default number of hash chains
pub const DEFAULT_HASH_SIZE: usize = 131;

/// Record store configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of hash chains keys are spread over for locking
    pub hash_size: usize,
    /// Lock acquisition deadline. `None` blocks indefinitely.
    pub lock_timeout: Option<Duration>,
    /// Durably sync the store file after every committed batch
    pub sync_on_commit: bool,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
}

impl Config {
    /// Multi-process preset: bounded lock waits, so a wedged peer surfaces
    /// as `LockTimeout` instead of a hang
    pub fn shared() -> Self {
        Self {
            lock_timeout: Some(Duration::from_secs(5)),
            ..Self::default()
        }
    }

    /// Scratch preset: no fsync. A crash may lose recent batches, never tear one.
    pub fn ephemeral() -> Self {
        Self {
            sync_on_commit: false,
            ..Self::default()
        }
    }

    /// Builder-style override of the lock timeout
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.hash_size == 0 || self.hash_size > 1 << 20 {
            return Err("hash_size must be in [1, 1048576]".into());
        }
        if let Some(timeout) = self.lock_timeout {
            if timeout.is_zero() {
                return Err("lock_timeout must be > 0 (use None to block)".into());
            }
        }
        if self.max_key_size == 0 || self.max_key_size > u16::MAX as usize {
            return Err("max_key_size must be in [1, 65535]".into());
        }
        if self.max_value_size == 0 || self.max_value_size > 256 * 1024 * 1024 {
            return Err("max_value_size must be in [1, 256MB]".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hash_size: DEFAULT_HASH_SIZE,
            lock_timeout: None,
            sync_on_commit: true,
            max_key_size: 1024,
            max_value_size: 16 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::shared().validate().is_ok());
        assert!(Config::ephemeral().validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = Config::default().with_lock_timeout(Some(Duration::ZERO));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hash_size_bounds() {
        let mut config = Config::default();
        config.hash_size = 0;
        assert!(config.validate().is_err());
        config.hash_size = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        assert_eq!(Config::shared().lock_timeout, Some(Duration::from_secs(5)));
        assert!(Config::shared().sync_on_commit);
        assert!(!Config::ephemeral().sync_on_commit);
        assert!(Config::default().lock_timeout.is_none());
    }
}
