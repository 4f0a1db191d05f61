// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::platform::Timing;

///
/// Tunables for a [`crate::SmbusSession`].  Every field has a default that is
/// appropriate for real hardware, so an empty document is a valid
/// configuration.
///
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SmbusConfig {
    /// Busy-poll budget for a single transaction
    #[serde(default = "SmbusConfig::default_timeout_ms")]
    pub timeout_ms: u64,

    /// Time to let an EEPROM write cycle complete before polling
    #[serde(default = "SmbusConfig::default_write_settle_ms")]
    pub write_settle_ms: u64,

    /// How long to wait for the bus lock and the machine-wide I/O mutex
    #[serde(default = "SmbusConfig::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Buses tried, in order, when looking for populated segments
    #[serde(default = "SmbusConfig::default_candidate_buses")]
    pub candidate_buses: Vec<u8>,

    /// Serialize legacy I/O port access with other processes
    #[serde(default = "SmbusConfig::default_cross_process_lock")]
    pub cross_process_lock: bool,

    #[serde(default = "SmbusConfig::default_isa_mutex_name")]
    pub isa_mutex_name: String,
}

impl Default for SmbusConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            write_settle_ms: Self::default_write_settle_ms(),
            lock_timeout_ms: Self::default_lock_timeout_ms(),
            candidate_buses: Self::default_candidate_buses(),
            cross_process_lock: Self::default_cross_process_lock(),
            isa_mutex_name: Self::default_isa_mutex_name(),
        }
    }
}

impl SmbusConfig {
    fn default_timeout_ms() -> u64 {
        1000
    }

    fn default_write_settle_ms() -> u64 {
        10
    }

    fn default_lock_timeout_ms() -> u64 {
        1000
    }

    fn default_candidate_buses() -> Vec<u8> {
        vec![0, 1]
    }

    fn default_cross_process_lock() -> bool {
        true
    }

    fn default_isa_mutex_name() -> String {
        drv_pc_hw_access::ISA_BUS_MUTEX.to_owned()
    }

    /// Parses a configuration from TOML text, validating it.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).context("failed to parse SMBus config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            bail!("timeout-ms must be non-zero");
        }

        if self.lock_timeout_ms == 0 {
            bail!("lock-timeout-ms must be non-zero");
        }

        if self.candidate_buses.is_empty() {
            bail!("candidate-buses must name at least one bus");
        }

        if self.cross_process_lock && self.isa_mutex_name.is_empty() {
            bail!("isa-mutex-name is required with cross-process-lock");
        }

        Ok(())
    }

    pub fn timing(&self) -> Timing {
        Timing {
            timeout: Duration::from_millis(self.timeout_ms),
            write_settle: Duration::from_millis(self.write_settle_ms),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_defaults() {
        let config = SmbusConfig::from_toml("").unwrap();
        assert_eq!(config, SmbusConfig::default());
        assert_eq!(config.timing().timeout, Duration::from_secs(1));
        assert_eq!(config.timing().write_settle, Duration::from_millis(10));
        assert_eq!(config.candidate_buses, vec![0, 1]);
        assert_eq!(config.isa_mutex_name, "Access_ISABUS.HTP.Method");
    }

    #[test]
    fn kebab_case_keys() {
        let config = SmbusConfig::from_toml(
            r#"
            timeout-ms = 50
            write-settle-ms = 0
            candidate-buses = [1]
            cross-process-lock = false
            "#,
        )
        .unwrap();

        assert_eq!(config.timeout_ms, 50);
        assert_eq!(config.write_settle_ms, 0);
        assert_eq!(config.candidate_buses, vec![1]);
        assert!(!config.cross_process_lock);
        assert_eq!(config.lock_timeout_ms, 1000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(SmbusConfig::from_toml("timeout = 5").is_err());
    }

    #[test]
    fn nonsense_values_are_rejected() {
        assert!(SmbusConfig::from_toml("timeout-ms = 0").is_err());
        assert!(SmbusConfig::from_toml("candidate-buses = []").is_err());
    }
}
