//! Module `config` implement configuration types for the filter manager.

use serde::{Deserialize, Serialize};

use std::ffi;

use crate::{err_at, Error, Result};

/// Default capacity for filters created without an explicit capacity.
pub const DEFAULT_CAPACITY: u64 = 100_000;

/// Default false-positive probability for new filters.
pub const DEFAULT_FPP: f64 = 0.0001;

/// Configuration type for [FilterMgr][crate::FilterMgr] instances.
///
/// Holds the data directory scanned at startup and the defaults applied
/// to filters created without per-filter overrides.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) dir: ffi::OsString,
    pub(crate) filter: FilterConfig,
}

impl Config {
    /// Create a new configuration rooted at data directory `dir`.
    pub fn new<D>(dir: D) -> Config
    where
        D: AsRef<ffi::OsStr>,
    {
        Config {
            dir: dir.as_ref().to_os_string(),
            filter: FilterConfig::default(),
        }
    }

    /// Set defaults for filters created without explicit configuration.
    pub fn set_filter_defaults(&mut self, filter: FilterConfig) -> &mut Self {
        self.filter = filter;
        self
    }

    /// Return the configured data directory.
    pub fn to_dir(&self) -> ffi::OsString {
        self.dir.clone()
    }
}

/// Per-filter configuration.
///
/// Values are persisted along with the filter, so that a filter re-opened
/// after restart keeps the parameters it was created with, whether they
/// came from the manager defaults or from per-filter overrides.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterConfig {
    capacity: u64,
    fpp: f64,
    in_memory: bool,
}

impl Default for FilterConfig {
    fn default() -> FilterConfig {
        FilterConfig {
            capacity: DEFAULT_CAPACITY,
            fpp: DEFAULT_FPP,
            in_memory: false,
        }
    }
}

impl FilterConfig {
    /// Set the number of keys the filter is expected to hold. Going
    /// beyond capacity does not fail, only dilutes the false-positive
    /// guarantee.
    pub fn set_capacity(&mut self, capacity: u64) -> &mut Self {
        self.capacity = capacity;
        self
    }

    /// Set the target false-positive probability, must be within (0.0, 1.0).
    pub fn set_fpp(&mut self, fpp: f64) -> &mut Self {
        self.fpp = fpp;
        self
    }

    /// Keep the filter purely in memory, nothing shall be persisted and
    /// unmapping it is a no-op.
    pub fn set_in_memory(&mut self, in_memory: bool) -> &mut Self {
        self.in_memory = in_memory;
        self
    }

    /// Return the configured capacity.
    pub fn to_capacity(&self) -> u64 {
        self.capacity
    }

    /// Return the configured false-positive probability.
    pub fn to_fpp(&self) -> f64 {
        self.fpp
    }

    /// Return whether the filter lives purely in memory.
    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return err_at!(InvalidInput, msg: "filter capacity must be non-zero");
        }
        if self.fpp <= 0.0 || self.fpp >= 1.0 {
            return err_at!(InvalidInput, msg: "false-positive rate {} out of range", self.fpp);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
