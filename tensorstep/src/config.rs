/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runtime configuration. Defaults are always valid; each knob can be
//! overridden through a `TENSORSTEP_`-prefixed environment variable.

use std::env;

/// Tunable knobs for the rendezvous and graph layers.
#[derive(Debug, Clone)]
pub struct Config {
    /// The maximum number of receives a step rendezvous will queue
    /// before initialization. Overflow fails the receive rather than
    /// growing without bound.
    ///
    /// Override: `TENSORSTEP_DEFERRED_LIMIT`.
    pub deferred_limit: usize,

    /// The prefix of generated graph handles.
    ///
    /// Override: `TENSORSTEP_HANDLE_PREFIX`.
    pub handle_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            deferred_limit: 4096,
            handle_prefix: "g".to_string(),
        }
    }
}

impl Config {
    /// The default configuration with environment overrides applied.
    /// Unparseable overrides are ignored with a warning rather than
    /// failing startup.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = env::var("TENSORSTEP_DEFERRED_LIMIT") {
            match raw.parse() {
                Ok(limit) => config.deferred_limit = limit,
                Err(_) => tracing::warn!(
                    name = "config_invalid_override",
                    value = raw.as_str(),
                    "ignoring invalid TENSORSTEP_DEFERRED_LIMIT"
                ),
            }
        }
        if let Ok(prefix) = env::var("TENSORSTEP_HANDLE_PREFIX") {
            config.handle_prefix = prefix;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.deferred_limit > 0);
        assert!(!config.handle_prefix.is_empty());
    }
}
