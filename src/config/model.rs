use std::time::Duration;

use crate::broker::{EmulatorSpec, RuleSpec, ports::PortRange};

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:10000";

/// Startup configuration. Emulators and rules are replayed through the
/// registry's create operations, so their validation is RPC validation.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: String,
    pub default_emulator_start_deadline: Option<Duration>,
    pub port_ranges: Vec<PortRange>,
    pub emulators: Vec<EmulatorSpec>,
    pub rules: Vec<RuleSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            default_emulator_start_deadline: None,
            port_ranges: Vec::new(),
            emulators: Vec::new(),
            rules: Vec::new(),
        }
    }
}
