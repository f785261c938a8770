use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    pub listen_address: Option<String>,
    pub default_emulator_start_deadline_seconds: Option<u64>,
    #[serde(default, rename = "port_range")]
    pub port_ranges: Vec<RawPortRange>,
    #[serde(default, rename = "emulator")]
    pub emulators: Vec<RawEmulator>,
    #[serde(default, rename = "rule")]
    pub rules: Vec<RawRule>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawPortRange {
    pub begin: Option<u16>,
    pub end: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawEmulator {
    pub emulator_id: Option<String>,
    pub rule_id: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub start_on_demand: bool,
    #[serde(default)]
    pub target_patterns: Vec<String>,
    #[serde(default)]
    pub resolved_host: Option<String>,
    #[serde(default)]
    pub requires_secure_connection: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawRule {
    pub rule_id: Option<String>,
    #[serde(default)]
    pub target_patterns: Vec<String>,
    pub resolved_host: Option<String>,
    #[serde(default)]
    pub requires_secure_connection: bool,
}
