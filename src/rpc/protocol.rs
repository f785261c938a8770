use serde::{Deserialize, Serialize};

use crate::broker::{EmulatorSpec, EmulatorView, ProxyView, RuleSpec, resolver::ResolveOutcome};

/// One request per connection, newline-terminated JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    CreateEmulator(EmulatorSpec),
    GetEmulator(EmulatorIdRequest),
    ListEmulators,
    DeleteEmulator(EmulatorIdRequest),
    StartEmulator(StartEmulatorRequest),
    ReportEmulatorOnline(ReportEmulatorOnlineRequest),
    StopEmulator(EmulatorIdRequest),
    CreateResolveRule(RuleSpec),
    GetResolveRule(RuleIdRequest),
    UpdateResolveRule(RuleSpec),
    ListResolveRules,
    Resolve(ResolveRequest),
    CreateProxy(CreateProxyRequest),
    GetProxy(EmulatorIdRequest),
    ListProxies,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorIdRequest {
    pub emulator_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleIdRequest {
    pub rule_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartEmulatorRequest {
    pub emulator_id: String,
    /// Caller-side deadline for the start, on top of the broker default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEmulatorOnlineRequest {
    pub emulator_id: String,
    pub resolved_host: String,
    #[serde(default)]
    pub target_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub target: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProxyRequest {
    pub emulator_id: String,
    /// 0 lets the broker pick a port.
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Empty,
    Error(ErrorBody),
    Emulator(EmulatorView),
    Emulators(Vec<EmulatorView>),
    Rule(RuleSpec),
    Rules(Vec<RuleSpec>),
    Resolved(ResolveOutcome),
    Proxy(ProxyView),
    Proxies(Vec<ProxyView>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&crate::broker::error::BrokerError> for ErrorBody {
    fn from(error: &crate::broker::error::BrokerError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}
