//! The API client seam.
//!
//! Everything above this module talks to CloudStack through
//! [`CloudStackApi`], one call per logical [`Command`]. The real
//! implementation is [`crate::client::CloudStackClient`]; tests plug in an
//! in-memory fake.

use crate::error::CloudStackResult;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Named request parameters.
pub type ApiParams = BTreeMap<String, String>;

/// The CloudStack API commands this crate issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    ListProjects,
    ListZones,
    ListTemplates,
    ListIsos,
    ListServiceOfferings,
    ListDiskOfferings,
    ListHypervisors,
    ListNetworks,
    ListVirtualMachines,
    DeployVirtualMachine,
    StartVirtualMachine,
    StopVirtualMachine,
    RebootVirtualMachine,
    DestroyVirtualMachine,
    ExpungeVirtualMachine,
    ScaleVirtualMachine,
    QueryAsyncJobResult,
}

impl Command {
    /// Wire name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListProjects => "listProjects",
            Self::ListZones => "listZones",
            Self::ListTemplates => "listTemplates",
            Self::ListIsos => "listIsos",
            Self::ListServiceOfferings => "listServiceOfferings",
            Self::ListDiskOfferings => "listDiskOfferings",
            Self::ListHypervisors => "listHypervisors",
            Self::ListNetworks => "listNetworks",
            Self::ListVirtualMachines => "listVirtualMachines",
            Self::DeployVirtualMachine => "deployVirtualMachine",
            Self::StartVirtualMachine => "startVirtualMachine",
            Self::StopVirtualMachine => "stopVirtualMachine",
            Self::RebootVirtualMachine => "rebootVirtualMachine",
            Self::DestroyVirtualMachine => "destroyVirtualMachine",
            Self::ExpungeVirtualMachine => "expungeVirtualMachine",
            Self::ScaleVirtualMachine => "scaleVirtualMachine",
            Self::QueryAsyncJobResult => "queryAsyncJobResult",
        }
    }

    /// Whether the command changes provider state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::DeployVirtualMachine
                | Self::StartVirtualMachine
                | Self::StopVirtualMachine
                | Self::RebootVirtualMachine
                | Self::DestroyVirtualMachine
                | Self::ExpungeVirtualMachine
                | Self::ScaleVirtualMachine
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request/response interface to a CloudStack management server.
///
/// Implementations return the command's response object with the
/// `<command>response` envelope already removed. Provider-side failures
/// (HTTP error bodies carrying `errortext`) must come back as
/// `OperationFailed`; an in-band `errortext` on a successful response is
/// left for the caller to inspect.
#[async_trait]
pub trait CloudStackApi: Send + Sync {
    async fn execute(&self, command: Command, params: ApiParams) -> CloudStackResult<Value>;
}

/// Small builder for [`ApiParams`] that skips empty optionals.
#[derive(Debug, Default, Clone)]
pub struct ParamsBuilder {
    params: ApiParams,
}

impl ParamsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always set, even when `value` is empty.
    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Set only when `value` is `Some`.
    pub fn opt(mut self, key: &str, value: Option<impl Into<String>>) -> Self {
        if let Some(v) = value {
            self.params.insert(key.to_string(), v.into());
        }
        self
    }

    pub fn build(self) -> ApiParams {
        self.params
    }
}

/// Extract the in-band `errortext` of a response, if any.
pub fn error_text(response: &Value) -> Option<&str> {
    response.get("errortext").and_then(Value::as_str)
}
