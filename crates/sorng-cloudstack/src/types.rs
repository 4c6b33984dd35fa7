//! Shared types for CloudStack VM management.

use crate::api::Command;
use crate::error::CloudStackError;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  VM lifecycle state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle state as reported by the provider.
///
/// Matching is case-insensitive; anything outside the known set (e.g.
/// `Migrating`) is kept verbatim in `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Expunging,
    Destroying,
    Destroyed,
    Error,
    Unknown(String),
}

impl Default for VmState {
    fn default() -> Self {
        Self::Unknown(String::new())
    }
}

impl VmState {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "starting" => Self::Starting,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "expunging" => Self::Expunging,
            "destroying" => Self::Destroying,
            "destroyed" => Self::Destroyed,
            "error" => Self::Error,
            _ => Self::Unknown(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Expunging => "Expunging",
            Self::Destroying => "Destroying",
            Self::Destroyed => "Destroyed",
            Self::Error => "Error",
            Self::Unknown(s) => s,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for VmState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for VmState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Virtual machine snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Network interface attached to a VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Nic {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "networkid")]
    pub network_id: Option<String>,
    #[serde(default, rename = "networkname")]
    pub network_name: Option<String>,
    #[serde(default, rename = "ipaddress")]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub netmask: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default, rename = "macaddress")]
    pub mac_address: Option<String>,
    #[serde(default, rename = "isdefault")]
    pub is_default: bool,
}

/// Key/value resource tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceTag {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// VM as returned by `listVirtualMachines` and async job results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VirtualMachine {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "displayname")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub state: VmState,
    #[serde(default, rename = "serviceofferingid")]
    pub service_offering_id: Option<String>,
    #[serde(default, rename = "serviceofferingname")]
    pub service_offering_name: Option<String>,
    #[serde(default, rename = "zoneid")]
    pub zone_id: Option<String>,
    #[serde(default, rename = "zonename")]
    pub zone_name: Option<String>,
    #[serde(default, rename = "templateid")]
    pub template_id: Option<String>,
    #[serde(default, rename = "templatename")]
    pub template_name: Option<String>,
    #[serde(default, rename = "isoid")]
    pub iso_id: Option<String>,
    #[serde(default, rename = "isoname")]
    pub iso_name: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
    /// Only present right after deployment from a password-enabled template.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, rename = "projectid")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub hypervisor: Option<String>,
    #[serde(default)]
    pub tags: Vec<ResourceTag>,
    #[serde(default, rename = "nic")]
    pub nics: Vec<Nic>,
}

impl VirtualMachine {
    /// The NIC flagged as default, if any.
    pub fn default_nic(&self) -> Option<&Nic> {
        self.nics.iter().find(|n| n.is_default)
    }

    /// Tags as an order-independent map.
    pub fn tag_map(&self) -> BTreeMap<String, String> {
        self.tags
            .iter()
            .map(|t| (t.key.clone(), t.value.clone()))
            .collect()
    }

    /// Whether `selector` names this VM by name, display name or id.
    pub fn matches(&self, selector: &str) -> bool {
        self.name == selector
            || self.id == selector
            || self.display_name.as_deref() == Some(selector)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Async jobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle for a submitted async operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncJob {
    pub id: String,
    /// The command that created the job.
    pub operation: Command,
}

/// Provider job status (`jobstatus` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Pending,
            1 => Self::Succeeded,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Desired state / spec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Target lifecycle condition requested by the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    /// Exists, not necessarily running.
    #[default]
    #[serde(alias = "present")]
    Created,
    #[serde(alias = "started", alias = "booted")]
    Running,
    #[serde(alias = "halted")]
    Stopped,
    #[serde(alias = "rebooted")]
    Restarted,
    /// Destroyed but recoverable.
    #[serde(alias = "destroyed")]
    Absent,
    /// Irrecoverably destroyed.
    Expunged,
}

impl FromStr for DesiredState {
    type Err = CloudStackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" | "present" => Ok(Self::Created),
            "running" | "started" | "booted" => Ok(Self::Running),
            "stopped" | "halted" => Ok(Self::Stopped),
            "restarted" | "rebooted" => Ok(Self::Restarted),
            "absent" | "destroyed" => Ok(Self::Absent),
            "expunged" => Ok(Self::Expunged),
            other => Err(CloudStackError::invalid_spec(format!(
                "Unknown desired state '{other}'"
            ))),
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Restarted => "restarted",
            Self::Absent => "absent",
            Self::Expunged => "expunged",
        };
        f.write_str(s)
    }
}

fn default_true() -> bool {
    true
}

/// Declared VM: identity, configuration and creation-time inputs.
///
/// Provisioning inputs (template/ISO, disk, hypervisor, key, groups, user
/// data) only matter when the VM gets deployed; they are never re-applied
/// to an existing VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    /// Name or id; deploys fall back to the first offering when unset.
    #[serde(default)]
    pub service_offering: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub iso: Option<String>,
    #[serde(default)]
    pub hypervisor: Option<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub disk_offering: Option<String>,
    /// GB; needed when deploying from an ISO.
    #[serde(default)]
    pub disk_size: Option<u64>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub affinity_groups: Vec<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub ssh_key: Option<String>,
    #[serde(default)]
    pub user_data: Option<Vec<u8>>,
    /// Wait for async jobs to finish.
    #[serde(default = "default_true")]
    pub poll_async: bool,
}

impl VmSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: None,
            group: None,
            service_offering: None,
            template: None,
            iso: None,
            hypervisor: None,
            networks: Vec::new(),
            disk_offering: None,
            disk_size: None,
            security_groups: Vec::new(),
            affinity_groups: Vec::new(),
            project: None,
            zone: None,
            ssh_key: None,
            user_data: None,
            poll_async: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Result projection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Caller-facing view of the managed VM after reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmReport {
    pub id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub group: Option<String>,
    pub password: Option<String>,
    pub service_offering: Option<String>,
    pub zone: Option<String>,
    pub template: Option<String>,
    pub iso: Option<String>,
    pub created: Option<String>,
    pub vm_state: String,
    pub tags: BTreeMap<String, String>,
    pub nic: Vec<Nic>,
    pub default_ip: Option<String>,
}

impl From<&VirtualMachine> for VmReport {
    fn from(vm: &VirtualMachine) -> Self {
        Self {
            id: vm.id.clone(),
            name: vm.name.clone(),
            display_name: vm.display_name.clone(),
            group: vm.group.clone(),
            password: vm.password.clone(),
            service_offering: vm.service_offering_name.clone(),
            zone: vm.zone_name.clone(),
            template: vm.template_name.clone(),
            iso: vm.iso_name.clone(),
            created: vm.created.clone(),
            vm_state: vm.state.to_string(),
            tags: vm.tag_map(),
            nic: vm.nics.clone(),
            default_ip: vm.default_nic().and_then(|n| n.ip_address.clone()),
        }
    }
}
