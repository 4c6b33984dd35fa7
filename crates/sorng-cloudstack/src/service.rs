//! Service façade for the CloudStack crate.
//!
//! `CloudStackService` owns the API client and polling policy and exposes
//! the reconciliation entry points. Callers hand it an explicit config; it
//! holds no global state.

use crate::api::CloudStackApi;
use crate::client::CloudStackClient;
use crate::config::CloudStackConfig;
use crate::error::CloudStackResult;
use crate::poller::PollPolicy;
use crate::reconciler::{ReconcileOutcome, VmReconciler};
use crate::resolver::{ResourceKind, ResourceResolver};
use crate::types::{DesiredState, VirtualMachine, VmSpec};
use crate::vm::VmManager;

use std::sync::Arc;

/// Top-level handle for reconciling CloudStack VMs.
#[derive(Clone)]
pub struct CloudStackService {
    api: Arc<dyn CloudStackApi>,
    policy: PollPolicy,
}

impl CloudStackService {
    /// Build the HTTP client from `config`.
    pub fn new(config: CloudStackConfig) -> CloudStackResult<Self> {
        let client = CloudStackClient::new(&config)?;
        Ok(Self {
            api: Arc::new(client),
            policy: PollPolicy::from_config(&config),
        })
    }

    /// Load config from the environment / ini files, then build.
    pub fn from_env(region: Option<&str>) -> CloudStackResult<Self> {
        Self::new(CloudStackConfig::load(region)?)
    }

    /// Use an existing API implementation.
    pub fn with_api(api: Arc<dyn CloudStackApi>, policy: PollPolicy) -> Self {
        Self { api, policy }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    // ── Reconciliation ──────────────────────────────────────────────

    /// Drive the VM described by `spec` to `desired`.
    pub async fn reconcile(
        &self,
        desired: DesiredState,
        spec: &VmSpec,
    ) -> CloudStackResult<ReconcileOutcome> {
        VmReconciler::new(self.api.as_ref(), self.policy)
            .reconcile(desired, spec)
            .await
    }

    /// Same decision as [`reconcile`](Self::reconcile) without mutating
    /// anything.
    pub async fn check(
        &self,
        desired: DesiredState,
        spec: &VmSpec,
    ) -> CloudStackResult<ReconcileOutcome> {
        VmReconciler::new(self.api.as_ref(), self.policy)
            .check_only(true)
            .reconcile(desired, spec)
            .await
    }

    // ── Lookups ─────────────────────────────────────────────────────

    pub async fn resolve(&self, kind: ResourceKind, selector: &str) -> CloudStackResult<String> {
        ResourceResolver::new(self.api.as_ref())
            .resolve(kind, selector)
            .await
    }

    pub async fn find_vm(
        &self,
        name: &str,
        project: Option<&str>,
    ) -> CloudStackResult<Option<VirtualMachine>> {
        let project_id = ResourceResolver::new(self.api.as_ref())
            .project_id(project)
            .await?;
        VmManager::new(self.api.as_ref())
            .find_vm(name, project_id.as_deref())
            .await
    }
}
