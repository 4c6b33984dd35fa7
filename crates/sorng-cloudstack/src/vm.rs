//! Virtual machine commands.
//!
//! Thin typed wrappers over the `*VirtualMachine` API calls. Mutating
//! methods return the submitted response (usually carrying a `jobid`) for
//! the poller to follow up on.

use crate::api::{error_text, ApiParams, CloudStackApi, Command, ParamsBuilder};
use crate::error::{CloudStackError, CloudStackResult};
use crate::types::VirtualMachine;

use serde_json::Value;

/// VM operations backed by a `CloudStackApi`.
pub struct VmManager<'a> {
    api: &'a dyn CloudStackApi,
}

impl<'a> VmManager<'a> {
    pub fn new(api: &'a dyn CloudStackApi) -> Self {
        Self { api }
    }

    // ── List / Find ─────────────────────────────────────────────────

    /// List VMs, optionally scoped to a project.
    pub async fn list_vms(
        &self,
        project_id: Option<&str>,
    ) -> CloudStackResult<Vec<VirtualMachine>> {
        let params = ParamsBuilder::new().opt("projectid", project_id).build();
        self.query(params).await
    }

    /// Re-read a single VM by id; `None` once it no longer exists.
    pub async fn get_vm(
        &self,
        id: &str,
        project_id: Option<&str>,
    ) -> CloudStackResult<Option<VirtualMachine>> {
        let params = ParamsBuilder::new()
            .set("id", id)
            .opt("projectid", project_id)
            .build();
        let vms = self.query(params).await?;
        Ok(vms.into_iter().find(|vm| vm.id == id))
    }

    async fn query(&self, params: ApiParams) -> CloudStackResult<Vec<VirtualMachine>> {
        let resp = self.api.execute(Command::ListVirtualMachines, params).await?;
        match resp.get("virtualmachine") {
            Some(list) => Ok(serde_json::from_value(list.clone())?),
            None => Ok(Vec::new()),
        }
    }

    /// The one VM named `selector` (by name, display name or id).
    ///
    /// More than one distinct match is an error rather than a guess.
    pub async fn find_vm(
        &self,
        selector: &str,
        project_id: Option<&str>,
    ) -> CloudStackResult<Option<VirtualMachine>> {
        let mut found: Vec<VirtualMachine> = Vec::new();
        for vm in self.list_vms(project_id).await? {
            if vm.matches(selector) && !found.iter().any(|f| f.id == vm.id) {
                found.push(vm);
            }
        }

        if found.len() > 1 {
            let ids: Vec<&str> = found.iter().map(|v| v.id.as_str()).collect();
            return Err(CloudStackError::invalid_spec(format!(
                "Virtual machine '{}' is ambiguous: {} matches ({})",
                selector,
                found.len(),
                ids.join(", ")
            )));
        }
        Ok(found.pop())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub async fn deploy(&self, params: ApiParams) -> CloudStackResult<Value> {
        self.submit(Command::DeployVirtualMachine, params).await
    }

    pub async fn start(&self, id: &str) -> CloudStackResult<Value> {
        self.submit(Command::StartVirtualMachine, by_id(id)).await
    }

    pub async fn stop(&self, id: &str) -> CloudStackResult<Value> {
        self.submit(Command::StopVirtualMachine, by_id(id)).await
    }

    pub async fn reboot(&self, id: &str) -> CloudStackResult<Value> {
        self.submit(Command::RebootVirtualMachine, by_id(id)).await
    }

    /// Destroy; with `expunge` the VM is not recoverable afterwards.
    pub async fn destroy(&self, id: &str, expunge: bool) -> CloudStackResult<Value> {
        let params = ParamsBuilder::new()
            .set("id", id)
            .opt("expunge", expunge.then_some("true"))
            .build();
        self.submit(Command::DestroyVirtualMachine, params).await
    }

    /// Expunge an already destroyed VM.
    pub async fn expunge(&self, id: &str) -> CloudStackResult<Value> {
        self.submit(Command::ExpungeVirtualMachine, by_id(id)).await
    }

    pub async fn scale(&self, id: &str, service_offering_id: &str) -> CloudStackResult<Value> {
        let params = ParamsBuilder::new()
            .set("id", id)
            .set("serviceofferingid", service_offering_id)
            .build();
        self.submit(Command::ScaleVirtualMachine, params).await
    }

    async fn submit(&self, command: Command, params: ApiParams) -> CloudStackResult<Value> {
        let resp = self.api.execute(command, params).await?;
        if let Some(text) = error_text(&resp) {
            log::warn!("{command} rejected: {text}");
            return Err(CloudStackError::operation_failed(text));
        }
        Ok(resp)
    }
}

fn by_id(id: &str) -> ApiParams {
    ParamsBuilder::new().set("id", id).build()
}

/// Read a VM snapshot out of a response, if it carries one.
///
/// Job results for expunge and scale may hold no VM at all; those yield
/// `None` and the caller re-reads the VM with [`VmManager::get_vm`].
pub fn snapshot(value: &Value) -> Option<VirtualMachine> {
    if value.get("id").is_none() || value.get("state").is_none() {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}
