//! Desired-state reconciliation for a single VM.
//!
//! [`plan`] maps (desired state, observed VM) to one [`Transition`];
//! [`VmReconciler`] looks the VM up, plans, and carries the transition out,
//! awaiting every async job it submits. Nothing is cached between runs: the
//! provider is re-queried each time.

use crate::api::{ApiParams, CloudStackApi, Command, ParamsBuilder};
use crate::error::{CloudStackError, CloudStackErrorKind, CloudStackResult};
use crate::poller::{job_of, AsyncJobPoller, PollPolicy};
use crate::resolver::{group_names, ImageSelector, ResourceResolver};
use crate::types::{DesiredState, VirtualMachine, VmReport, VmSpec, VmState};
use crate::vm::{self, VmManager};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use std::fmt;

/// Job result field holding the VM snapshot.
const VM_RESULT_KEY: &str = "virtualmachine";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transition table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The operation(s) needed to move a VM toward its desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Deploy,
    /// Change the offering; a running VM is stopped first and started again.
    Scale { offering_id: String, was_running: bool },
    Start,
    Stop,
    Reboot,
    Destroy,
    /// Expunge a VM that is already destroyed.
    Expunge,
    DestroyAndExpunge,
    Noop,
}

impl Transition {
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Noop)
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deploy => f.write_str("deploy"),
            Self::Scale { offering_id, .. } => write!(f, "scale to {offering_id}"),
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
            Self::Reboot => f.write_str("reboot"),
            Self::Destroy => f.write_str("destroy"),
            Self::Expunge => f.write_str("expunge"),
            Self::DestroyAndExpunge => f.write_str("destroy and expunge"),
            Self::Noop => f.write_str("no-op"),
        }
    }
}

/// Pick the transition for `desired` given the observed VM.
///
/// `target_offering` is the resolved service offering id to converge on;
/// `None` leaves the offering alone.
pub fn plan(
    desired: DesiredState,
    name: &str,
    observed: Option<&VirtualMachine>,
    target_offering: Option<&str>,
) -> CloudStackResult<Transition> {
    use VmState::*;

    let Some(vm) = observed else {
        return match desired {
            DesiredState::Created => Ok(Transition::Deploy),
            DesiredState::Absent | DesiredState::Expunged => Ok(Transition::Noop),
            DesiredState::Running | DesiredState::Stopped | DesiredState::Restarted => {
                Err(CloudStackError::new(
                    CloudStackErrorKind::NotFound,
                    format!("Virtual machine named '{name}' not found"),
                ))
            }
        };
    };

    let transition = match desired {
        DesiredState::Created => match target_offering {
            Some(target) if vm.service_offering_id.as_deref() != Some(target) => {
                Transition::Scale {
                    offering_id: target.to_string(),
                    was_running: vm.state == Running,
                }
            }
            _ => Transition::Noop,
        },
        DesiredState::Running => match vm.state {
            Stopped | Stopping => Transition::Start,
            _ => Transition::Noop,
        },
        DesiredState::Stopped => match vm.state {
            Running | Starting => Transition::Stop,
            _ => Transition::Noop,
        },
        DesiredState::Restarted => match vm.state {
            Running | Starting => Transition::Reboot,
            Stopping | Stopped => {
                return Err(CloudStackError::invalid_transition(format!(
                    "Virtual machine named '{name}' not running, not restarted"
                )))
            }
            _ => Transition::Noop,
        },
        DesiredState::Absent => match vm.state {
            Expunging | Destroying | Destroyed => Transition::Noop,
            _ => Transition::Destroy,
        },
        DesiredState::Expunged => match vm.state {
            Destroying | Destroyed => Transition::Expunge,
            Expunging => Transition::Noop,
            _ => Transition::DestroyAndExpunge,
        },
    };
    Ok(transition)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReconcileOutcome {
    /// Whether anything was (or, in check mode, would be) changed.
    pub changed: bool,
    /// Last observed snapshot; `None` when no VM exists.
    pub vm: Option<VirtualMachine>,
    /// Job still running when polling was switched off.
    pub pending_job: Option<String>,
}

impl ReconcileOutcome {
    pub fn report(&self) -> Option<VmReport> {
        self.vm.as_ref().map(VmReport::from)
    }
}

/// Drives one VM to its desired state.
pub struct VmReconciler<'a> {
    api: &'a dyn CloudStackApi,
    policy: PollPolicy,
    check_only: bool,
}

impl<'a> VmReconciler<'a> {
    pub fn new(api: &'a dyn CloudStackApi, policy: PollPolicy) -> Self {
        Self {
            api,
            policy,
            check_only: false,
        }
    }

    /// Decide and report without submitting any mutating call.
    pub fn check_only(mut self, check_only: bool) -> Self {
        self.check_only = check_only;
        self
    }

    pub async fn reconcile(
        &self,
        desired: DesiredState,
        spec: &VmSpec,
    ) -> CloudStackResult<ReconcileOutcome> {
        if desired == DesiredState::Created && spec.template.is_some() && spec.iso.is_some() {
            ImageSelector::choose(spec.template.as_deref(), spec.iso.as_deref())?;
        }

        let resolver = ResourceResolver::new(self.api);
        let project_id = resolver.project_id(spec.project.as_deref()).await?;

        let vms = VmManager::new(self.api);
        let observed = vms.find_vm(&spec.name, project_id.as_deref()).await?;

        let target_offering = match (&observed, spec.service_offering.as_deref()) {
            (Some(_), Some(selector))
                if desired == DesiredState::Created && !selector.is_empty() =>
            {
                Some(resolver.service_offering_id(Some(selector)).await?)
            }
            _ => None,
        };

        let transition = plan(desired, &spec.name, observed.as_ref(), target_offering.as_deref())?;
        log::debug!("VM '{}' desired {}: {}", spec.name, desired, transition);

        let outcome = if transition.is_noop() {
            ReconcileOutcome {
                changed: false,
                vm: observed,
                pending_job: None,
            }
        } else if self.check_only {
            if transition == Transition::Deploy {
                // surface name errors without deploying
                self.deploy_params(spec, project_id).await?;
            }
            log::info!("VM '{}' would {} (check mode)", spec.name, transition);
            ReconcileOutcome {
                changed: true,
                vm: observed,
                pending_job: None,
            }
        } else {
            log::info!("VM '{}': {}", spec.name, transition);
            self.execute(&transition, spec, project_id, observed).await?
        };

        if let Some(vm) = &outcome.vm {
            let removing = matches!(desired, DesiredState::Absent | DesiredState::Expunged);
            if vm.state == VmState::Error && !removing {
                return Err(CloudStackError::in_error(&spec.name));
            }
        }
        Ok(outcome)
    }

    async fn execute(
        &self,
        transition: &Transition,
        spec: &VmSpec,
        project_id: Option<String>,
        observed: Option<VirtualMachine>,
    ) -> CloudStackResult<ReconcileOutcome> {
        let vms = VmManager::new(self.api);
        let project = project_id.as_deref();

        if transition == &Transition::Deploy {
            let params = self.deploy_params(spec, project_id.clone()).await?;
            let resp = vms.deploy(params).await?;
            return self
                .finish(resp, Command::DeployVirtualMachine, spec.poll_async, None, project)
                .await;
        }

        // every other transition has an observed VM
        let Some(vm) = observed else {
            return Err(CloudStackError::not_found("virtual machine", &spec.name));
        };
        let id = vm.id.clone();

        let (resp, command) = match transition {
            Transition::Scale {
                offering_id,
                was_running,
            } => {
                let vm = self
                    .scale(&vms, vm, offering_id, *was_running, project)
                    .await?;
                return Ok(ReconcileOutcome {
                    changed: true,
                    vm: Some(vm),
                    pending_job: None,
                });
            }
            Transition::Start => (vms.start(&id).await?, Command::StartVirtualMachine),
            Transition::Stop => (vms.stop(&id).await?, Command::StopVirtualMachine),
            Transition::Reboot => (vms.reboot(&id).await?, Command::RebootVirtualMachine),
            Transition::Destroy => (vms.destroy(&id, false).await?, Command::DestroyVirtualMachine),
            Transition::DestroyAndExpunge => {
                (vms.destroy(&id, true).await?, Command::DestroyVirtualMachine)
            }
            Transition::Expunge => (vms.expunge(&id).await?, Command::ExpungeVirtualMachine),
            Transition::Deploy | Transition::Noop => {
                return Ok(ReconcileOutcome {
                    changed: false,
                    vm: Some(vm),
                    pending_job: None,
                })
            }
        };

        self.finish(resp, command, spec.poll_async, Some(vm), project)
            .await
    }

    /// Stop (if running), change the offering, start again (if it was running).
    ///
    /// Each step is awaited regardless of `poll_async`.
    async fn scale(
        &self,
        vms: &VmManager<'_>,
        vm: VirtualMachine,
        offering_id: &str,
        was_running: bool,
        project_id: Option<&str>,
    ) -> CloudStackResult<VirtualMachine> {
        let id = vm.id.clone();
        let mut current = Some(vm);

        if was_running {
            let resp = vms.stop(&id).await?;
            current = self
                .await_step(resp, Command::StopVirtualMachine, current, project_id)
                .await?;
        }

        let resp = vms.scale(&id, offering_id).await?;
        current = self
            .await_step(resp, Command::ScaleVirtualMachine, current, project_id)
            .await?;

        if was_running {
            let resp = vms.start(&id).await?;
            current = self
                .await_step(resp, Command::StartVirtualMachine, current, project_id)
                .await?;
        }

        current.ok_or_else(|| CloudStackError::not_found("virtual machine", &id))
    }

    /// Wait for a job, then read the VM state it left behind.
    async fn await_step(
        &self,
        resp: Value,
        command: Command,
        previous: Option<VirtualMachine>,
        project_id: Option<&str>,
    ) -> CloudStackResult<Option<VirtualMachine>> {
        let result = self.poller().wait(resp, command, Some(VM_RESULT_KEY)).await?;
        self.observe(&result, previous, project_id).await
    }

    /// The VM snapshot after a finished job.
    ///
    /// Job results without a VM (expunge, some scale responses) trigger a
    /// fresh lookup by id; `previous` is kept only when the VM is gone.
    async fn observe(
        &self,
        result: &Value,
        previous: Option<VirtualMachine>,
        project_id: Option<&str>,
    ) -> CloudStackResult<Option<VirtualMachine>> {
        if let Some(vm) = vm::snapshot(result) {
            return Ok(Some(vm));
        }

        let id = match &previous {
            Some(vm) => Some(vm.id.clone()),
            None => result.get("id").and_then(Value::as_str).map(String::from),
        };
        let Some(id) = id else {
            return Ok(previous);
        };

        let fresh = VmManager::new(self.api).get_vm(&id, project_id).await?;
        Ok(fresh.or(previous))
    }

    /// Await (or, with polling off, just note) a single-step operation.
    async fn finish(
        &self,
        resp: Value,
        command: Command,
        poll_async: bool,
        previous: Option<VirtualMachine>,
        project_id: Option<&str>,
    ) -> CloudStackResult<ReconcileOutcome> {
        if !poll_async {
            let pending_job = job_of(&resp, command).map(|job| job.id);
            return Ok(ReconcileOutcome {
                changed: true,
                vm: vm::snapshot(&resp).or(previous),
                pending_job,
            });
        }

        let vm = self.await_step(resp, command, previous, project_id).await?;
        Ok(ReconcileOutcome {
            changed: true,
            vm,
            pending_job: None,
        })
    }

    fn poller(&self) -> AsyncJobPoller<'a> {
        AsyncJobPoller::new(self.api, self.policy)
    }

    /// Resolve every name the deployment needs into `deployVirtualMachine`
    /// parameters.
    async fn deploy_params(
        &self,
        spec: &VmSpec,
        project_id: Option<String>,
    ) -> CloudStackResult<ApiParams> {
        let image = ImageSelector::choose(spec.template.as_deref(), spec.iso.as_deref())?;

        let zone_id = ResourceResolver::new(self.api)
            .zone_id(spec.zone.as_deref())
            .await?;
        let resolver =
            ResourceResolver::new(self.api).scoped(project_id.clone(), Some(zone_id.clone()));

        let image_id = resolver.image_id(image).await?;
        let offering_id = resolver
            .service_offering_id(spec.service_offering.as_deref())
            .await?;
        let network_ids = resolver.network_ids(&spec.networks).await?;
        let disk_offering_id = resolver
            .disk_offering_id(spec.disk_offering.as_deref())
            .await?;
        let hypervisor = resolver.hypervisor(spec.hypervisor.as_deref()).await?;

        let display_name = spec
            .display_name
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| spec.name.clone());

        Ok(ParamsBuilder::new()
            .set("templateid", image_id)
            .set("zoneid", zone_id)
            .set("serviceofferingid", offering_id)
            .opt("projectid", project_id)
            .opt("networkids", network_ids)
            .opt("diskofferingid", disk_offering_id)
            .set("hypervisor", hypervisor)
            .set("name", spec.name.as_str())
            .set("displayname", display_name)
            .opt("group", spec.group.clone())
            .opt("keypair", spec.ssh_key.clone())
            .opt("size", spec.disk_size.map(|gb| gb.to_string()))
            .opt("userdata", spec.user_data.as_ref().map(|d| STANDARD.encode(d)))
            .set("securitygroupnames", group_names(&spec.security_groups))
            .set("affinitygroupnames", group_names(&spec.affinity_groups))
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        job_done_vm, job_failed, submitted, vm_json, vm_list, FakeCloudStack,
    };
    use serde_json::json;

    fn observed(state: &str) -> VirtualMachine {
        serde_json::from_value(vm_json("vm-1", "web", state, "so-1")).unwrap()
    }

    /// Catalogue listings a deployment resolves against.
    fn with_catalogue(fake: &FakeCloudStack) {
        fake.respond_always(
            Command::ListZones,
            json!({"zone": [{"id": "zone-1", "name": "ch-gva-2"}]}),
        )
        .respond_always(
            Command::ListTemplates,
            json!({"template": [{"id": "tpl-1", "name": "debian-12", "displaytext": "Debian 12"}]}),
        )
        .respond_always(
            Command::ListIsos,
            json!({"iso": [{"id": "iso-1", "name": "netinst"}]}),
        )
        .respond_always(
            Command::ListServiceOfferings,
            json!({"serviceoffering": [{"id": "so-1", "name": "Tiny"}, {"id": "so-2", "name": "Small"}]}),
        )
        .respond_always(
            Command::ListHypervisors,
            json!({"hypervisor": [{"name": "KVM"}]}),
        )
        .respond_always(
            Command::ListNetworks,
            json!({"network": [{"id": "net-1", "name": "front"}, {"id": "net-2", "name": "back"}]}),
        );
    }

    fn listed(fake: &FakeCloudStack, state: &str) {
        fake.respond(
            Command::ListVirtualMachines,
            vm_list(&[vm_json("vm-1", "web", state, "so-1")]),
        );
    }

    fn reconciler(fake: &FakeCloudStack) -> VmReconciler<'_> {
        VmReconciler::new(fake, PollPolicy::default())
    }

    fn template_spec() -> VmSpec {
        let mut spec = VmSpec::new("web");
        spec.template = Some("Debian 12".into());
        spec
    }

    // ── plan ────────────────────────────────────────────────────────

    #[test]
    fn plan_created() {
        assert_eq!(plan(DesiredState::Created, "web", None, None).unwrap(), Transition::Deploy);

        let vm = observed("Running");
        assert_eq!(
            plan(DesiredState::Created, "web", Some(&vm), Some("so-1")).unwrap(),
            Transition::Noop
        );
        assert_eq!(
            plan(DesiredState::Created, "web", Some(&vm), None).unwrap(),
            Transition::Noop
        );
        assert_eq!(
            plan(DesiredState::Created, "web", Some(&vm), Some("so-2")).unwrap(),
            Transition::Scale { offering_id: "so-2".into(), was_running: true }
        );
        assert_eq!(
            plan(DesiredState::Created, "web", Some(&observed("Stopped")), Some("so-2")).unwrap(),
            Transition::Scale { offering_id: "so-2".into(), was_running: false }
        );
    }

    #[test]
    fn plan_power_states() {
        let start = |s: &str| plan(DesiredState::Running, "web", Some(&observed(s)), None).unwrap();
        assert_eq!(start("Stopped"), Transition::Start);
        assert_eq!(start("Stopping"), Transition::Start);
        assert_eq!(start("Running"), Transition::Noop);
        assert_eq!(start("Starting"), Transition::Noop);

        let stop = |s: &str| plan(DesiredState::Stopped, "web", Some(&observed(s)), None).unwrap();
        assert_eq!(stop("Running"), Transition::Stop);
        assert_eq!(stop("Starting"), Transition::Stop);
        assert_eq!(stop("Stopped"), Transition::Noop);
        assert_eq!(stop("Migrating"), Transition::Noop);
    }

    #[test]
    fn plan_restart_guard() {
        let reboot = |s: &str| plan(DesiredState::Restarted, "web", Some(&observed(s)), None);
        assert_eq!(reboot("Running").unwrap(), Transition::Reboot);
        assert_eq!(reboot("Starting").unwrap(), Transition::Reboot);
        assert_eq!(reboot("Destroyed").unwrap(), Transition::Noop);

        let err = reboot("Stopped").unwrap_err();
        assert_eq!(err.kind, CloudStackErrorKind::InvalidTransition);
        assert_eq!(err.message, "Virtual machine named 'web' not running, not restarted");
        assert!(reboot("Stopping").is_err());
    }

    #[test]
    fn plan_removal() {
        let absent = |s: &str| plan(DesiredState::Absent, "web", Some(&observed(s)), None).unwrap();
        assert_eq!(absent("Running"), Transition::Destroy);
        assert_eq!(absent("Error"), Transition::Destroy);
        assert_eq!(absent("Destroyed"), Transition::Noop);
        assert_eq!(absent("Expunging"), Transition::Noop);

        let expunged =
            |s: &str| plan(DesiredState::Expunged, "web", Some(&observed(s)), None).unwrap();
        assert_eq!(expunged("Destroyed"), Transition::Expunge);
        assert_eq!(expunged("Destroying"), Transition::Expunge);
        assert_eq!(expunged("Expunging"), Transition::Noop);
        assert_eq!(expunged("Stopped"), Transition::DestroyAndExpunge);
    }

    #[test]
    fn plan_missing_vm() {
        assert_eq!(plan(DesiredState::Absent, "web", None, None).unwrap(), Transition::Noop);
        assert_eq!(plan(DesiredState::Expunged, "web", None, None).unwrap(), Transition::Noop);
        for desired in [DesiredState::Running, DesiredState::Stopped, DesiredState::Restarted] {
            let err = plan(desired, "web", None, None).unwrap_err();
            assert_eq!(err.kind, CloudStackErrorKind::NotFound);
            assert_eq!(err.message, "Virtual machine named 'web' not found");
        }
    }

    // ── reconcile ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn deploy_builds_full_payload() {
        let fake = FakeCloudStack::new();
        with_catalogue(&fake);
        fake.respond(Command::ListVirtualMachines, vm_list(&[]))
            .respond(Command::DeployVirtualMachine, submitted("job-1"))
            .respond(
                Command::QueryAsyncJobResult,
                job_done_vm("job-1", vm_json("vm-1", "web", "Running", "so-2")),
            );

        let mut spec = template_spec();
        spec.service_offering = Some("Small".into());
        spec.networks = vec!["back".into(), "front".into()];
        spec.user_data = Some(b"#cloud-config".to_vec());
        spec.ssh_key = Some("deploy-key".into());
        spec.disk_size = Some(20);

        let outcome = reconciler(&fake).reconcile(DesiredState::Created, &spec).await.unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.vm.as_ref().unwrap().state, VmState::Running);

        let p = fake.last_params(Command::DeployVirtualMachine).unwrap();
        assert_eq!(p["templateid"], "tpl-1");
        assert_eq!(p["zoneid"], "zone-1");
        assert_eq!(p["serviceofferingid"], "so-2");
        assert_eq!(p["networkids"], "net-2,net-1");
        assert_eq!(p["hypervisor"], "KVM");
        assert_eq!(p["name"], "web");
        assert_eq!(p["displayname"], "web");
        assert_eq!(p["keypair"], "deploy-key");
        assert_eq!(p["size"], "20");
        assert_eq!(p["userdata"], STANDARD.encode(b"#cloud-config"));
        assert_eq!(p["securitygroupnames"], "");
        assert_eq!(p["affinitygroupnames"], "");
        assert!(!p.contains_key("projectid"));
        assert!(!p.contains_key("diskofferingid"));
        assert!(!p.contains_key("group"));
    }

    #[tokio::test(start_paused = true)]
    async fn deploy_from_iso_with_first_offering() {
        let fake = FakeCloudStack::new();
        with_catalogue(&fake);
        fake.respond(Command::ListVirtualMachines, vm_list(&[]))
            .respond(Command::DeployVirtualMachine, submitted("job-1"))
            .respond(
                Command::QueryAsyncJobResult,
                job_done_vm("job-1", vm_json("vm-1", "web", "Running", "so-1")),
            );

        let mut spec = VmSpec::new("web");
        spec.iso = Some("netinst".into());
        spec.security_groups = vec!["default".into(), "web".into()];
        spec.display_name = Some("Web frontend".into());

        reconciler(&fake).reconcile(DesiredState::Created, &spec).await.unwrap();

        let p = fake.last_params(Command::DeployVirtualMachine).unwrap();
        assert_eq!(p["templateid"], "iso-1");
        assert_eq!(p["serviceofferingid"], "so-1");
        assert_eq!(p["securitygroupnames"], "default,web");
        assert_eq!(p["displayname"], "Web frontend");
        assert!(!p.contains_key("networkids"));
        assert_eq!(fake.count(Command::ListTemplates), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_is_idempotent() {
        let fake = FakeCloudStack::new();
        with_catalogue(&fake);
        fake.respond(Command::ListVirtualMachines, vm_list(&[]))
            .respond(Command::DeployVirtualMachine, submitted("job-1"))
            .respond(
                Command::QueryAsyncJobResult,
                job_done_vm("job-1", vm_json("vm-1", "web", "Running", "so-1")),
            );
        listed(&fake, "Running");

        let mut spec = template_spec();
        spec.service_offering = Some("Tiny".into());
        let r = reconciler(&fake);

        assert!(r.reconcile(DesiredState::Created, &spec).await.unwrap().changed);
        let second = r.reconcile(DesiredState::Created, &spec).await.unwrap();
        assert!(!second.changed);
        assert_eq!(fake.mutating_calls(), vec![Command::DeployVirtualMachine]);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_running_vm_restarts_it() {
        let fake = FakeCloudStack::new();
        with_catalogue(&fake);
        listed(&fake, "Running");
        // re-read after the scale job, whose result carries no VM
        fake.respond(
            Command::ListVirtualMachines,
            vm_list(&[vm_json("vm-1", "web", "Stopped", "so-2")]),
        );
        fake.respond(Command::StopVirtualMachine, submitted("job-stop"))
            .respond(Command::ScaleVirtualMachine, submitted("job-scale"))
            .respond(Command::StartVirtualMachine, submitted("job-start"))
            .respond(
                Command::QueryAsyncJobResult,
                job_done_vm("job-stop", vm_json("vm-1", "web", "Stopped", "so-1")),
            )
            .respond(
                Command::QueryAsyncJobResult,
                json!({"jobid": "job-scale", "jobstatus": 1, "jobresult": {"success": true}}),
            )
            .respond(
                Command::QueryAsyncJobResult,
                job_done_vm("job-start", vm_json("vm-1", "web", "Running", "so-2")),
            );

        let mut spec = VmSpec::new("web");
        spec.service_offering = Some("Small".into());

        let outcome = reconciler(&fake).reconcile(DesiredState::Created, &spec).await.unwrap();
        assert!(outcome.changed);
        let vm = outcome.vm.unwrap();
        assert_eq!(vm.state, VmState::Running);
        assert_eq!(vm.service_offering_id.as_deref(), Some("so-2"));
        assert_eq!(
            fake.mutating_calls(),
            vec![
                Command::StopVirtualMachine,
                Command::ScaleVirtualMachine,
                Command::StartVirtualMachine
            ]
        );
        assert_eq!(
            fake.last_params(Command::ScaleVirtualMachine).unwrap()["serviceofferingid"],
            "so-2"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scale_without_vm_in_job_result_rereads_vm() {
        let fake = FakeCloudStack::new();
        with_catalogue(&fake);
        listed(&fake, "Stopped");
        fake.respond(
            Command::ListVirtualMachines,
            vm_list(&[vm_json("vm-1", "web", "Stopped", "so-2")]),
        )
        .respond(Command::ScaleVirtualMachine, submitted("job-scale"))
        .respond(
            Command::QueryAsyncJobResult,
            json!({"jobid": "job-scale", "jobstatus": 1, "jobresult": {"success": true}}),
        );

        let mut spec = VmSpec::new("web");
        spec.service_offering = Some("Small".into());

        let outcome = reconciler(&fake).reconcile(DesiredState::Created, &spec).await.unwrap();
        assert!(outcome.changed);
        let report = outcome.report().unwrap();
        let vm = outcome.vm.unwrap();
        assert_eq!(vm.state, VmState::Stopped);
        assert_eq!(vm.service_offering_id.as_deref(), Some("so-2"));
        assert_eq!(report.service_offering.as_deref(), Some("offering so-2"));
        assert_eq!(fake.last_params(Command::ListVirtualMachines).unwrap()["id"], "vm-1");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_scale_leaves_vm_stopped() {
        let fake = FakeCloudStack::new();
        with_catalogue(&fake);
        listed(&fake, "Running");
        fake.respond(Command::StopVirtualMachine, submitted("job-stop"))
            .respond(
                Command::QueryAsyncJobResult,
                job_done_vm("job-stop", vm_json("vm-1", "web", "Stopped", "so-1")),
            )
            .respond(
                Command::ScaleVirtualMachine,
                json!({"errorcode": 431, "errortext": "Offering not available"}),
            );

        let mut spec = VmSpec::new("web");
        spec.service_offering = Some("Small".into());

        let err = reconciler(&fake)
            .reconcile(DesiredState::Created, &spec)
            .await
            .unwrap_err();
        assert_eq!(err.message, "Offering not available");
        assert_eq!(
            fake.mutating_calls(),
            vec![Command::StopVirtualMachine, Command::ScaleVirtualMachine]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scale_stopped_vm_stays_stopped() {
        let fake = FakeCloudStack::new();
        with_catalogue(&fake);
        listed(&fake, "Stopped");
        fake.respond(Command::ScaleVirtualMachine, submitted("job-scale"))
            .respond(
                Command::QueryAsyncJobResult,
                job_done_vm("job-scale", vm_json("vm-1", "web", "Stopped", "so-2")),
            );

        let mut spec = VmSpec::new("web");
        spec.service_offering = Some("so-2".into());
        // scaling ignores poll_async
        spec.poll_async = false;

        let outcome = reconciler(&fake).reconcile(DesiredState::Created, &spec).await.unwrap();
        assert_eq!(outcome.vm.unwrap().state, VmState::Stopped);
        assert_eq!(fake.mutating_calls(), vec![Command::ScaleVirtualMachine]);
        assert_eq!(fake.count(Command::QueryAsyncJobResult), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_a_stopped_vm_changes_nothing() {
        let fake = FakeCloudStack::new();
        listed(&fake, "Stopped");
        let outcome = reconciler(&fake)
            .reconcile(DesiredState::Stopped, &VmSpec::new("web"))
            .await
            .unwrap();
        assert!(!outcome.changed);
        assert!(fake.mutating_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_running_vm() {
        let fake = FakeCloudStack::new();
        listed(&fake, "Running");
        fake.respond(Command::StopVirtualMachine, submitted("job-1")).respond(
            Command::QueryAsyncJobResult,
            job_done_vm("job-1", vm_json("vm-1", "web", "Stopped", "so-1")),
        );

        let outcome = reconciler(&fake)
            .reconcile(DesiredState::Stopped, &VmSpec::new("web"))
            .await
            .unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.report().unwrap().vm_state, "Stopped");
        assert_eq!(fake.last_params(Command::StopVirtualMachine).unwrap()["id"], "vm-1");
    }

    #[tokio::test]
    async fn template_and_iso_rejected_before_any_call() {
        let fake = FakeCloudStack::new();
        let mut spec = template_spec();
        spec.iso = Some("netinst".into());

        let err = reconciler(&fake)
            .reconcile(DesiredState::Created, &spec)
            .await
            .unwrap_err();
        assert_eq!(err.kind, CloudStackErrorKind::InvalidSpec);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn deploy_without_image_is_invalid_spec() {
        let fake = FakeCloudStack::new();
        fake.respond(Command::ListVirtualMachines, vm_list(&[]));
        let err = reconciler(&fake)
            .reconcile(DesiredState::Created, &VmSpec::new("web"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, CloudStackErrorKind::InvalidSpec);
        assert!(fake.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn restart_of_stopped_vm_is_refused() {
        let fake = FakeCloudStack::new();
        listed(&fake, "Stopped");
        let err = reconciler(&fake)
            .reconcile(DesiredState::Restarted, &VmSpec::new("web"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, CloudStackErrorKind::InvalidTransition);
        assert!(fake.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn check_mode_submits_nothing() {
        for (desired, state) in [
            (DesiredState::Absent, "Running"),
            (DesiredState::Expunged, "Destroyed"),
            (DesiredState::Running, "Stopped"),
            (DesiredState::Restarted, "Running"),
        ] {
            let fake = FakeCloudStack::new();
            listed(&fake, state);
            let outcome = reconciler(&fake)
                .check_only(true)
                .reconcile(desired, &VmSpec::new("web"))
                .await
                .unwrap();
            assert!(outcome.changed, "{desired} from {state}");
            assert!(fake.mutating_calls().is_empty());
            assert_eq!(fake.count(Command::QueryAsyncJobResult), 0);
        }
    }

    #[tokio::test]
    async fn check_mode_scale_and_deploy() {
        let fake = FakeCloudStack::new();
        with_catalogue(&fake);
        listed(&fake, "Running");
        let mut spec = template_spec();
        spec.service_offering = Some("Small".into());
        let r = reconciler(&fake).check_only(true);

        let scale = r.reconcile(DesiredState::Created, &spec).await.unwrap();
        assert!(scale.changed);

        fake.respond(Command::ListVirtualMachines, vm_list(&[]));
        let deploy = r.reconcile(DesiredState::Created, &spec).await.unwrap();
        assert!(deploy.changed);
        assert!(deploy.vm.is_none());
        assert_eq!(fake.count(Command::ListTemplates), 1);

        assert!(fake.mutating_calls().is_empty());
        assert_eq!(fake.count(Command::QueryAsyncJobResult), 0);
    }

    #[tokio::test]
    async fn check_mode_still_reports_unknown_names() {
        let fake = FakeCloudStack::new();
        with_catalogue(&fake);
        fake.respond(Command::ListVirtualMachines, vm_list(&[]));
        let mut spec = template_spec();
        spec.zone = Some("atlantis".into());

        let err = reconciler(&fake)
            .check_only(true)
            .reconcile(DesiredState::Created, &spec)
            .await
            .unwrap_err();
        assert_eq!(err.message, "zone 'atlantis' not found");
    }

    #[tokio::test]
    async fn observed_error_state_fails() {
        let fake = FakeCloudStack::new();
        listed(&fake, "Error");
        let err = reconciler(&fake)
            .reconcile(DesiredState::Running, &VmSpec::new("web"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, CloudStackErrorKind::ResourceInError);
        assert_eq!(err.message, "Virtual machine named 'web' in error state");
    }

    #[tokio::test(start_paused = true)]
    async fn error_state_after_start_fails() {
        let fake = FakeCloudStack::new();
        listed(&fake, "Stopped");
        fake.respond(Command::StartVirtualMachine, submitted("job-1")).respond(
            Command::QueryAsyncJobResult,
            job_done_vm("job-1", vm_json("vm-1", "web", "Error", "so-1")),
        );
        let err = reconciler(&fake)
            .reconcile(DesiredState::Running, &VmSpec::new("web"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, CloudStackErrorKind::ResourceInError);
    }

    #[tokio::test(start_paused = true)]
    async fn errored_vm_can_be_destroyed() {
        let fake = FakeCloudStack::new();
        listed(&fake, "Error");
        fake.respond(Command::DestroyVirtualMachine, submitted("job-1")).respond(
            Command::QueryAsyncJobResult,
            job_done_vm("job-1", vm_json("vm-1", "web", "Destroyed", "so-1")),
        );
        let outcome = reconciler(&fake)
            .reconcile(DesiredState::Absent, &VmSpec::new("web"))
            .await
            .unwrap();
        assert_eq!(outcome.vm.unwrap().state, VmState::Destroyed);
        let p = fake.last_params(Command::DestroyVirtualMachine).unwrap();
        assert!(!p.contains_key("expunge"));
    }

    #[tokio::test]
    async fn missing_vm() {
        let fake = FakeCloudStack::new();
        fake.respond_always(Command::ListVirtualMachines, vm_list(&[]));

        let err = reconciler(&fake)
            .reconcile(DesiredState::Running, &VmSpec::new("web"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let outcome = reconciler(&fake)
            .reconcile(DesiredState::Expunged, &VmSpec::new("web"))
            .await
            .unwrap();
        assert!(!outcome.changed);
        assert!(outcome.vm.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expunged_vm_gone_keeps_last_snapshot() {
        let fake = FakeCloudStack::new();
        listed(&fake, "Destroyed");
        fake.respond(Command::ListVirtualMachines, vm_list(&[]))
            .respond(Command::ExpungeVirtualMachine, submitted("job-1"))
            .respond(
                Command::QueryAsyncJobResult,
                json!({"jobid": "job-1", "jobstatus": 1, "jobresult": {"success": true}}),
            );
        let outcome = reconciler(&fake)
            .reconcile(DesiredState::Expunged, &VmSpec::new("web"))
            .await
            .unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.vm.unwrap().state, VmState::Destroyed);
        assert_eq!(fake.mutating_calls(), vec![Command::ExpungeVirtualMachine]);
        assert_eq!(fake.last_params(Command::ListVirtualMachines).unwrap()["id"], "vm-1");
    }

    #[tokio::test(start_paused = true)]
    async fn expunging_vm_reports_fresh_state() {
        let fake = FakeCloudStack::new();
        listed(&fake, "Destroyed");
        fake.respond(
            Command::ListVirtualMachines,
            vm_list(&[vm_json("vm-1", "web", "Expunging", "so-1")]),
        )
        .respond(Command::ExpungeVirtualMachine, submitted("job-1"))
        .respond(
            Command::QueryAsyncJobResult,
            json!({"jobid": "job-1", "jobstatus": 1, "jobresult": {"success": true}}),
        );
        let outcome = reconciler(&fake)
            .reconcile(DesiredState::Expunged, &VmSpec::new("web"))
            .await
            .unwrap();
        assert_eq!(outcome.report().unwrap().vm_state, "Expunging");
    }

    #[tokio::test(start_paused = true)]
    async fn expunge_running_vm_destroys_with_flag() {
        let fake = FakeCloudStack::new();
        listed(&fake, "Running");
        fake.respond(Command::DestroyVirtualMachine, submitted("job-1")).respond(
            Command::QueryAsyncJobResult,
            job_done_vm("job-1", vm_json("vm-1", "web", "Expunging", "so-1")),
        );
        reconciler(&fake)
            .reconcile(DesiredState::Expunged, &VmSpec::new("web"))
            .await
            .unwrap();
        let p = fake.last_params(Command::DestroyVirtualMachine).unwrap();
        assert_eq!(p["expunge"], "true");
    }

    #[tokio::test]
    async fn without_polling_the_job_is_left_pending() {
        let fake = FakeCloudStack::new();
        listed(&fake, "Stopped");
        fake.respond(Command::StartVirtualMachine, submitted("job-7"));
        let mut spec = VmSpec::new("web");
        spec.poll_async = false;

        let outcome = reconciler(&fake).reconcile(DesiredState::Running, &spec).await.unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.pending_job.as_deref(), Some("job-7"));
        assert_eq!(outcome.vm.unwrap().state, VmState::Stopped);
        assert_eq!(fake.count(Command::QueryAsyncJobResult), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_deploy_job_is_operation_failed() {
        let fake = FakeCloudStack::new();
        with_catalogue(&fake);
        fake.respond(Command::ListVirtualMachines, vm_list(&[]))
            .respond(Command::DeployVirtualMachine, submitted("job-1"))
            .respond(
                Command::QueryAsyncJobResult,
                job_failed("job-1", "Unable to create a deployment for VM"),
            );
        let err = reconciler(&fake)
            .reconcile(DesiredState::Created, &template_spec())
            .await
            .unwrap_err();
        assert_eq!(err.kind, CloudStackErrorKind::OperationFailed);
        assert_eq!(err.message, "Unable to create a deployment for VM");
    }

    #[tokio::test]
    async fn project_scopes_vm_lookup() {
        let fake = FakeCloudStack::new();
        fake.respond(
            Command::ListProjects,
            json!({"project": [{"id": "p-1", "name": "web", "displaytext": "Web team"}]}),
        );
        listed(&fake, "Running");
        let mut spec = VmSpec::new("web");
        spec.project = Some("Web team".into());

        reconciler(&fake).reconcile(DesiredState::Running, &spec).await.unwrap();
        assert_eq!(fake.last_params(Command::ListVirtualMachines).unwrap()["projectid"], "p-1");
        assert_eq!(fake.last_params(Command::ListProjects).unwrap()["listall"], "true");
    }
}
