//! In-memory `CloudStackApi` for unit tests.
//!
//! Responses are scripted per command: queued one-shot responses are
//! consumed first, then the command's sticky response (if any). Every call
//! is recorded so tests can assert what was (not) sent.

use crate::api::{ApiParams, CloudStackApi, Command};
use crate::error::{CloudStackError, CloudStackResult};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct FakeCloudStack {
    queued: Mutex<HashMap<Command, VecDeque<CloudStackResult<Value>>>>,
    sticky: Mutex<HashMap<Command, Value>>,
    calls: Mutex<Vec<(Command, ApiParams)>>,
}

impl FakeCloudStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot response.
    pub fn respond(&self, command: Command, value: Value) -> &Self {
        self.queued
            .lock()
            .unwrap()
            .entry(command)
            .or_default()
            .push_back(Ok(value));
        self
    }

    /// Queue a one-shot failure.
    pub fn fail(&self, command: Command, error: CloudStackError) -> &Self {
        self.queued
            .lock()
            .unwrap()
            .entry(command)
            .or_default()
            .push_back(Err(error));
        self
    }

    /// Response returned whenever nothing is queued.
    pub fn respond_always(&self, command: Command, value: Value) -> &Self {
        self.sticky.lock().unwrap().insert(command, value);
        self
    }

    pub fn calls(&self) -> Vec<(Command, ApiParams)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.calls().into_iter().map(|(c, _)| c).collect()
    }

    pub fn count(&self, command: Command) -> usize {
        self.commands().into_iter().filter(|c| *c == command).count()
    }

    pub fn mutating_calls(&self) -> Vec<Command> {
        self.commands().into_iter().filter(Command::is_mutating).collect()
    }

    /// Parameters of the last call to `command`.
    pub fn last_params(&self, command: Command) -> Option<ApiParams> {
        self.calls()
            .into_iter()
            .rev()
            .find(|(c, _)| *c == command)
            .map(|(_, p)| p)
    }
}

#[async_trait]
impl CloudStackApi for FakeCloudStack {
    async fn execute(&self, command: Command, params: ApiParams) -> CloudStackResult<Value> {
        self.calls.lock().unwrap().push((command, params));

        if let Some(next) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&command)
            .and_then(VecDeque::pop_front)
        {
            return next;
        }

        self.sticky
            .lock()
            .unwrap()
            .get(&command)
            .cloned()
            .ok_or_else(|| CloudStackError::parse(format!("no scripted response for {command}")))
    }
}

// ── Fixtures ────────────────────────────────────────────────────────────

pub(crate) fn vm_json(id: &str, name: &str, state: &str, offering: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "displayname": name,
        "state": state,
        "serviceofferingid": offering,
        "serviceofferingname": format!("offering {offering}"),
        "zoneid": "zone-1",
        "zonename": "ch-gva-2",
        "nic": [{"id": "nic-1", "networkid": "net-1", "ipaddress": "10.1.1.10", "isdefault": true}]
    })
}

pub(crate) fn vm_list(vms: &[Value]) -> Value {
    if vms.is_empty() {
        json!({})
    } else {
        json!({"count": vms.len(), "virtualmachine": vms})
    }
}

pub(crate) fn submitted(job_id: &str) -> Value {
    json!({"id": "vm-1", "jobid": job_id})
}

pub(crate) fn job_pending(job_id: &str) -> Value {
    json!({"jobid": job_id, "jobstatus": 0})
}

pub(crate) fn job_done_vm(job_id: &str, vm: Value) -> Value {
    json!({"jobid": job_id, "jobstatus": 1, "jobresult": {"virtualmachine": vm}})
}

pub(crate) fn job_failed(job_id: &str, text: &str) -> Value {
    json!({"jobid": job_id, "jobstatus": 2, "jobresult": {"errorcode": 530, "errortext": text}})
}
