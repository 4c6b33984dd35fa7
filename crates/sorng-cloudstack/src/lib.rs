//! # SortOfRemote NG – Apache CloudStack VM Lifecycle
//!
//! Desired-state management of a single CloudStack virtual machine: look it
//! up, decide the minimal transition (deploy, scale, start, stop, reboot,
//! destroy, expunge), submit it and follow the async job to completion.
//!
//! ## Modules
//!
//! - **types** — VM snapshot, lifecycle/desired states, spec and report
//! - **error** — Crate-specific error types
//! - **config** — Endpoint / credentials from env or `cloudstack.ini`
//! - **signing** — HMAC-SHA1 request signing
//! - **api** — Command set and the `CloudStackApi` seam
//! - **client** — Signed reqwest implementation of `CloudStackApi`
//! - **resolver** — Name → id lookups (zone, template, offering, network, …)
//! - **poller** — `queryAsyncJobResult` polling with optional deadline
//! - **vm** — Typed VM list / lifecycle commands
//! - **reconciler** — Transition table and its execution
//! - **service** — Aggregate façade

pub mod types;
pub mod error;
pub mod config;
pub mod signing;
pub mod api;
pub mod client;
pub mod resolver;
pub mod poller;
pub mod vm;
pub mod reconciler;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{CloudStackApi, Command};
pub use config::{CloudStackConfig, HttpMethod};
pub use error::{CloudStackError, CloudStackErrorKind, CloudStackResult};
pub use poller::PollPolicy;
pub use reconciler::{ReconcileOutcome, Transition};
pub use service::CloudStackService;
pub use types::{DesiredState, VirtualMachine, VmReport, VmSpec, VmState};
