//! Async job polling.
//!
//! Mutating commands answer with `{"jobid": …}` instead of a result. The
//! poller queries `queryAsyncJobResult` on a fixed interval until the job
//! leaves the pending state, then hands back the snapshot the job produced.

use crate::api::{error_text, CloudStackApi, Command, ParamsBuilder};
use crate::config::CloudStackConfig;
use crate::error::{CloudStackError, CloudStackResult};
use crate::types::{AsyncJob, JobStatus};

use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// How often to poll and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` waits until the job finishes.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            deadline: None,
        }
    }
}

impl PollPolicy {
    pub fn from_config(config: &CloudStackConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.poll_interval_secs),
            deadline: config.poll_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// The job handle carried by a mutating response, if any.
pub fn job_of(response: &Value, operation: Command) -> Option<AsyncJob> {
    let id = match response.get("jobid")? {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(AsyncJob { id, operation })
}

/// Turns submitted responses into terminal outcomes.
pub struct AsyncJobPoller<'a> {
    api: &'a dyn CloudStackApi,
    policy: PollPolicy,
}

impl<'a> AsyncJobPoller<'a> {
    pub fn new(api: &'a dyn CloudStackApi, policy: PollPolicy) -> Self {
        Self { api, policy }
    }

    /// Wait for the job behind `response` to finish.
    ///
    /// A response without `jobid` is already terminal and comes back
    /// unchanged. On success, `jobresult[result_key]` is returned when
    /// present, otherwise the submitted response itself.
    pub async fn wait(
        &self,
        response: Value,
        operation: Command,
        result_key: Option<&str>,
    ) -> CloudStackResult<Value> {
        let Some(job) = job_of(&response, operation) else {
            return Ok(response);
        };

        let started = Instant::now();
        loop {
            let params = ParamsBuilder::new().set("jobid", job.id.as_str()).build();
            let status = self.api.execute(Command::QueryAsyncJobResult, params).await?;

            let code = status.get("jobstatus").and_then(Value::as_i64).ok_or_else(|| {
                CloudStackError::parse(format!(
                    "Job {} ({}): queryAsyncJobResult reply has no jobstatus",
                    job.id, job.operation
                ))
            })?;
            let job_status = JobStatus::from_code(code);
            log::debug!("Job {} ({}) status {}", job.id, job.operation, code);

            if job_status.is_terminal() {
                return finish(&job, job_status, response, &status, result_key);
            }

            if let Some(deadline) = self.policy.deadline {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    return Err(CloudStackError::operation_failed(format!(
                        "Job {} ({}) still pending after {}s",
                        job.id,
                        job.operation,
                        elapsed.as_secs()
                    )));
                }
            }

            sleep(self.policy.interval).await;
        }
    }
}

fn finish(
    job: &AsyncJob,
    status: JobStatus,
    response: Value,
    query: &Value,
    result_key: Option<&str>,
) -> CloudStackResult<Value> {
    let result = query.get("jobresult");

    if let Some(text) = result.and_then(error_text) {
        log::warn!("Job {} ({}) failed: {}", job.id, job.operation, text);
        return Err(CloudStackError::operation_failed(text));
    }
    if status == JobStatus::Failed {
        log::warn!("Job {} ({}) failed without error text", job.id, job.operation);
        return Err(CloudStackError::operation_failed(format!(
            "Job {} ({}) failed",
            job.id, job.operation
        )));
    }

    log::info!("Job {} ({}) completed", job.id, job.operation);

    match (result_key, result) {
        (Some(key), Some(result)) => Ok(result.get(key).cloned().unwrap_or(response)),
        _ => Ok(response),
    }
}
