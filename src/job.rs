//! Polling of asynchronous control-plane jobs.
//!
//! Jobs are polled on a fixed cadence until they leave the pending state.
//! There is no timeout here; callers that need a ceiling bound the
//! surrounding operation themselves. A waiter given an [`Interrupt`] stops
//! polling once it is triggered.

use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::control_plane::{ControlPlane, ControlPlaneError, JobResult, JobStatus, Submission};
use crate::interrupt::Interrupt;

/// Default interval between job status queries.
pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Result of a creation call once any job it started has finished.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Completed {
    /// Identifier of the created entity, from the submission or the job
    /// payload.
    pub id: Option<String>,
    /// Job payload, when the call was asynchronous.
    pub result: Option<JobResult>,
}

impl Completed {
    /// Returns the created entity id.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError::Api`] naming `command` when neither the
    /// submission nor the job payload carried an identifier.
    pub fn into_id(self, command: &str) -> Result<String, ControlPlaneError> {
        self.id.ok_or_else(|| {
            ControlPlaneError::api(command, "response did not include an identifier")
        })
    }
}

/// Polls job status until a terminal state is reached.
#[derive(Debug)]
pub struct JobWaiter<'a, C: ?Sized> {
    client: &'a C,
    interval: Duration,
    interrupt: Option<Interrupt>,
}

impl<'a, C> JobWaiter<'a, C>
where
    C: ControlPlane + ?Sized,
{
    /// Creates a waiter polling every [`JOB_POLL_INTERVAL`].
    #[must_use]
    pub const fn new(client: &'a C) -> Self {
        Self {
            client,
            interval: JOB_POLL_INTERVAL,
            interrupt: None,
        }
    }

    /// Overrides the polling interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Abandons the wait once `interrupt` is triggered.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Waits for `job_id` to finish and returns its payload.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError::JobFailed`] when the job fails,
    /// [`ControlPlaneError::Interrupted`] when interruption is observed
    /// before a status query, or the client's error when a status query
    /// itself fails.
    pub async fn wait(&self, job_id: &str) -> Result<JobResult, ControlPlaneError> {
        loop {
            if self.interrupt.as_ref().is_some_and(Interrupt::is_triggered) {
                debug!(job_id, "job wait interrupted");
                return Err(ControlPlaneError::Interrupted {
                    job_id: job_id.to_owned(),
                });
            }
            match self.client.query_job(job_id).await? {
                JobStatus::Pending => {
                    debug!(job_id, "job pending");
                    sleep(self.interval).await;
                }
                JobStatus::Succeeded(result) => return Ok(result),
                JobStatus::Failed { message } => {
                    return Err(ControlPlaneError::JobFailed {
                        job_id: job_id.to_owned(),
                        message,
                    });
                }
            }
        }
    }

    /// Completes a creation call, awaiting its job when one was returned.
    ///
    /// # Errors
    ///
    /// Propagates failures from [`JobWaiter::wait`].
    pub async fn complete(&self, submission: Submission) -> Result<Completed, ControlPlaneError> {
        let Submission { id, job_id } = submission;
        let Some(job) = job_id else {
            return Ok(Completed { id, result: None });
        };

        let result = self.wait(&job).await?;
        let resolved_id = id.or_else(|| result.entity_id().map(str::to_owned));
        Ok(Completed {
            id: resolved_id,
            result: Some(result),
        })
    }
}
