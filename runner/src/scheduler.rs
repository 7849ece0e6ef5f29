#[cfg(test)]
pub mod mock;
pub mod slurm;

use crate::{
    config::{ConfigErrors, ResourceLimits, RunnerConfig},
    ledger::{JobId, JobStatus, UNKNOWN_JOB_ID},
};
use regex::Regex;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to spawn {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with {code:?}: {output}")]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },
    #[error("{command} did not finish within {seconds}s and was killed")]
    Timeout { command: String, seconds: u64 },
    #[error("Refusing to address job id {0}")]
    InvalidJobId(JobId),
}

/// Parsed acknowledgement of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Narrow interface to an external batch scheduler.
///
/// Every call is independent of the others, so implementations have to be safe to use
/// from the worker pool.
pub trait Scheduler: Send + Sync {
    /// submit one unit configuration as a job
    fn submit(&self, unit_conf: &Path, limits: &ResourceLimits)
        -> Result<Submission, SchedulerError>;

    /// query the accounting interface, true once the job completed
    fn poll(&self, job_id: JobId) -> Result<bool, SchedulerError>;

    /// request the cancellation of a job
    fn cancel(&self, job_id: JobId) -> Result<(), SchedulerError>;
}

/// Recognised phrasings of a submission acknowledgement
#[derive(Debug, Clone)]
pub struct SubmissionPatterns {
    pub queued: Regex,
    pub allocated: Regex,
}

impl SubmissionPatterns {
    /// Parse submission output. The allocated phrasing wins if both are present since
    /// a job is queued before it is allocated; output matching neither yields
    /// `unknown` with the sentinel job id.
    pub fn parse(&self, output: &str) -> Submission {
        let matched = |pattern: &Regex| {
            pattern
                .captures(output)
                .and_then(|captures| captures.get(1))
                .and_then(|id| id.as_str().parse::<JobId>().ok())
        };

        if let Some(job_id) = matched(&self.allocated) {
            Submission {
                job_id,
                status: JobStatus::Allocated,
            }
        } else if let Some(job_id) = matched(&self.queued) {
            Submission {
                job_id,
                status: JobStatus::Queued,
            }
        } else {
            Submission {
                job_id: UNKNOWN_JOB_ID,
                status: JobStatus::Unknown,
            }
        }
    }
}

/// Create the scheduler selected by `scheduler.name`
pub fn load(config: &RunnerConfig) -> Result<Box<dyn Scheduler>, ConfigErrors> {
    match config.scheduler.name.to_lowercase().as_str() {
        "slurm" => Ok(Box::new(slurm::SlurmScheduler::load(config)?)),
        _ => Err(ConfigErrors::UnsupportedScheduler(
            config.scheduler.name.clone(),
        )),
    }
}
