use super::{Scheduler, SchedulerError, Submission, SubmissionPatterns};
use crate::{
    config::{compile_pattern, ResourceLimits, SchedulerConfig},
    ledger::JobId,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::atomic::{AtomicI64, Ordering},
};

/// In-memory scheduler answering with scripted Slurm output
pub struct MockScheduler {
    patterns: SubmissionPatterns,
    next_job: AtomicI64,
    /// submission output per unit file name, queued output otherwise
    pub submit_output: HashMap<String, String>,
    /// unit file names whose submission exits non-zero
    pub submit_failures: HashSet<String>,
    pub completed: HashSet<JobId>,
    pub cancel_failures: HashSet<JobId>,
    pub submitted: Mutex<Vec<PathBuf>>,
    pub polled: Mutex<Vec<JobId>>,
    pub cancelled: Mutex<Vec<JobId>>,
}

impl Default for MockScheduler {
    fn default() -> Self {
        let config = SchedulerConfig::default();

        Self {
            patterns: SubmissionPatterns {
                queued: compile_pattern(&config.queued_pattern).unwrap(),
                allocated: compile_pattern(&config.allocated_pattern).unwrap(),
            },
            next_job: AtomicI64::new(1000),
            submit_output: HashMap::new(),
            submit_failures: HashSet::new(),
            completed: HashSet::new(),
            cancel_failures: HashSet::new(),
            submitted: Mutex::new(Vec::new()),
            polled: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }
}

impl MockScheduler {
    fn key(unit_conf: &Path) -> String {
        unit_conf.to_string_lossy().into_owned()
    }
}

impl Scheduler for MockScheduler {
    fn submit(
        &self,
        unit_conf: &Path,
        _limits: &ResourceLimits,
    ) -> Result<Submission, SchedulerError> {
        self.submitted.lock().push(unit_conf.to_path_buf());
        let key = Self::key(unit_conf);

        if self.submit_failures.contains(&key) {
            return Err(SchedulerError::Failed {
                command: "srun".to_owned(),
                code: Some(1),
                output: "srun: error: Unable to allocate resources".to_owned(),
            });
        }

        let output = match self.submit_output.get(&key) {
            Some(output) => output.clone(),
            None => format!(
                "srun: job {} queued and waiting for resources\n",
                self.next_job.fetch_add(1, Ordering::SeqCst)
            ),
        };

        Ok(self.patterns.parse(&output))
    }

    fn poll(&self, job_id: JobId) -> Result<bool, SchedulerError> {
        if job_id < 0 {
            return Err(SchedulerError::InvalidJobId(job_id));
        }
        self.polled.lock().push(job_id);

        Ok(self.completed.contains(&job_id))
    }

    fn cancel(&self, job_id: JobId) -> Result<(), SchedulerError> {
        if job_id < 0 {
            return Err(SchedulerError::InvalidJobId(job_id));
        }
        self.cancelled.lock().push(job_id);

        if self.cancel_failures.contains(&job_id) {
            Err(SchedulerError::Failed {
                command: "scancel".to_owned(),
                code: Some(1),
                output: format!("scancel: error: Invalid job id {job_id}"),
            })
        } else {
            Ok(())
        }
    }
}
