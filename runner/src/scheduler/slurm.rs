use super::{Scheduler, SchedulerError, Submission, SubmissionPatterns};
use crate::{
    config::{compile_pattern, AppConfig, ConfigErrors, ResourceLimits, RunnerConfig},
    ledger::JobId,
};
use regex::Regex;
use std::{
    ffi::OsString,
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use tracing::{debug, instrument, trace, warn};
use wait_timeout::ChildExt;

/// Scheduler backed by the Slurm command line tools (`srun`, `sacct`, `scancel`)
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    submit_exec: PathBuf,
    accounting_exec: PathBuf,
    cancel_exec: PathBuf,
    app: AppConfig,
    patterns: SubmissionPatterns,
    completed: Regex,
    failed: Regex,
    timeout: Option<Duration>,
}

/// exit status and combined stdout/stderr of a finished command
struct CommandOutput {
    success: bool,
    code: Option<i32>,
    text: String,
}

impl SlurmScheduler {
    pub fn load(config: &RunnerConfig) -> Result<Self, ConfigErrors> {
        let scheduler = &config.scheduler;

        Ok(Self {
            submit_exec: scheduler.submit_exec.clone(),
            accounting_exec: scheduler.accounting_exec.clone(),
            cancel_exec: scheduler.cancel_exec.clone(),
            app: config.app.clone(),
            patterns: SubmissionPatterns {
                queued: compile_pattern(&scheduler.queued_pattern)?,
                allocated: compile_pattern(&scheduler.allocated_pattern)?,
            },
            completed: compile_pattern(&scheduler.completed_pattern)?,
            failed: compile_pattern(&scheduler.failed_pattern)?,
            timeout: scheduler.timeout.map(Duration::from_secs),
        })
    }

    /// arguments of the submission command, the executable not included
    pub fn submit_args(&self, unit_conf: &Path, limits: &ResourceLimits) -> Vec<OsString> {
        vec![
            format!("--time={}", limits.time).into(),
            format!("--mem={}", limits.mem).into(),
            self.app.exec.clone().into_os_string(),
            self.app.name.clone().into(),
            "-c".into(),
            unit_conf.as_os_str().to_owned(),
            "-v".into(),
        ]
    }

    fn run(&self, exec: &Path, args: &[OsString]) -> Result<CommandOutput, SchedulerError> {
        let command = exec.to_string_lossy().into_owned();
        debug!("Running {command} {args:?}");

        let mut child = Command::new(exec)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SchedulerError::Spawn {
                command: command.clone(),
                source,
            })?;

        // drain both pipes while waiting, a full pipe would block the child
        let readers = [
            child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
            child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
        ]
        .into_iter()
        .flatten()
        .map(|mut stream| {
            thread::spawn(move || {
                let mut buffer = String::new();
                stream.read_to_string(&mut buffer).map(|_| buffer)
            })
        })
        .collect::<Vec<_>>();

        let status = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout) {
                Ok(Some(status)) => status,
                Ok(None) => {
                    // child hasn't exited yet
                    if let Err(error) = child.kill() {
                        warn!("Failed to kill {command}: {error}");
                    }
                    if let Err(error) = child.wait() {
                        warn!("Failed to reap {command}: {error}");
                    }

                    return Err(SchedulerError::Timeout {
                        command,
                        seconds: timeout.as_secs(),
                    });
                }
                Err(source) => return Err(SchedulerError::Spawn { command, source }),
            },
            None => child
                .wait()
                .map_err(|source| SchedulerError::Spawn {
                    command: command.clone(),
                    source,
                })?,
        };

        let mut text = String::new();

        for reader in readers {
            match reader.join() {
                Ok(Ok(buffer)) => text.push_str(&buffer),
                Ok(Err(error)) => warn!("Failed to read output of {command}: {error}"),
                Err(_) => warn!("Output reader of {command} panicked"),
            }
        }

        trace!("Output of {command}: {text}");

        Ok(CommandOutput {
            success: status.success(),
            code: status.code(),
            text,
        })
    }

    fn run_checked(&self, exec: &Path, args: &[OsString]) -> Result<String, SchedulerError> {
        let output = self.run(exec, args)?;

        if output.success {
            Ok(output.text)
        } else {
            Err(SchedulerError::Failed {
                command: exec.to_string_lossy().into_owned(),
                code: output.code,
                output: output.text.trim().to_owned(),
            })
        }
    }
}

impl Scheduler for SlurmScheduler {
    #[instrument(skip(self, limits), level = "debug")]
    fn submit(
        &self,
        unit_conf: &Path,
        limits: &ResourceLimits,
    ) -> Result<Submission, SchedulerError> {
        let output = self.run_checked(&self.submit_exec, &self.submit_args(unit_conf, limits))?;

        Ok(self.patterns.parse(&output))
    }

    #[instrument(skip(self), level = "debug")]
    fn poll(&self, job_id: JobId) -> Result<bool, SchedulerError> {
        if job_id < 0 {
            return Err(SchedulerError::InvalidJobId(job_id));
        }

        let output = self.run_checked(
            &self.accounting_exec,
            &["-j".into(), job_id.to_string().into()],
        )?;

        if self.completed.is_match(&output) {
            Ok(true)
        } else {
            // failed jobs are indistinguishable from running ones for the ledger
            if let Some(marker) = self.failed.find(&output) {
                warn!(job_id, "Accounting reports {} for job", marker.as_str());
            }

            Ok(false)
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn cancel(&self, job_id: JobId) -> Result<(), SchedulerError> {
        if job_id < 0 {
            return Err(SchedulerError::InvalidJobId(job_id));
        }

        self.run_checked(&self.cancel_exec, &[job_id.to_string().into()])
            .map(|_| ())
    }
}
