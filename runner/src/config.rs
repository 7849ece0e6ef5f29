use globset::Glob;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::Io(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Scheduler '{0}' not supported")]
    UnsupportedScheduler(String),
    #[error("Pattern '{pattern}' is invalid")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Glob was invalid")]
    InvalidGlob(#[from] globset::Error),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Failed to access file")]
    Io(#[from] Error),
    #[error("Failed to parse runner configuration")]
    Deserialize(#[from] serde_yaml::Error),
    #[error("Runner configuration failed the preflight checks")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct RunnerConfig {
    // size of the worker pool for scheduler calls, falls back to the number of CPUs
    pub threads: Option<usize>,
    // file name of the ledger inside the result directory
    pub ledger: String,
    // glob selecting unit configurations inside the numbered unit directories,
    // files named like the provenance copy if unset
    pub unit_glob: Option<String>,
    pub scheduler: SchedulerConfig,
    pub app: AppConfig,
    pub resources: ResourceLimits,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            threads: None,
            ledger: "status.csv".to_owned(),
            unit_glob: None,
            scheduler: SchedulerConfig::default(),
            app: AppConfig::default(),
            resources: ResourceLimits::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    // Name of the selected scheduler, see scheduler::load for the selection process
    pub name: String,
    pub submit_exec: PathBuf,
    pub accounting_exec: PathBuf,
    pub cancel_exec: PathBuf,
    // the first capture group of both submission patterns is the job id
    pub queued_pattern: String,
    pub allocated_pattern: String,
    pub completed_pattern: String,
    pub failed_pattern: String,
    // seconds until a scheduler command is killed, waits forever if unset
    pub timeout: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "slurm".to_owned(),
            submit_exec: PathBuf::from("srun"),
            accounting_exec: PathBuf::from("sacct"),
            cancel_exec: PathBuf::from("scancel"),
            queued_pattern: r"job (\d+) queued".to_owned(),
            allocated_pattern: r"job (\d+) has been allocated".to_owned(),
            completed_pattern: "COMPLETED".to_owned(),
            failed_pattern: "FAILED|TIMEOUT|OUT_OF_MEMORY|NODE_FAIL".to_owned(),
            timeout: None,
        }
    }
}

/// The analysis application started for every unit
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct AppConfig {
    pub exec: PathBuf,
    pub name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            exec: PathBuf::from("./turbofan/trunk/bin/abrun.sh"),
            name: "ModelMonitor3".to_owned(),
        }
    }
}

/// Limits requested for every submitted job, passed on verbatim
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct ResourceLimits {
    pub time: String,
    pub mem: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            time: "00:30:00".to_owned(),
            mem: "1g".to_owned(),
        }
    }
}

impl RunnerConfig {
    /// load the configuration from a YAML file, or the defaults if no file is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigErrors> {
        match path {
            Some(path) => {
                if !path.is_file() {
                    return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
                }

                Ok(serde_yaml::from_reader(File::open(path)?)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get)
    }

    /// Validate everything the submit pass depends on.
    /// Returns true if any problem was found, every problem is logged.
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.threads == Some(0) {
            error!("threads cannot be 0, remove it to use all CPUs");
            contains_error = true;
        }

        if self.ledger.is_empty() {
            error!("ledger must name a file inside the result directory");
            contains_error = true;
        }

        if let Some(Err(e)) = self.unit_glob.as_deref().map(Glob::new) {
            error!("unit_glob is invalid: {e}");
            contains_error = true;
        }

        if self.resources.time.trim().is_empty() || self.resources.mem.trim().is_empty() {
            error!("resources.time and resources.mem must not be empty");
            contains_error = true;
        }

        for (name, pattern, groups) in [
            ("queued_pattern", &self.scheduler.queued_pattern, 1),
            ("allocated_pattern", &self.scheduler.allocated_pattern, 1),
            ("completed_pattern", &self.scheduler.completed_pattern, 0),
            ("failed_pattern", &self.scheduler.failed_pattern, 0),
        ] {
            match Regex::new(pattern) {
                Ok(regex) => {
                    // captures_len includes the implicit group for the whole match
                    if regex.captures_len() <= groups {
                        error!("scheduler.{name} '{pattern}' needs a capture group for the job id");
                        contains_error = true;
                    }
                }
                Err(e) => {
                    error!("scheduler.{name} '{pattern}' is not a valid pattern: {e}");
                    contains_error = true;
                }
            }
        }

        if self.scheduler.timeout == Some(0) {
            warn!("scheduler.timeout is 0, every scheduler command will time out");
        }

        match check_executable(&self.app.exec) {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "app.exec ({}) is not executable",
                    self.app.exec.to_string_lossy()
                );
                contains_error = true;
            }
            Err(e) => {
                error!(
                    "Failed to determine if app.exec ({}) is an executable: {e}",
                    self.app.exec.to_string_lossy()
                );
                contains_error = true;
            }
        }

        contains_error
    }
}

/// compile a scheduler output pattern
pub fn compile_pattern(pattern: &str) -> Result<Regex, ConfigErrors> {
    Regex::new(pattern).map_err(|source| ConfigErrors::InvalidPattern {
        pattern: pattern.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};

    #[test]
    fn defaults_without_file() {
        let config = RunnerConfig::load(None).unwrap();

        assert_eq!(config.ledger, "status.csv");
        assert_eq!(config.unit_glob, None);
        assert_eq!(config.scheduler.name, "slurm");
        assert_eq!(config.resources, ResourceLimits::default());
        assert!(config.thread_count() >= 1);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: RunnerConfig = serde_yaml::from_str(
            "threads: 4\nscheduler:\n  timeout: 30\nresources:\n  mem: 4g\n",
        )
        .unwrap();

        assert_eq!(config.thread_count(), 4);
        assert_eq!(config.ledger, "status.csv");
        assert_eq!(config.scheduler.timeout, Some(30));
        assert_eq!(config.scheduler.submit_exec, PathBuf::from("srun"));
        assert_eq!(config.resources.mem, "4g");
        assert_eq!(config.resources.time, "00:30:00");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<RunnerConfig>("schedular: {}\n").is_err());
    }

    #[test]
    fn preflight_reports_problems() {
        let dir = tempfile::tempdir().unwrap();
        let exec = dir.path().join("abrun.sh");
        fs::write(&exec, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&exec, fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = RunnerConfig::load(None).unwrap();
        config.app.exec = exec.clone();
        assert!(!config.preflight_checks());

        config.unit_glob = Some("[unclosed".to_owned());
        assert!(config.preflight_checks());
        config.unit_glob = Some("*.conf".to_owned());
        assert!(!config.preflight_checks());

        config.scheduler.queued_pattern = "job queued".to_owned();
        assert!(config.preflight_checks());

        config.scheduler.queued_pattern = r"job (\d+) queued".to_owned();
        fs::set_permissions(&exec, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(config.preflight_checks());

        config.app.exec = dir.path().join("missing.sh");
        assert!(config.preflight_checks());
    }
}
