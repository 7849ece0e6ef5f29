pub mod lock;

use crate::scheduler::{Scheduler, SchedulerError, Submission};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use indexmap::IndexMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::File,
    io::{Error, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub type JobId = i64;

/// job id recorded when the submission output could not be parsed
pub const UNKNOWN_JOB_ID: JobId = -1;

const HEADER: [&str; 5] = [
    "unit_reference",
    "job_id",
    "status",
    "submission_date",
    "submission_time",
];

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Failed to access the ledger")]
    Io(#[from] Error),
    #[error("Ledger is malformed")]
    Csv(#[from] csv::Error),
    #[error("Failed to replace the ledger")]
    Persist(#[from] tempfile::PersistError),
    #[error("No ledger at {0}, run submit first")]
    Missing(PathBuf),
    #[error("Ledger {0} is in use by another process")]
    Locked(PathBuf),
    #[error("Failed to lock the ledger")]
    Lock(#[source] nix::Error),
    #[error("Unit {0} was already submitted")]
    DuplicateUnit(String),
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Allocated,
    Completed,
    Cancelled,
    #[serde(alias = "UNKNOWN")]
    Unknown,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Allocated,
        JobStatus::Completed,
        JobStatus::Cancelled,
        JobStatus::Unknown,
    ];

    /// rows the check pass asks the accounting interface about
    pub fn is_pollable(self) -> bool {
        self == JobStatus::Allocated
    }

    pub fn is_cancellable(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Allocated)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::Allocated => "allocated",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Unknown => "unknown",
        };

        f.write_str(name)
    }
}

/// One row of the ledger
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct JobRecord {
    pub unit_reference: String,
    pub job_id: JobId,
    pub status: JobStatus,
    pub submission_date: NaiveDate,
    pub submission_time: NaiveTime,
}

impl JobRecord {
    pub fn new(unit_reference: String, submission: Submission, submitted_at: NaiveDateTime) -> Self {
        let time = submitted_at.time();

        Self {
            unit_reference,
            job_id: submission.job_id,
            status: submission.status,
            submission_date: submitted_at.date(),
            // whole seconds only, keeps the column HH:MM:SS
            submission_time: time.with_nanosecond(0).unwrap_or(time),
        }
    }
}

/// Number of rows per status, every status is present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCounts(IndexMap<JobStatus, usize>);

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> usize {
        self.0.get(&status).copied().unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (status, count)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{status}: {count}")?;
        }

        Ok(())
    }
}

/// Outcome of a check or cancel sweep over the ledger
#[derive(Debug)]
pub struct SweepReport {
    pub counts: StatusCounts,
    pub transitioned: usize,
    pub errors: Vec<(String, SchedulerError)>,
}

/// The persistent table of submitted units.
///
/// Holds the advisory lock for its whole lifetime; every mutation happens in memory and
/// becomes durable with [`Ledger::save`].
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    records: Vec<JobRecord>,
    _lock: lock::LedgerLock,
}

impl Ledger {
    /// open the ledger, starting an empty one if the file does not exist yet
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let lock = lock::LedgerLock::acquire(path)?;

        let records = if path.is_file() {
            Self::load(path)?
        } else {
            debug!("Starting new ledger at {}", path.to_string_lossy());
            Vec::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            records,
            _lock: lock,
        })
    }

    /// open a ledger that has to exist already
    pub fn open_existing(path: &Path) -> Result<Self, LedgerError> {
        if !path.is_file() {
            return Err(LedgerError::Missing(path.to_path_buf()));
        }

        Self::open(path)
    }

    fn load(path: &Path) -> Result<Vec<JobRecord>, LedgerError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(File::open(path)?);

        let records = reader
            .deserialize::<JobRecord>()
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Loaded {} rows from {}",
            records.len(),
            path.to_string_lossy()
        );

        Ok(records)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    pub fn contains(&self, unit_reference: &str) -> bool {
        self.records
            .iter()
            .any(|record| record.unit_reference == unit_reference)
    }

    /// add a row for a unit that has none yet
    pub fn append(&mut self, record: JobRecord) -> Result<(), LedgerError> {
        if self.contains(&record.unit_reference) {
            return Err(LedgerError::DuplicateUnit(record.unit_reference));
        }

        self.records.push(record);
        Ok(())
    }

    /// Atomically replace the file with the in-memory table
    pub fn save(&self) -> Result<(), LedgerError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut file = NamedTempFile::new_in(dir)?;
        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file.as_file_mut());

            writer.write_record(HEADER)?;
            for record in self.records.iter() {
                writer.serialize(record)?;
            }
            writer.flush()?;
        }
        file.flush()?;
        file.as_file().sync_all()?;
        file.persist(&self.path)?;

        Ok(())
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = JobStatus::ALL
            .into_iter()
            .map(|status| (status, 0))
            .collect::<IndexMap<_, _>>();

        for record in self.records.iter() {
            *counts.entry(record.status).or_default() += 1;
        }

        StatusCounts(counts)
    }

    /// Move every completed `allocated` row to `completed` and persist
    #[instrument(skip_all, fields(ledger = %self.path.to_string_lossy()))]
    pub fn check(&mut self, scheduler: &dyn Scheduler) -> Result<SweepReport, LedgerError> {
        self.sweep(
            scheduler,
            JobStatus::is_pollable,
            |scheduler, job_id| scheduler.poll(job_id),
            JobStatus::Completed,
        )
    }

    /// Cancel every `queued` or `allocated` row and persist
    #[instrument(skip_all, fields(ledger = %self.path.to_string_lossy()))]
    pub fn cancel(&mut self, scheduler: &dyn Scheduler) -> Result<SweepReport, LedgerError> {
        self.sweep(
            scheduler,
            JobStatus::is_cancellable,
            |scheduler, job_id| scheduler.cancel(job_id).map(|_| true),
            JobStatus::Cancelled,
        )
    }

    /// query the scheduler for all selected rows in parallel, apply the results serially
    fn sweep<S, C>(
        &mut self,
        scheduler: &dyn Scheduler,
        select: S,
        call: C,
        target: JobStatus,
    ) -> Result<SweepReport, LedgerError>
    where
        S: Fn(JobStatus) -> bool + Sync,
        C: Fn(&dyn Scheduler, JobId) -> Result<bool, SchedulerError> + Sync,
    {
        let results = self
            .records
            .par_iter()
            .enumerate()
            .filter(|(_, record)| select(record.status))
            .map(|(index, record)| (index, call(scheduler, record.job_id)))
            .collect::<Vec<_>>();

        let mut transitioned = 0;
        let mut errors = Vec::new();

        for (index, result) in results {
            let record = &mut self.records[index];

            match result {
                Ok(true) => {
                    debug!(
                        unit = %record.unit_reference,
                        job_id = record.job_id,
                        "{} -> {target}",
                        record.status
                    );
                    record.status = target;
                    transitioned += 1;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(
                        unit = %record.unit_reference,
                        job_id = record.job_id,
                        error = %error,
                        "Scheduler call failed, row unchanged"
                    );
                    errors.push((record.unit_reference.clone(), error));
                }
            }
        }

        self.save()?;

        let counts = self.counts();
        info!("{transitioned} rows now {target}, {counts}");

        Ok(SweepReport {
            counts,
            transitioned,
            errors,
        })
    }
}
