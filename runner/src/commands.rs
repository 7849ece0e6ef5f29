use crate::{
    appconf::{AppConf, AppConfError},
    config::{ConfigErrors, RunnerConfig},
    ledger::{
        self, lock::LedgerLock, JobRecord, Ledger, LedgerError, StatusCounts, SweepReport,
    },
    partition::{self, window::WindowError, PartitionError},
    scheduler::{Scheduler, SchedulerError, Submission},
};
use chrono::Local;
use globset::{Glob, GlobMatcher};
use ignore::WalkBuilder;
use itertools::Itertools;
use parking_lot::FairMutex;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{
    collections::HashSet,
    ffi::{OsStr, OsString},
    fmt, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// file name used for unit configurations when the base path has none
pub const DEFAULT_CONF_NAME: &str = "rose-app-expanded.conf";

#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("Failed to read the base configuration")]
    BaseConf(#[from] AppConfError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("Failed to start the worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Result directory {0} does not exist, run partition first")]
    NoResultDir(PathBuf),
    #[error("No unit configurations found in {0}, run partition first or check unit_glob")]
    NoUnits(PathBuf),
}

fn worker_pool(config: &RunnerConfig) -> Result<ThreadPool, CommandError> {
    let threads = config.thread_count();
    debug!("Starting thread pool with {threads} threads");

    Ok(ThreadPoolBuilder::new().num_threads(threads).build()?)
}

/// `result_YYYY-MM-DD_HH_MM_SS` in the current directory
pub fn timestamped_result_dir() -> PathBuf {
    PathBuf::from(format!(
        "result_{}",
        Local::now().format("%Y-%m-%d_%H_%M_%S")
    ))
}

#[derive(Debug, Clone)]
pub struct PartitionArgs {
    pub conf: PathBuf,
    pub result_dir: PathBuf,
    pub years_per_chunk: u32,
    pub clear: bool,
}

#[derive(Debug)]
pub struct PartitionReport {
    pub result_dir: PathBuf,
    pub units: Vec<PathBuf>,
    pub models: usize,
    pub diags: usize,
    pub disabled_models: Vec<String>,
    pub disabled_diags: Vec<String>,
    pub invalid_ranges: Vec<(String, WindowError)>,
}

impl fmt::Display for PartitionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} units from {} models x {} diagnostics written to {}",
            self.units.len(),
            self.models,
            self.diags,
            self.result_dir.to_string_lossy()
        )?;

        if !self.disabled_models.is_empty() {
            writeln!(f, "disabled models: {}", self.disabled_models.join(", "))?;
        }
        if !self.disabled_diags.is_empty() {
            writeln!(f, "disabled diagnostics: {}", self.disabled_diags.join(", "))?;
        }
        for (model, error) in self.invalid_ranges.iter() {
            writeln!(f, "skipped model {model}: {error}")?;
        }

        Ok(())
    }
}

/// Decompose the base configuration into unit configurations inside `result_dir`
#[instrument(skip(config), level = "info")]
pub fn partition_pass(
    config: &RunnerConfig,
    args: &PartitionArgs,
) -> Result<PartitionReport, CommandError> {
    let base = AppConf::read(&args.conf)?;
    let file_name = args
        .conf
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_CONF_NAME.to_owned());

    let models = base.model_names();
    let diags = base.diag_names();
    info!("Models: {}", models.iter().join(", "));
    info!("Diagnostics: {}", diags.iter().join(", "));
    info!("{} models x {} diagnostics", models.len(), diags.len());

    // nobody may submit, check or cancel while the batch is rewritten
    fs::create_dir_all(&args.result_dir).map_err(PartitionError::from)?;
    let _lock = LedgerLock::acquire(&args.result_dir.join(&config.ledger))?;

    if args.clear {
        partition::clear_result_dir(&args.result_dir, &file_name, &config.ledger)?;
    } else if args.result_dir.join(&config.ledger).exists() {
        warn!(
            dir = ?args.result_dir,
            "Result directory already holds a ledger, units in it will not be submitted again"
        );
    }

    let partition = partition::partition(
        &base,
        &models,
        &diags,
        args.years_per_chunk,
        &args.result_dir,
    )?;

    let pool = worker_pool(config)?;
    let units = pool.install(|| partition.persist(&base, &args.result_dir, &file_name))?;
    partition::remove_stale_units(&args.result_dir, units.len())?;

    info!("Wrote {} units", units.len());

    Ok(PartitionReport {
        result_dir: args.result_dir.clone(),
        units,
        models: models.len(),
        diags: diags.len(),
        disabled_models: partition.disabled_models,
        disabled_diags: partition.disabled_diags,
        invalid_ranges: partition.invalid_ranges,
    })
}

/// Selects unit configurations by file name
enum UnitMatcher {
    Glob(GlobMatcher),
    /// names of the provenance copies directly inside the result directory
    Provenance(HashSet<OsString>),
}

impl UnitMatcher {
    fn new(result_dir: &Path, config: &RunnerConfig) -> Result<Self, CommandError> {
        if let Some(glob) = config.unit_glob.as_deref() {
            let matcher = Glob::new(glob).map_err(ConfigErrors::from)?;
            return Ok(Self::Glob(matcher.compile_matcher()));
        }

        let lock_name = ledger::lock::lock_path(Path::new(&config.ledger)).into_os_string();
        let mut names = HashSet::new();

        for entry in fs::read_dir(result_dir).map_err(PartitionError::from)? {
            let entry = entry.map_err(PartitionError::from)?;
            let name = entry.file_name();

            if entry.file_type().map_err(PartitionError::from)?.is_file()
                && name != config.ledger.as_str()
                && name != lock_name
            {
                names.insert(name);
            }
        }

        Ok(Self::Provenance(names))
    }

    fn is_match(&self, name: &OsStr) -> bool {
        match self {
            Self::Glob(matcher) => matcher.is_match(name),
            Self::Provenance(names) => names.contains(name),
        }
    }
}

/// Unit configurations of `result_dir` as (reference relative to `result_dir`, path),
/// ordered by unit index.
///
/// Without `unit_glob` a unit configuration is a file in a numbered directory that shares
/// its name with the provenance copy partition wrote next to those directories.
pub fn discover_units(
    result_dir: &Path,
    config: &RunnerConfig,
) -> Result<Vec<(String, PathBuf)>, CommandError> {
    let matcher = UnitMatcher::new(result_dir, config)?;

    let units = WalkBuilder::new(result_dir)
        .standard_filters(false)
        .max_depth(Some(2))
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to search for unit configurations: {e}");
                None
            }
        })
        .filter(|entry| entry.depth() == 2)
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .filter(|entry| matcher.is_match(entry.file_name()))
        .filter_map(|entry| {
            let path = entry.into_path();
            let relative = path.strip_prefix(result_dir).ok()?;
            let unit_dir = relative.parent()?.to_str()?;

            if !partition::is_unit_dir_name(unit_dir) {
                return None;
            }

            let index = unit_dir.parse::<u64>().ok()?;
            let reference = relative.to_string_lossy().into_owned();

            Some((index, reference, path))
        })
        .sorted()
        .map(|(_, reference, path)| (reference, path))
        .collect_vec();

    Ok(units)
}

#[derive(Debug, Default)]
pub struct SubmitReport {
    pub submitted: Vec<(String, Submission)>,
    pub already_submitted: Vec<String>,
    pub failed: Vec<(String, SchedulerError)>,
    pub counts: Option<StatusCounts>,
}

impl fmt::Display for SubmitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} submitted, {} already submitted, {} failed",
            self.submitted.len(),
            self.already_submitted.len(),
            self.failed.len()
        )?;

        for (unit, error) in self.failed.iter() {
            writeln!(f, "failed {unit}: {error}")?;
        }
        if let Some(counts) = self.counts.as_ref() {
            writeln!(f, "{counts}")?;
        }

        Ok(())
    }
}

enum UnitOutcome {
    Submitted(String, Submission),
    AlreadySubmitted(String),
    Failed(String, SchedulerError),
}

/// Submit every unit of `result_dir` that has no ledger row yet
#[instrument(skip(config, scheduler), level = "info")]
pub fn submit_pass(
    config: &RunnerConfig,
    scheduler: &dyn Scheduler,
    result_dir: &Path,
) -> Result<SubmitReport, CommandError> {
    if !result_dir.is_dir() {
        return Err(CommandError::NoResultDir(result_dir.to_path_buf()));
    }

    let ledger = Ledger::open(&result_dir.join(&config.ledger))?;
    let units = discover_units(result_dir, config)?;
    if units.is_empty() {
        return Err(CommandError::NoUnits(result_dir.to_path_buf()));
    }
    info!("Found {} unit configurations", units.len());

    let mut report = SubmitReport::default();

    let (pending, done): (Vec<_>, Vec<_>) = units
        .into_iter()
        .partition(|(reference, _)| !ledger.contains(reference));

    for (reference, _) in done {
        debug!(unit = %reference, "Already submitted");
        report.already_submitted.push(reference);
    }

    let ledger = FairMutex::new(ledger);
    let pool = worker_pool(config)?;

    let outcomes = pool.install(|| {
        pending
            .into_par_iter()
            .map(|(reference, path)| -> Result<UnitOutcome, LedgerError> {
                let submission = match scheduler.submit(&path, &config.resources) {
                    Ok(submission) => submission,
                    Err(error) => {
                        error!(unit = %reference, error = %error, "Submission failed");
                        return Ok(UnitOutcome::Failed(reference, error));
                    }
                };
                let submitted_at = Local::now().naive_local();

                info!(
                    unit = %reference,
                    job_id = submission.job_id,
                    "Submitted, {}",
                    submission.status
                );

                let mut ledger = ledger.lock();
                match ledger.append(JobRecord::new(reference.clone(), submission, submitted_at)) {
                    Ok(()) => {
                        ledger.save()?;
                        Ok(UnitOutcome::Submitted(reference, submission))
                    }
                    Err(LedgerError::DuplicateUnit(_)) => {
                        Ok(UnitOutcome::AlreadySubmitted(reference))
                    }
                    Err(e) => Err(e),
                }
            })
            .collect::<Result<Vec<_>, _>>()
    })?;

    for outcome in outcomes {
        match outcome {
            UnitOutcome::Submitted(reference, submission) => {
                report.submitted.push((reference, submission))
            }
            UnitOutcome::AlreadySubmitted(reference) => report.already_submitted.push(reference),
            UnitOutcome::Failed(reference, error) => report.failed.push((reference, error)),
        }
    }

    let ledger = ledger.into_inner();
    // an empty batch still leaves a ledger for check and cancel
    ledger.save()?;
    report.counts = Some(ledger.counts());

    info!(
        "{} submitted, {} already submitted, {} failed",
        report.submitted.len(),
        report.already_submitted.len(),
        report.failed.len()
    );

    Ok(report)
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.counts)?;

        for (unit, error) in self.errors.iter() {
            writeln!(f, "failed {unit}: {error}")?;
        }

        Ok(())
    }
}

/// Poll every allocated job and record completions
#[instrument(skip(config, scheduler), level = "info")]
pub fn check_pass(
    config: &RunnerConfig,
    scheduler: &dyn Scheduler,
    result_dir: &Path,
) -> Result<SweepReport, CommandError> {
    let mut ledger = Ledger::open_existing(&result_dir.join(&config.ledger))?;
    let pool = worker_pool(config)?;

    Ok(pool.install(|| ledger.check(scheduler))?)
}

/// Cancel every queued or allocated job
#[instrument(skip(config, scheduler), level = "info")]
pub fn cancel_pass(
    config: &RunnerConfig,
    scheduler: &dyn Scheduler,
    result_dir: &Path,
) -> Result<SweepReport, CommandError> {
    let mut ledger = Ledger::open_existing(&result_dir.join(&config.ledger))?;
    let pool = worker_pool(config)?;

    Ok(pool.install(|| ledger.cancel(scheduler))?)
}
