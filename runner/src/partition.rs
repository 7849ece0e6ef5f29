pub mod window;

use crate::appconf::{is_enabled, AppConf, AppConfError, Section, SectionKind, GENERAL};
use indexmap::IndexMap;
use itertools::Itertools;
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use window::{Window, WindowError};

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("The base configuration does not define any model section")]
    NoModels,
    #[error("The base configuration does not define any diagnostic section")]
    NoDiags,
    #[error("The number of years per chunk has to be at least 1")]
    ZeroChunk,
    #[error("No section found for {kind} '{name}'")]
    MissingSection { kind: &'static str, name: String },
    #[error("Failed to write unit configuration")]
    Write(#[from] AppConfError),
    #[error("Failed to prepare the result directory")]
    Io(#[from] std::io::Error),
}

/// (diagnostic, model, window) triple processed by one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOfWork {
    pub index: usize,
    pub diag: String,
    pub model: String,
    // None for models without a date range
    pub window: Option<Window>,
}

impl UnitOfWork {
    /// name of the per-unit directory inside the result directory
    pub fn dir_name(&self) -> String {
        unit_dir_name(self.index)
    }
}

pub fn unit_dir_name(index: usize) -> String {
    format!("{index:05}")
}

#[derive(Debug, Clone)]
pub struct Unit {
    pub work: UnitOfWork,
    pub conf: AppConf,
}

#[derive(Debug, Default)]
pub struct Partition {
    pub units: Vec<Unit>,
    pub disabled_models: Vec<String>,
    pub disabled_diags: Vec<String>,
    // models skipped because of a bad date range, all other models proceed
    pub invalid_ranges: Vec<(String, WindowError)>,
}

/// Copy of `base` without any model or diagnostic sections
pub fn template(base: &AppConf) -> AppConf {
    let mut template = AppConf::new();

    for (name, section) in base.sections() {
        match SectionKind::of(name) {
            SectionKind::Model(_) | SectionKind::Diag(_) => {}
            SectionKind::General | SectionKind::Other => {
                template.insert_section(name, section.clone())
            }
        }
    }

    // every unit needs exactly one general section
    template.section_mut(GENERAL);

    template
}

/// Resolve the date range of a model section. `Ok(None)` marks an undated model.
fn model_windows(
    name: &str,
    section: &Section,
    years_per_chunk: u32,
) -> Result<Option<Vec<Window>>, WindowError> {
    match (section.get("start_date"), section.get("end_date")) {
        (Some(start), Some(end)) => window::split(
            window::parse_date(start)?,
            window::parse_date(end)?,
            years_per_chunk,
        )
        .map(Some),
        (None, None) => Ok(None),
        _ => {
            warn!(
                model = name,
                "Model defines only one of start_date/end_date, treating it as undated"
            );

            Ok(None)
        }
    }
}

/// Decompose `base` into one configuration per (diagnostic, model, window).
///
/// Processor ids are assigned by enumerating diagnostics (outer), models and windows
/// (innermost) in the order of `diags` and `models`.
#[instrument(skip(base, models, diags), level = "debug")]
pub fn partition(
    base: &AppConf,
    models: &[String],
    diags: &[String],
    years_per_chunk: u32,
    result_dir: &Path,
) -> Result<Partition, PartitionError> {
    if models.is_empty() {
        return Err(PartitionError::NoModels);
    }

    if diags.is_empty() {
        return Err(PartitionError::NoDiags);
    }

    if years_per_chunk == 0 {
        return Err(PartitionError::ZeroChunk);
    }

    let model_sections: IndexMap<&str, &str> = base.models().into_iter().collect();
    let diag_sections: IndexMap<&str, &str> = base.diags().into_iter().collect();

    let mut partition = Partition::default();

    // enabled models with their windows, computed once for all diagnostics
    let mut enabled_models = Vec::with_capacity(models.len());

    for model in models {
        let section_name = *model_sections.get(model.as_str()).ok_or_else(|| {
            PartitionError::MissingSection {
                kind: "model",
                name: model.clone(),
            }
        })?;
        // the name was taken from the base configuration just above
        let Some(section) = base.section(section_name) else {
            continue;
        };

        if !is_enabled(section) {
            debug!(model = %model, "Model is disabled");
            partition.disabled_models.push(model.clone());
            continue;
        }

        match model_windows(model, section, years_per_chunk) {
            Ok(windows) => enabled_models.push((model, section_name, windows)),
            Err(error) => {
                warn!(model = %model, "Skipping model: {error}");
                partition.invalid_ranges.push((model.clone(), error));
            }
        }
    }

    let mut enabled_diags = Vec::with_capacity(diags.len());

    for diag in diags {
        let section_name = *diag_sections.get(diag.as_str()).ok_or_else(|| {
            PartitionError::MissingSection {
                kind: "diagnostic",
                name: diag.clone(),
            }
        })?;
        let Some(section) = base.section(section_name) else {
            continue;
        };

        if is_enabled(section) {
            enabled_diags.push((diag, section_name));
        } else {
            debug!(diag = %diag, "Diagnostic is disabled");
            partition.disabled_diags.push(diag.clone());
        }
    }

    let template = template(base);

    partition.units = enabled_diags
        .iter()
        .flat_map(|diag| {
            enabled_models.iter().flat_map(move |(model, model_section, windows)| {
                let windows = match windows {
                    Some(windows) => windows.iter().copied().map(Some).collect_vec(),
                    None => vec![None],
                };

                windows
                    .into_iter()
                    .map(move |window| (*diag, (*model, *model_section), window))
            })
        })
        .enumerate()
        .map(|(index, ((diag, diag_section), (model, model_section), window))| {
            let work = UnitOfWork {
                index,
                diag: diag.clone(),
                model: model.clone(),
                window,
            };
            let conf = unit_conf(base, &template, &work, model_section, diag_section, result_dir);

            Unit { work, conf }
        })
        .collect();

    info!(
        "Partitioned into {} units ({} models and {} diagnostics disabled, {} invalid date ranges)",
        partition.units.len(),
        partition.disabled_models.len(),
        partition.disabled_diags.len(),
        partition.invalid_ranges.len()
    );

    Ok(partition)
}

fn unit_conf(
    base: &AppConf,
    template: &AppConf,
    work: &UnitOfWork,
    model_section: &str,
    diag_section: &str,
    result_dir: &Path,
) -> AppConf {
    let mut conf = template.clone();

    let model = base.section(model_section);

    if let Some(section) = model {
        conf.insert_section(model_section, section.clone());
    }
    if let Some(window) = work.window {
        // the outer bounds keep the literal value of the base, time suffix included
        let literal = |key: &str| {
            model
                .and_then(|section| section.get(key))
                .and_then(|value| window::parse_date(value).ok())
        };

        if literal("start_date") != Some(window.start) {
            conf.set(model_section, "start_date", window.start.to_string());
        }
        if literal("end_date") != Some(window.end) {
            conf.set(model_section, "end_date", window.end.to_string());
        }
    }
    if let Some(section) = base.section(diag_section) {
        conf.insert_section(diag_section, section.clone());
    }

    let output_dir = result_dir.join(work.dir_name());
    conf.set(GENERAL, "processor_id", work.index.to_string());
    conf.set(GENERAL, "output_dir", output_dir.to_string_lossy());
    conf.set(GENERAL, "clear_netcdf_cache", "false");

    conf
}

impl Partition {
    /// Write every unit to `<result_dir>/<index>/<file_name>` and the provenance copy of
    /// `base` to `<result_dir>/<file_name>`.
    ///
    /// Units only touch their own directory, so they are written concurrently on the
    /// current rayon pool.
    #[instrument(skip(self, base), level = "info")]
    pub fn persist(
        &self,
        base: &AppConf,
        result_dir: &Path,
        file_name: &str,
    ) -> Result<Vec<PathBuf>, PartitionError> {
        fs::create_dir_all(result_dir)?;

        let paths = self
            .units
            .par_iter()
            .map(|unit| -> Result<PathBuf, PartitionError> {
                let dir = result_dir.join(unit.work.dir_name());
                fs::create_dir_all(&dir)?;

                let path = dir.join(file_name);
                unit.conf.write(&path)?;
                debug!(path = ?path, "Wrote unit {}", unit.work.index);

                Ok(path)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut provenance = base.clone();
        provenance.set(GENERAL, "output_dir", result_dir.to_string_lossy());
        provenance.write(&result_dir.join(file_name))?;

        Ok(paths)
    }
}

/// Remove the artifacts of a previous batch from `result_dir`: numbered unit
/// directories, the provenance copy and the ledger. The lock file stays, it may be held.
pub fn clear_result_dir(
    result_dir: &Path,
    file_name: &str,
    ledger_name: &str,
) -> Result<usize, PartitionError> {
    if !result_dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;

    for entry in fs::read_dir(result_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if entry.file_type()?.is_dir() && is_unit_dir_name(&name) {
            fs::remove_dir_all(entry.path())?;
            removed += 1;
        } else if name == file_name || name == ledger_name {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }

    info!(dir = ?result_dir, "Removed {removed} entries of a previous batch");

    Ok(removed)
}

/// Remove numbered unit directories with an index of at least `keep`, left behind by a
/// larger earlier batch.
pub fn remove_stale_units(result_dir: &Path, keep: usize) -> Result<usize, PartitionError> {
    let mut removed = 0;

    for entry in fs::read_dir(result_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if !entry.file_type()?.is_dir() || !is_unit_dir_name(&name) {
            continue;
        }

        // indices too large for usize are stale as well
        if name.parse::<usize>().map_or(true, |index| index >= keep) {
            fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }

    if removed > 0 {
        warn!(dir = ?result_dir, "Removed {removed} unit directories of a previous batch");
    }

    Ok(removed)
}

pub fn is_unit_dir_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|byte| byte.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    const BASE: &str = "\
[command]
default=abrun.sh ModelMonitor3

[general]
output_dir=/somewhere/else
clear_netcdf_cache=true

[namelist:models(A)]
enabled=true
start_date=2000-01-01
end_date=2005-01-01

[namelist:models(B)]
enabled=false
start_date=2000-01-01
end_date=2010-01-01

[namelist:models(C)]
label=undated

[namelist:diags(X)]
enabled=true

[namelist:diags(Y)]
enabled=.false.

[namelist:diags(Z)]
statistic=mean
";

    fn run(base: &AppConf, years: u32, result_dir: &Path) -> Partition {
        partition(
            base,
            &base.model_names(),
            &base.diag_names(),
            years,
            result_dir,
        )
        .unwrap()
    }

    #[test]
    fn template_drops_models_and_diags() {
        let base: AppConf = BASE.parse().unwrap();
        let names: Vec<_> = template(&base)
            .sections()
            .map(|(name, _)| name.clone())
            .collect();

        assert_eq!(names, vec!["command", "general"]);
    }

    #[test]
    fn single_model_scenario() {
        let base: AppConf = "\
[general]
[model(A)]
start_date=2000-01-01
end_date=2005-01-01
[model(B)]
enabled=false
start_date=2000-01-01
end_date=2005-01-01
[diag(X)]
enabled=true
"
        .parse()
        .unwrap();

        let partition = run(&base, 2, Path::new("/results"));

        assert_eq!(partition.units.len(), 3);
        assert_eq!(partition.disabled_models, vec!["B"]);
        assert!(partition.disabled_diags.is_empty());

        let windows: Vec<_> = partition
            .units
            .iter()
            .map(|unit| {
                let window = unit.work.window.unwrap();
                (window.start.to_string(), window.end.to_string())
            })
            .collect();
        assert_eq!(
            windows,
            vec![
                ("2000-01-01".to_owned(), "2002-01-01".to_owned()),
                ("2002-01-01".to_owned(), "2004-01-01".to_owned()),
                ("2004-01-01".to_owned(), "2005-01-01".to_owned()),
            ]
        );
        assert!(partition.units.iter().all(|unit| unit.work.model == "A"));
    }

    #[test]
    fn units_follow_diag_model_window_order() {
        let base: AppConf = BASE.parse().unwrap();
        let partition = run(&base, 2, Path::new("/results"));

        let order: Vec<_> = partition
            .units
            .iter()
            .map(|unit| (unit.work.index, unit.work.diag.as_str(), unit.work.model.as_str()))
            .collect();

        // X x {A (3 windows), C (undated)}, then Z x {A, C}
        assert_eq!(
            order,
            vec![
                (0, "X", "A"),
                (1, "X", "A"),
                (2, "X", "A"),
                (3, "X", "C"),
                (4, "Z", "A"),
                (5, "Z", "A"),
                (6, "Z", "A"),
                (7, "Z", "C"),
            ]
        );
        assert_eq!(partition.disabled_models, vec!["B"]);
        assert_eq!(partition.disabled_diags, vec!["Y"]);
    }

    #[test]
    fn unit_count_matches_enabled_grid() {
        let base: AppConf = BASE.parse().unwrap();

        for years in 1..8 {
            let partition = run(&base, years, Path::new("/results"));
            let windows_a = window::split(
                window::parse_date("2000-01-01").unwrap(),
                window::parse_date("2005-01-01").unwrap(),
                years,
            )
            .unwrap()
            .len();

            // two enabled diagnostics, model A windowed and model C undated
            assert_eq!(partition.units.len(), 2 * (windows_a + 1));
        }
    }

    #[test]
    fn units_are_self_contained() {
        let base: AppConf = BASE.parse().unwrap();
        let partition = run(&base, 2, Path::new("/results"));

        let mut output_dirs = BTreeSet::new();

        for unit in partition.units.iter() {
            let kinds: Vec<_> = unit
                .conf
                .sections()
                .map(|(name, _)| SectionKind::of(name))
                .collect();

            assert_eq!(kinds.iter().filter(|k| **k == SectionKind::General).count(), 1);
            assert_eq!(
                kinds.iter().filter(|k| matches!(k, SectionKind::Model(_))).count(),
                1
            );
            assert_eq!(
                kinds.iter().filter(|k| matches!(k, SectionKind::Diag(_))).count(),
                1
            );
            assert_eq!(
                unit.conf.get("command", "default"),
                Some("abrun.sh ModelMonitor3")
            );
            assert_eq!(
                unit.conf.get(GENERAL, "processor_id"),
                Some(unit.work.index.to_string().as_str())
            );
            assert_eq!(unit.conf.get(GENERAL, "clear_netcdf_cache"), Some("false"));

            output_dirs.insert(unit.conf.get(GENERAL, "output_dir").unwrap().to_owned());
        }

        assert_eq!(output_dirs.len(), partition.units.len());
        assert_eq!(
            partition.units[1].conf.get(GENERAL, "output_dir"),
            Some("/results/00001")
        );
        assert_eq!(
            partition.units[1].conf.get("namelist:models(A)", "start_date"),
            Some("2002-01-01")
        );
        // undated models are copied verbatim
        assert_eq!(partition.units[3].conf.get("namelist:models(C)", "start_date"), None);
    }

    #[test]
    fn partition_is_reproducible() {
        let base: AppConf = BASE.parse().unwrap();
        let first = run(&base, 3, Path::new("/results"));
        let second = run(&base, 3, Path::new("/results"));

        assert_eq!(first.units.len(), second.units.len());

        for (a, b) in first.units.iter().zip(second.units.iter()) {
            assert_eq!(a.work, b.work);
            assert_eq!(a.conf, b.conf);
        }
    }

    #[test]
    fn invalid_range_only_skips_that_model() {
        let base: AppConf = "\
[general]
[model(good)]
start_date=2000-01-01
end_date=2002-01-01
[model(reversed)]
start_date=2010-01-01
end_date=2000-01-01
[model(garbled)]
start_date=yesterday
end_date=2000-01-01
[diag(X)]
"
        .parse()
        .unwrap();

        let partition = run(&base, 1, Path::new("/results"));

        assert_eq!(partition.units.len(), 2);
        assert!(partition.units.iter().all(|unit| unit.work.model == "good"));

        let invalid: Vec<_> = partition
            .invalid_ranges
            .iter()
            .map(|(model, _)| model.as_str())
            .collect();
        assert_eq!(invalid, vec!["reversed", "garbled"]);
    }

    #[test]
    fn configuration_errors() {
        let no_models: AppConf = "[general]\n[diag(X)]\n".parse().unwrap();
        assert!(matches!(
            partition(&no_models, &[], &no_models.diag_names(), 1, Path::new("/r")),
            Err(PartitionError::NoModels)
        ));

        let no_diags: AppConf = "[general]\n[model(A)]\n".parse().unwrap();
        assert!(matches!(
            partition(&no_diags, &no_diags.model_names(), &[], 1, Path::new("/r")),
            Err(PartitionError::NoDiags)
        ));

        assert!(matches!(
            partition(
                &no_diags,
                &["missing".to_owned()],
                &["X".to_owned()],
                1,
                Path::new("/r")
            ),
            Err(PartitionError::MissingSection { kind: "model", .. })
        ));
    }

    #[test]
    fn persist_writes_units_and_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let result_dir = dir.path().join("result");
        let base: AppConf = BASE.parse().unwrap();
        let partition = run(&base, 5, &result_dir);

        let paths = partition
            .persist(&base, &result_dir, "rose-app-expanded.conf")
            .unwrap();

        assert_eq!(paths.len(), partition.units.len());
        assert_eq!(paths[0], result_dir.join("00000/rose-app-expanded.conf"));

        let written = AppConf::read(&paths[1]).unwrap();
        assert_eq!(written, partition.units[1].conf);

        let provenance = AppConf::read(&result_dir.join("rose-app-expanded.conf")).unwrap();
        assert_eq!(
            provenance.get(GENERAL, "output_dir"),
            Some(result_dir.to_string_lossy().as_ref())
        );
        assert_eq!(provenance.model_names(), base.model_names());

        fs::write(result_dir.join("status.csv"), "unit_reference\n").unwrap();
        fs::write(result_dir.join("notes.txt"), "keep me").unwrap();

        let removed =
            clear_result_dir(&result_dir, "rose-app-expanded.conf", "status.csv").unwrap();

        assert_eq!(removed, partition.units.len() + 2);
        assert!(result_dir.join("notes.txt").exists());
        assert!(!result_dir.join("00000").exists());
    }

    #[test]
    fn zero_years_per_chunk_is_rejected() {
        let base: AppConf = BASE.parse().unwrap();

        assert!(matches!(
            partition(
                &base,
                &base.model_names(),
                &base.diag_names(),
                0,
                Path::new("/r")
            ),
            Err(PartitionError::ZeroChunk)
        ));
    }

    #[test]
    fn outer_bounds_keep_literal_values() {
        let base: AppConf = "\
[namelist:models(A)]
start_date=2000-01-01T00:00:00
end_date=2005-06-30T12:00:00

[namelist:diags(X)]
"
        .parse()
        .unwrap();
        let partition = run(&base, 2, Path::new("/r"));
        let dates = partition
            .units
            .iter()
            .map(|unit| {
                (
                    unit.conf.get("namelist:models(A)", "start_date").unwrap(),
                    unit.conf.get("namelist:models(A)", "end_date").unwrap(),
                )
            })
            .collect::<Vec<_>>();

        assert_eq!(
            dates,
            vec![
                ("2000-01-01T00:00:00", "2002-01-01"),
                ("2002-01-01", "2004-01-01"),
                ("2004-01-01", "2005-06-30T12:00:00"),
            ]
        );
    }

    #[test]
    fn stale_units_of_a_larger_batch_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let result_dir = dir.path().join("result");
        let base: AppConf = BASE.parse().unwrap();

        let larger = run(&base, 1, &result_dir);
        larger
            .persist(&base, &result_dir, "rose-app-expanded.conf")
            .unwrap();
        fs::write(result_dir.join("notes.txt"), "keep me").unwrap();

        let smaller = run(&base, 5, &result_dir);
        assert!(smaller.units.len() < larger.units.len());
        smaller
            .persist(&base, &result_dir, "rose-app-expanded.conf")
            .unwrap();

        let removed = remove_stale_units(&result_dir, smaller.units.len()).unwrap();

        assert_eq!(removed, larger.units.len() - smaller.units.len());
        let left = fs::read_dir(&result_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| is_unit_dir_name(name))
            .count();
        assert_eq!(left, smaller.units.len());
        assert!(result_dir.join("notes.txt").exists());
    }

    #[test]
    fn clear_keeps_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let result_dir = dir.path().join("result");
        fs::create_dir_all(result_dir.join("00000")).unwrap();
        fs::write(result_dir.join("status.csv"), "unit_reference\n").unwrap();
        fs::write(result_dir.join("status.csv.lock"), "").unwrap();

        let removed =
            clear_result_dir(&result_dir, "rose-app-expanded.conf", "status.csv").unwrap();

        assert_eq!(removed, 2);
        assert!(result_dir.join("status.csv.lock").exists());
    }
}
