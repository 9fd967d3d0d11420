//! Multi-source table joiner.
//!
//! Loads the 12 feature tables and the target table, then for every
//! catalog site aligns its 13 series on a shared time index and keeps only
//! the time steps where all 13 values are real observations. Per-site rows
//! are concatenated in catalog order into a single [`Corpus`].
//!
//! Completeness is all-or-nothing per row: one sentinel or gap in any
//! column drops the whole time step for that site.

use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::ingest::table::{SeriesReader, TimeSeriesTable};
use crate::logging::{self, Stage};
use crate::model::{
    Corpus, FEATURE_COUNT, FEATURE_SCHEMA, FeatureVariable, JoinError, JoinedRow,
    STRESS_UPPER_BOUND, SeriesForm, TARGET_COLUMN, is_sentinel,
};

/// Columns per aligned row: features then target.
const ROW_WIDTH: usize = FEATURE_COUNT + 1;

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Absolute and anomaly table paths for one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSource {
    pub absolute: PathBuf,
    pub anomaly: PathBuf,
}

impl VariableSource {
    pub fn path(&self, form: SeriesForm) -> &Path {
        match form {
            SeriesForm::Absolute => &self.absolute,
            SeriesForm::Anomaly => &self.anomaly,
        }
    }
}

/// Every input table for one training run.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSources {
    pub variables: HashMap<FeatureVariable, VariableSource>,
    pub target: PathBuf,
}

impl DataSources {
    pub fn new(target: PathBuf) -> Self {
        Self {
            variables: HashMap::new(),
            target,
        }
    }

    pub fn insert(&mut self, variable: FeatureVariable, absolute: PathBuf, anomaly: PathBuf) {
        self.variables
            .insert(variable, VariableSource { absolute, anomaly });
    }

    pub fn get(&self, variable: FeatureVariable) -> Option<&VariableSource> {
        self.variables.get(&variable)
    }

    /// Every schema slot must resolve to a source, and no file may back
    /// two different slots.
    pub fn validate(&self) -> Result<(), JoinError> {
        let mut seen: HashMap<&Path, String> = HashMap::new();
        seen.insert(self.target.as_path(), TARGET_COLUMN.to_string());

        for slot in FEATURE_SCHEMA.iter() {
            let source = self.get(slot.variable).ok_or_else(|| {
                JoinError::InvalidSchema(format!("no source for variable {}", slot.variable))
            })?;
            let path = source.path(slot.form);
            if let Some(previous) = seen.insert(path, slot.column_name()) {
                return Err(JoinError::InvalidSchema(format!(
                    "{} is used for both {} and {}",
                    path.display(),
                    previous,
                    slot.column_name()
                )));
            }
        }
        Ok(())
    }

    /// `(column name, path)` for the 12 feature slots in schema order.
    pub fn feature_paths(&self) -> Result<Vec<(String, PathBuf)>, JoinError> {
        FEATURE_SCHEMA
            .iter()
            .map(|slot| {
                self.get(slot.variable)
                    .map(|s| (slot.column_name(), s.path(slot.form).to_path_buf()))
                    .ok_or_else(|| {
                        JoinError::InvalidSchema(format!(
                            "no source for variable {}",
                            slot.variable
                        ))
                    })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Join report
// ---------------------------------------------------------------------------

/// Row accounting for one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteJoinStats {
    pub site_id: String,
    /// Distinct time steps across the site's 13 series.
    pub aligned_steps: usize,
    pub retained_rows: usize,
}

impl SiteJoinStats {
    pub fn dropped_rows(&self) -> usize {
        self.aligned_steps - self.retained_rows
    }
}

#[derive(Debug, Clone, Default)]
pub struct JoinReport {
    pub sites: Vec<SiteJoinStats>,
    /// Target values that were above the stress bound and clamped.
    pub clamped_targets: usize,
}

impl JoinReport {
    pub fn contributing_sites(&self) -> usize {
        self.sites.iter().filter(|s| s.retained_rows > 0).count()
    }

    pub fn total_rows(&self) -> usize {
        self.sites.iter().map(|s| s.retained_rows).sum()
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// The 13 loaded tables, named and in column order.
pub struct LoadedTables {
    pub features: Vec<(String, TimeSeriesTable)>,
    pub target: TimeSeriesTable,
    pub clamped_targets: usize,
}

/// Load every source through `reader`. The target table comes back already
/// clamped to the stress upper bound.
pub fn load_tables(
    sources: &DataSources,
    reader: &dyn SeriesReader,
) -> Result<LoadedTables, JoinError> {
    sources.validate()?;

    let mut features = Vec::with_capacity(FEATURE_COUNT);
    for (name, path) in sources.feature_paths()? {
        logging::info(Stage::Join, Some(&name), &format!("var under process: {}", name));
        let table = read_source(reader, &name, &path)?;
        features.push((name, table));
    }

    logging::info(
        Stage::Join,
        Some(TARGET_COLUMN),
        &format!("var under process: {}", TARGET_COLUMN),
    );
    let mut target = read_source(reader, TARGET_COLUMN, &sources.target)?;
    let clamped_targets = clamp_stress(&mut target);
    if clamped_targets > 0 {
        logging::debug(
            Stage::Join,
            Some(TARGET_COLUMN),
            &format!("clamped {} target values above {}", clamped_targets, STRESS_UPPER_BOUND),
        );
    }

    Ok(LoadedTables {
        features,
        target,
        clamped_targets,
    })
}

fn read_source(
    reader: &dyn SeriesReader,
    variable: &str,
    path: &Path,
) -> Result<TimeSeriesTable, JoinError> {
    reader.read_series(path).map_err(|reason| {
        let err = JoinError::SourceUnreadable {
            variable: variable.to_string(),
            path: path.to_path_buf(),
            reason,
        };
        logging::log_join_failure(variable, "load", &err);
        err
    })
}

/// Cap stress at the upper bound. Returns how many values changed.
/// Sentinels and gaps are below the bound (or NaN) and pass through.
pub fn clamp_stress(table: &mut TimeSeriesTable) -> usize {
    let clamped = table.count_where(|v| v > STRESS_UPPER_BOUND);
    table.map_values(|v| if v > STRESS_UPPER_BOUND { STRESS_UPPER_BOUND } else { v });
    clamped
}

// ---------------------------------------------------------------------------
// Per-site alignment
// ---------------------------------------------------------------------------

/// Outer-align one site's 13 series on the union of their timestamps.
/// Slots with no value at a timestamp stay `None`.
fn align_site(
    site: &str,
    tables: &LoadedTables,
) -> Result<BTreeMap<NaiveDateTime, [Option<f64>; ROW_WIDTH]>, JoinError> {
    let mut aligned: BTreeMap<NaiveDateTime, [Option<f64>; ROW_WIDTH]> = BTreeMap::new();

    let columns = tables
        .features
        .iter()
        .map(|(name, table)| (name.as_str(), table))
        .chain(std::iter::once((TARGET_COLUMN, &tables.target)));

    for (slot, (name, table)) in columns.enumerate() {
        let series = table.site_series(site).ok_or_else(|| {
            let err = JoinError::SiteMissing {
                site: site.to_string(),
                variable: name.to_string(),
            };
            logging::log_join_failure(site, "align", &err);
            err
        })?;
        for (time, value) in series {
            aligned.entry(time).or_insert([None; ROW_WIDTH])[slot] = Some(value);
        }
    }

    Ok(aligned)
}

/// Missing cells and sentinel placeholders both count as absent.
fn observed(value: Option<f64>) -> Option<f64> {
    value.filter(|v| !v.is_nan() && !is_sentinel(*v))
}

/// Complete rows for one site, in time order.
pub fn join_site(site: &str, tables: &LoadedTables) -> Result<(Vec<JoinedRow>, SiteJoinStats), JoinError> {
    let aligned = align_site(site, tables)?;
    let aligned_steps = aligned.len();

    let rows: Vec<JoinedRow> = aligned
        .into_iter()
        .filter_map(|(time, slots)| {
            let mut values = [0.0; ROW_WIDTH];
            for (out, value) in values.iter_mut().zip(slots) {
                *out = observed(value)?;
            }

            let mut features = [0.0; FEATURE_COUNT];
            features.copy_from_slice(&values[..FEATURE_COUNT]);
            Some(JoinedRow {
                site_id: site.to_string(),
                time,
                features,
                target: values[FEATURE_COUNT],
            })
        })
        .collect();

    let stats = SiteJoinStats {
        site_id: site.to_string(),
        aligned_steps,
        retained_rows: rows.len(),
    };
    Ok((rows, stats))
}

// ---------------------------------------------------------------------------
// Corpus assembly
// ---------------------------------------------------------------------------

/// Join already-loaded tables for every site in `sites`.
pub fn join_tables(sites: &[String], tables: &LoadedTables) -> Result<(Corpus, JoinReport), JoinError> {
    let mut corpus = Corpus::default();
    let mut report = JoinReport {
        clamped_targets: tables.clamped_targets,
        ..JoinReport::default()
    };

    for site in sites {
        logging::debug(Stage::Join, Some(site), "site under process");
        let (rows, stats) = join_site(site, tables)?;

        if rows.is_empty() {
            logging::warn(
                Stage::Join,
                Some(site),
                &format!("no complete rows out of {} time steps", stats.aligned_steps),
            );
        } else if stats.dropped_rows() > 0 {
            logging::debug(
                Stage::Join,
                Some(site),
                &format!(
                    "kept {}/{} time steps",
                    stats.retained_rows, stats.aligned_steps
                ),
            );
        }

        corpus.rows.extend(rows);
        report.sites.push(stats);
    }

    logging::log_join_summary(sites.len(), report.contributing_sites(), corpus.len());

    if corpus.is_empty() {
        return Err(JoinError::EmptyCorpus { sites: sites.len() });
    }

    Ok((corpus, report))
}

/// Load every source and join all `sites` into one corpus.
pub fn join_corpus(
    sources: &DataSources,
    sites: &[String],
    reader: &dyn SeriesReader,
) -> Result<(Corpus, JoinReport), JoinError> {
    let tables = load_tables(sources, reader)?;
    let joined = join_tables(sites, &tables)?;
    logging::info(
        Stage::Join,
        None,
        &format!("corpus shape: ({}, {})", joined.0.len(), ROW_WIDTH),
    );
    Ok(joined)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2012, 5, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            + chrono::Duration::days(d as i64)
    }

    /// In-memory reader keyed by path.
    struct MemoryReader(HashMap<PathBuf, TimeSeriesTable>);

    impl SeriesReader for MemoryReader {
        fn read_series(&self, path: &Path) -> Result<TimeSeriesTable, String> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| format!("{} not found", path.display()))
        }
    }

    fn sources() -> DataSources {
        let mut sources = DataSources::new(PathBuf::from("str.csv"));
        for variable in FeatureVariable::ALL {
            sources.insert(
                variable,
                PathBuf::from(format!("{}.csv", variable.code())),
                PathBuf::from(format!("{}_anomaly.csv", variable.code())),
            );
        }
        sources
    }

    /// Every feature table holds `feature` for each site; target holds `target`.
    fn reader_with(
        steps: usize,
        feature: impl Fn(&str, usize, usize) -> f64,
        target: impl Fn(&str, usize) -> f64,
        sites: &[&str],
    ) -> MemoryReader {
        let index: Vec<_> = (0..steps as u32).map(day).collect();
        let sources = sources();
        let mut tables = HashMap::new();

        for (column, (_, path)) in sources.feature_paths().unwrap().into_iter().enumerate() {
            let cols = sites
                .iter()
                .map(|s| (s.to_string(), (0..steps).map(|t| feature(*s, column, t)).collect()))
                .collect();
            tables.insert(path, TimeSeriesTable::new(index.clone(), cols).unwrap());
        }
        let cols = sites
            .iter()
            .map(|s| (s.to_string(), (0..steps).map(|t| target(*s, t)).collect()))
            .collect();
        tables.insert(sources.target.clone(), TimeSeriesTable::new(index, cols).unwrap());

        MemoryReader(tables)
    }

    fn site_list(sites: &[&str]) -> Vec<String> {
        sites.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sentinel_rows_are_dropped_for_one_site() {
        // 10 steps, steps 3 and 7 carry -999.0 in one feature column
        let reader = reader_with(
            10,
            |_, column, t| if column == 4 && (t == 3 || t == 7) { -999.0 } else { 1.0 + t as f64 },
            |_, _| 0.5,
            &["US-Var"],
        );

        let (corpus, report) = join_corpus(&sources(), &site_list(&["US-Var"]), &reader).unwrap();
        assert_eq!(corpus.len(), 8);
        assert_eq!(report.sites[0].aligned_steps, 10);
        assert_eq!(report.sites[0].dropped_rows(), 2);
        assert!(corpus.rows.iter().all(|r| r.time != day(3) && r.time != day(7)));
    }

    #[test]
    fn test_sentinel_in_target_or_gap_drops_row() {
        let reader = reader_with(
            5,
            |_, column, t| if column == 11 && t == 1 { f64::NAN } else { 2.0 },
            |_, t| if t == 4 { -9999.0 } else { 0.3 },
            &["US-Var"],
        );

        let (corpus, _) = join_corpus(&sources(), &site_list(&["US-Var"]), &reader).unwrap();
        let times: Vec<_> = corpus.rows.iter().map(|r| r.time).collect();
        assert_eq!(times, vec![day(0), day(2), day(3)]);
    }

    #[test]
    fn test_targets_above_one_are_clamped() {
        let reader = reader_with(4, |_, _, _| 1.0, |_, t| [0.4, 1.0, 1.7, 12.0][t], &["US-Var"]);

        let (corpus, report) = join_corpus(&sources(), &site_list(&["US-Var"]), &reader).unwrap();
        let targets: Vec<_> = corpus.rows.iter().map(|r| r.target).collect();
        assert_eq!(targets, vec![0.4, 1.0, 1.0, 1.0]);
        assert_eq!(report.clamped_targets, 2);
    }

    #[test]
    fn test_features_land_in_schema_order() {
        let reader = reader_with(1, |_, column, _| column as f64 + 1.0, |_, _| 0.9, &["US-Var"]);

        let (corpus, _) = join_corpus(&sources(), &site_list(&["US-Var"]), &reader).unwrap();
        let expected: Vec<f64> = (1..=12).map(|c| c as f64).collect();
        assert_eq!(corpus.rows[0].features.to_vec(), expected);
        assert_eq!(corpus.rows[0].target, 0.9);
    }

    #[test]
    fn test_empty_site_contributes_nothing_but_does_not_abort() {
        let reader = reader_with(
            6,
            |site, _, _| if site == "AU-Stp" { -9999.0 } else { 1.0 },
            |_, _| 0.5,
            &["US-Var", "AU-Stp", "DE-Gri"],
        );

        let sites = site_list(&["US-Var", "AU-Stp", "DE-Gri"]);
        let (corpus, report) = join_corpus(&sources(), &sites, &reader).unwrap();
        assert_eq!(corpus.len(), 12);
        assert!(corpus.rows.iter().all(|r| r.site_id != "AU-Stp"));
        assert_eq!(report.contributing_sites(), 2);
        assert_eq!(report.total_rows(), corpus.len());

        // Site order then time order
        assert_eq!(corpus.rows[0].site_id, "US-Var");
        assert_eq!(corpus.rows[6].site_id, "DE-Gri");
    }

    #[test]
    fn test_only_sites_in_list_are_joined() {
        let reader = reader_with(3, |_, _, _| 1.0, |_, _| 0.5, &["US-Var", "DE-Gri"]);
        let (corpus, _) = join_corpus(&sources(), &site_list(&["DE-Gri"]), &reader).unwrap();
        assert_eq!(corpus.len(), 3);
        assert!(corpus.rows.iter().all(|r| r.site_id == "DE-Gri"));
    }

    #[test]
    fn test_misaligned_time_indexes_keep_only_common_steps() {
        let sources = sources();
        let mut reader = reader_with(5, |_, _, _| 1.0, |_, _| 0.5, &["US-Var"]);

        // Shift the vpd anomaly table by two days: only 3 steps overlap
        let shifted: Vec<_> = (2..7).map(day).collect();
        let vpd_anm = sources.get(FeatureVariable::Vpd).unwrap().anomaly.clone();
        reader.0.insert(
            vpd_anm,
            TimeSeriesTable::new(shifted, vec![("US-Var".to_string(), vec![1.0; 5])]).unwrap(),
        );

        let (corpus, report) = join_corpus(&sources, &site_list(&["US-Var"]), &reader).unwrap();
        assert_eq!(report.sites[0].aligned_steps, 7);
        assert_eq!(corpus.len(), 3);
    }

    #[test]
    fn test_all_sites_empty_is_error() {
        let reader = reader_with(3, |_, _, _| -9999.0, |_, _| 0.5, &["US-Var"]);
        let err = join_corpus(&sources(), &site_list(&["US-Var"]), &reader).unwrap_err();
        assert!(matches!(err, JoinError::EmptyCorpus { sites: 1 }));
    }

    #[test]
    fn test_unreadable_source_names_variable() {
        let mut reader = reader_with(3, |_, _, _| 1.0, |_, _| 0.5, &["US-Var"]);
        reader.0.remove(&PathBuf::from("swi_anomaly.csv"));

        match join_corpus(&sources(), &site_list(&["US-Var"]), &reader) {
            Err(JoinError::SourceUnreadable { variable, .. }) => assert_eq!(variable, "swianm"),
            other => panic!("expected SourceUnreadable, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_site_absent_from_table_is_error() {
        let reader = reader_with(3, |_, _, _| 1.0, |_, _| 0.5, &["US-Var"]);
        let err = join_corpus(&sources(), &site_list(&["XX-Nop"]), &reader).unwrap_err();
        assert!(matches!(err, JoinError::SiteMissing { ref site, .. } if site == "XX-Nop"));
    }

    /// Builds every table at read time from one site's raw columns, the
    /// way a file-backed reader does.
    struct RawColumnReader {
        index: Vec<NaiveDateTime>,
        feature: Vec<f64>,
        target: Vec<f64>,
        target_path: PathBuf,
    }

    impl SeriesReader for RawColumnReader {
        fn read_series(&self, path: &Path) -> Result<TimeSeriesTable, String> {
            let values = if path == self.target_path { &self.target } else { &self.feature };
            TimeSeriesTable::new(self.index.clone(), vec![("US-Var".to_string(), values.clone())])
        }
    }

    #[test]
    fn test_repeated_time_steps_fail_instead_of_collapsing() {
        let sources = sources();
        let reader = RawColumnReader {
            index: vec![day(0), day(0), day(1)],
            feature: vec![1.0, 2.0, 3.0],
            target: vec![0.3, 0.9, 0.5],
            target_path: sources.target.clone(),
        };

        match join_corpus(&sources, &site_list(&["US-Var"]), &reader) {
            Err(JoinError::SourceUnreadable { variable, reason, .. }) => {
                assert_eq!(variable, "ate");
                assert!(reason.contains("duplicate time step"), "{}", reason);
            }
            other => panic!("expected SourceUnreadable, got {:?}", other.map(|(c, _)| c.len())),
        }
    }

    #[test]
    fn test_unique_time_steps_keep_every_complete_row() {
        let sources = sources();
        let reader = RawColumnReader {
            index: vec![day(0), day(1), day(2)],
            feature: vec![1.0, 2.0, 3.0],
            target: vec![0.3, 0.9, 0.5],
            target_path: sources.target.clone(),
        };

        let (corpus, _) = join_corpus(&sources, &site_list(&["US-Var"]), &reader).unwrap();
        let targets: Vec<_> = corpus.rows.iter().map(|r| r.target).collect();
        assert_eq!(targets, vec![0.3, 0.9, 0.5]);
    }

    #[test]
    fn test_site_missing_is_classified_unexpected() {
        let err = JoinError::SiteMissing {
            site: "XX-Nop".to_string(),
            variable: "vod".to_string(),
        };
        assert_eq!(
            logging::classify_join_failure(&err.to_string()),
            logging::FailureType::Unexpected
        );
    }

    #[test]
    fn test_schema_validation_rejects_shared_paths() {
        let mut sources = sources();
        sources.insert(
            FeatureVariable::Co2,
            PathBuf::from("co2.csv"),
            PathBuf::from("co2.csv"),
        );
        assert!(matches!(sources.validate(), Err(JoinError::InvalidSchema(_))));

        let mut missing = DataSources::new(PathBuf::from("str.csv"));
        missing.insert(FeatureVariable::Ate, "a.csv".into(), "b.csv".into());
        assert!(matches!(missing.validate(), Err(JoinError::InvalidSchema(_))));
    }
}
