//! Data Source Verification Module
//!
//! Opens every configured input table before a training run and reports
//! which are readable, how much of the site catalog each one covers, and
//! how many cells are gaps or sentinel placeholders.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::catalog::load_site_catalog;
use crate::config::TrainingConfig;
use crate::ingest::table::{SeriesReader, TimeSeriesTable};
use crate::logging::{self, Stage};
use crate::model::{is_sentinel, CatalogError, JoinError, TARGET_COLUMN};

// ============================================================================
// Verification Results
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub timestamp: String,
    pub catalog_path: PathBuf,
    pub catalog_sites: usize,
    pub tables: Vec<TableVerification>,
    pub summary: VerificationSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub tables_total: usize,
    pub tables_complete: usize,
    pub tables_partial: usize,
    pub tables_failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableVerification {
    /// Schema column the table backs (`vpdanm`, `str`, ...).
    pub column: String,
    pub path: PathBuf,
    pub status: VerificationStatus,
    pub time_steps: usize,
    pub sites_present: usize,
    /// Catalog sites with no column in this table.
    pub sites_missing: Vec<String>,
    pub missing_cells: usize,
    pub sentinel_cells: usize,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum VerificationStatus {
    /// Readable and covers every catalog site.
    Success,
    /// Readable but some catalog sites are absent; the join would fail.
    PartialSuccess,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Sources(#[from] JoinError),
}

// ============================================================================
// Per-table checks
// ============================================================================

fn inspect_table(column: &str, path: &Path, table: &TimeSeriesTable, sites: &[String]) -> TableVerification {
    let sites_missing: Vec<String> = sites.iter().filter(|s| !table.has_site(s)).cloned().collect();
    let status = if sites_missing.is_empty() {
        VerificationStatus::Success
    } else {
        VerificationStatus::PartialSuccess
    };

    TableVerification {
        column: column.to_string(),
        path: path.to_path_buf(),
        status,
        time_steps: table.len(),
        sites_present: sites.len() - sites_missing.len(),
        sites_missing,
        missing_cells: table.count_where(f64::is_nan),
        sentinel_cells: table.count_where(is_sentinel),
        error_message: None,
    }
}

pub fn verify_table(column: &str, path: &Path, sites: &[String], reader: &dyn SeriesReader) -> TableVerification {
    match reader.read_series(path) {
        Ok(table) => inspect_table(column, path, &table, sites),
        Err(e) => TableVerification {
            column: column.to_string(),
            path: path.to_path_buf(),
            status: VerificationStatus::Failed,
            time_steps: 0,
            sites_present: 0,
            sites_missing: Vec::new(),
            missing_cells: 0,
            sentinel_cells: 0,
            error_message: Some(e),
        },
    }
}

// ============================================================================
// Full verification
// ============================================================================

/// Check the catalog and all 13 configured tables.
///
/// A missing or empty catalog is an error; unreadable tables are recorded
/// in the report instead.
pub fn verify_sources(config: &TrainingConfig, reader: &dyn SeriesReader) -> Result<VerificationReport, VerifyError> {
    let catalog_path = config.site_catalog_path();
    let catalog = load_site_catalog(&catalog_path)?;
    let sites = catalog.site_ids();

    let sources = config.data_sources();
    let mut columns = sources.feature_paths()?;
    columns.push((TARGET_COLUMN.to_string(), sources.target.clone()));

    let mut report = VerificationReport {
        timestamp: Utc::now().to_rfc3339(),
        catalog_path,
        catalog_sites: sites.len(),
        tables: Vec::with_capacity(columns.len()),
        summary: VerificationSummary {
            tables_total: columns.len(),
            ..VerificationSummary::default()
        },
    };

    for (column, path) in columns {
        let result = verify_table(&column, &path, &sites, reader);

        match result.status {
            VerificationStatus::Success => {
                logging::debug(
                    Stage::Verify,
                    Some(&column),
                    &format!("OK ({} steps, {} sentinels)", result.time_steps, result.sentinel_cells),
                );
                report.summary.tables_complete += 1;
            }
            VerificationStatus::PartialSuccess => {
                logging::warn(
                    Stage::Verify,
                    Some(&column),
                    &format!("{} catalog sites absent: {:?}", result.sites_missing.len(), result.sites_missing),
                );
                report.summary.tables_partial += 1;
            }
            VerificationStatus::Failed => {
                logging::error(
                    Stage::Verify,
                    Some(&column),
                    &format!("unreadable: {}", result.error_message.as_deref().unwrap_or("unknown")),
                );
                report.summary.tables_failed += 1;
            }
        }

        report.tables.push(result);
    }

    Ok(report)
}

impl VerificationReport {
    /// True when every table is readable and covers every catalog site.
    pub fn is_ready(&self) -> bool {
        self.summary.tables_complete == self.summary.tables_total
    }
}

pub fn print_summary(report: &VerificationReport) {
    let s = &report.summary;
    logging::info(
        Stage::Verify,
        None,
        &format!(
            "Catalog {}: {} sites",
            report.catalog_path.display(),
            report.catalog_sites
        ),
    );
    logging::info(
        Stage::Verify,
        None,
        &format!(
            "Tables: {}/{} complete, {} partial, {} failed",
            s.tables_complete, s.tables_total, s.tables_partial, s.tables_failed
        ),
    );

    let sentinels: usize = report.tables.iter().map(|t| t.sentinel_cells).sum();
    let gaps: usize = report.tables.iter().map(|t| t.missing_cells).sum();
    logging::info(
        Stage::Verify,
        None,
        &format!("{} sentinel cells and {} empty cells across all tables", sentinels, gaps),
    );
}
