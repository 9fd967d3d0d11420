//! Source Verification Integration Tests
//!
//! Check which configured input tables are readable and cover the site
//! catalog, using dev-mode inputs with individual files removed or
//! rewritten.

use std::fs;

use stressnet_trainer::dev_mode::DevMode;
use stressnet_trainer::ingest::table::CsvSeriesReader;
use stressnet_trainer::verify::*;
use stressnet_trainer::TrainingConfig;

fn prepared_config(dir: &std::path::Path) -> TrainingConfig {
    DevMode::new(3, 30, 11)
        .write_inputs(dir, "short_vegetation")
        .unwrap();
    TrainingConfig {
        input_dir: dir.to_path_buf(),
        ..TrainingConfig::default()
    }
}

#[test]
fn test_complete_inputs_are_ready() {
    let dir = tempfile::tempdir().unwrap();
    let config = prepared_config(dir.path());

    let report = verify_sources(&config, &CsvSeriesReader).unwrap();
    print_summary(&report);

    assert_eq!(report.catalog_sites, 3);
    assert_eq!(report.summary.tables_total, 13);
    assert_eq!(report.summary.tables_complete, 13);
    assert!(report.is_ready());
    assert!(report.tables.iter().all(|t| t.time_steps == 30));

    let columns: Vec<&str> = report.tables.iter().map(|t| t.column.as_str()).collect();
    assert_eq!(columns.first(), Some(&"ate"));
    assert_eq!(columns.last(), Some(&"str"));
}

#[test]
fn test_deleted_table_is_reported_failed() {
    let dir = tempfile::tempdir().unwrap();
    let config = prepared_config(dir.path());
    fs::remove_file(dir.path().join("swi_short_vegetation_anomaly.csv")).unwrap();

    let report = verify_sources(&config, &CsvSeriesReader).unwrap();

    assert_eq!(report.summary.tables_failed, 1);
    assert!(!report.is_ready());
    let failed = report
        .tables
        .iter()
        .find(|t| t.status == VerificationStatus::Failed)
        .expect("one table should fail");
    assert_eq!(failed.column, "swianm");
    assert!(failed.error_message.is_some());
}

#[test]
fn test_table_missing_a_site_is_partial() {
    let dir = tempfile::tempdir().unwrap();
    let config = prepared_config(dir.path());
    fs::write(
        dir.path().join("vod_short_vegetation.csv"),
        "time,XX-S01,XX-S02\n2003-01-01,0.5,0.6\n",
    )
    .unwrap();

    let report = verify_sources(&config, &CsvSeriesReader).unwrap();
    let vod = report.tables.iter().find(|t| t.column == "vod").unwrap();

    assert_eq!(vod.status, VerificationStatus::PartialSuccess);
    assert_eq!(vod.sites_missing, vec!["XX-S03".to_string()]);
    assert_eq!(report.summary.tables_partial, 1);
}

#[test]
fn test_missing_catalog_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainingConfig {
        input_dir: dir.path().to_path_buf(),
        ..TrainingConfig::default()
    };
    assert!(matches!(
        verify_sources(&config, &CsvSeriesReader),
        Err(VerifyError::Catalog(_))
    ));
}
