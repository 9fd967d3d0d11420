use std::process::ExitCode;

use stressnet_trainer::ingest::table::CsvSeriesReader;
use stressnet_trainer::logging::{self, Stage};
use stressnet_trainer::train::StopHandle;
use stressnet_trainer::{run, TrainingConfig};

fn main() -> ExitCode {
    let config = match TrainingConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    logging::init_logger(
        config.logging.level,
        config.logging.file.as_deref(),
        config.logging.timestamps,
    );

    logging::info(
        Stage::System,
        None,
        &format!(
            "StressNet training: {} from {} -> {}",
            config.vegetation,
            config.input_dir.display(),
            config.bundle_dir().display()
        ),
    );

    let stop = StopHandle::new();
    if let Err(e) = stop.stop_on_interrupt() {
        logging::warn(Stage::System, None, &format!("Ctrl-C will not save a partial model: {}", e));
    }

    match run(&config, &CsvSeriesReader, stop) {
        Ok(summary) => {
            let best = summary
                .history
                .best_validation()
                .and_then(|r| r.val_kge.map(|kge| format!("best val kge {:.4} at epoch {}", kge, r.epoch)))
                .unwrap_or_else(|| "no validation score".to_string());
            logging::info(
                Stage::System,
                None,
                &format!(
                    "Done: {} sites, {} rows ({} train / {} validation), {}",
                    summary.join.contributing_sites(),
                    summary.corpus_rows,
                    summary.train_rows,
                    summary.validation_rows,
                    best
                ),
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            logging::error(Stage::System, None, &format!("run failed: {}", e));
            ExitCode::FAILURE
        }
    }
}
