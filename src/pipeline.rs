/// End-to-end training run.
///
/// Strict stage order: catalog → join → shuffle → normalize → split →
/// reshuffle → batch → build model → train → save bundle. Every stage
/// failure is returned as a [`PipelineError`]; nothing is retried.

use std::path::PathBuf;

use crate::artifact::save_bundle;
use crate::catalog::load_site_catalog;
use crate::config::TrainingConfig;
use crate::dev_mode::DevMode;
use crate::ingest::table::SeriesReader;
use crate::join::{join_corpus, JoinReport};
use crate::logging::{self, Stage};
use crate::loss::{KgeLoss, KgeMetric};
use crate::model::PipelineError;
use crate::network::{build_model, ModelSpec, Topology};
use crate::partition::partition_corpus;
use crate::train::{StopHandle, Trainer, TrainingHistory};
use crate::verify::{print_summary, verify_sources};

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub sites: usize,
    pub join: JoinReport,
    pub corpus_rows: usize,
    pub train_rows: usize,
    pub validation_rows: usize,
    pub history: TrainingHistory,
    pub bundle_dir: PathBuf,
}

/// Run every stage with the default network layout, narrowed by
/// `width_divisor`.
pub fn run(config: &TrainingConfig, reader: &dyn SeriesReader, stop: StopHandle) -> Result<RunSummary, PipelineError> {
    let topology = Topology::default().scaled_down(config.width_divisor);
    run_with_topology(config, reader, stop, topology)
}

pub fn run_with_topology(
    config: &TrainingConfig,
    reader: &dyn SeriesReader,
    stop: StopHandle,
    topology: Topology,
) -> Result<RunSummary, PipelineError> {
    if config.dev_mode {
        let dev = DevMode {
            seed: config.seed.unwrap_or(DevMode::default().seed),
            ..DevMode::default()
        };
        dev.write_inputs(&config.input_dir, &config.vegetation)?;
    }

    if config.verify_sources {
        let report = verify_sources(config, reader)?;
        print_summary(&report);
        if !report.is_ready() {
            logging::warn(
                Stage::Verify,
                None,
                "some sources are incomplete; the join will report the first failure",
            );
        }
    }

    let catalog = load_site_catalog(&config.site_catalog_path())?;
    let sites = catalog.site_ids();

    let (corpus, join) = join_corpus(&config.data_sources(), &sites, reader)?;

    let data = partition_corpus(&corpus, &config.partition_config())?;
    let corpus_rows = corpus.len();
    // Raw rows are no longer needed once batches exist
    drop(corpus);

    let spec = ModelSpec {
        input_width: config.input_features,
        output_width: config.output_width,
        topology,
        seed: config.seed,
    };
    let mut model = build_model(
        spec,
        Box::new(KgeLoss),
        Box::new(KgeMetric),
        config.optimizer_config(),
    )?;

    let trainer = Trainer::with_stop_handle(stop);
    let history = trainer.fit(&mut model, &data, config.epochs)?;

    let bundle_dir = config.bundle_dir();
    save_bundle(&bundle_dir, &model, &data.scale, &history)?;

    Ok(RunSummary {
        sites: sites.len(),
        join,
        corpus_rows,
        train_rows: data.train.len(),
        validation_rows: data.validation.len(),
        history,
        bundle_dir,
    })
}
