/// Development mode: synthetic input data
///
/// When the real site tables are unavailable, use this module to write a
/// complete, self-consistent input directory (catalog plus all 13 tables)
/// with seasonal signals, a stress target driven by the covariates, a few
/// stress values above the clamp bound and randomly placed sentinels.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use std::fs;
use std::io;
use std::path::Path;

use crate::config::TrainingConfig;
use crate::ingest::table::{write_series, TimeSeriesTable};
use crate::logging::{self, Stage};
use crate::model::{FeatureVariable, SENTINEL_VALUES};

/// Configuration for synthetic data generation
#[derive(Debug, Clone, PartialEq)]
pub struct DevMode {
    pub sites: usize,
    /// Daily steps per site.
    pub timesteps: usize,
    pub seed: u64,
    /// Probability that any one cell is replaced by a sentinel.
    pub sentinel_rate: f64,
}

impl Default for DevMode {
    fn default() -> Self {
        Self {
            sites: 4,
            timesteps: 730,
            seed: 2024,
            sentinel_rate: 0.01,
        }
    }
}

/// What [`DevMode::write_inputs`] produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticInputs {
    pub site_ids: Vec<String>,
    pub timesteps: usize,
    pub sentinel_cells: usize,
    /// Target values written above the clamp bound.
    pub stress_above_bound: usize,
}

/// Baseline and seasonal amplitude per variable.
fn climatology(variable: FeatureVariable) -> (f64, f64) {
    match variable {
        FeatureVariable::Ate => (12.0, 10.0),
        FeatureVariable::Co2 => (385.0, 4.0),
        FeatureVariable::Ssh => (0.3, 0.12),
        FeatureVariable::Swi => (210.0, 110.0),
        FeatureVariable::Vod => (0.6, 0.15),
        FeatureVariable::Vpd => (1.1, 0.8),
    }
}

struct SiteSeries {
    absolute: Vec<[f64; 6]>,
    anomaly: Vec<[f64; 6]>,
    stress: Vec<f64>,
}

impl DevMode {
    pub fn new(sites: usize, timesteps: usize, seed: u64) -> Self {
        Self {
            sites,
            timesteps,
            seed,
            ..Self::default()
        }
    }

    pub fn with_sentinel_rate(mut self, rate: f64) -> Self {
        self.sentinel_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn site_ids(&self) -> Vec<String> {
        (0..self.sites).map(|i| format!("XX-S{:02}", i + 1)).collect()
    }

    fn index(&self) -> Vec<NaiveDateTime> {
        let start = NaiveDate::from_ymd_opt(2003, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default();
        (0..self.timesteps)
            .map(|i| start + Duration::days(i as i64))
            .collect()
    }

    fn simulate_site(&self, site: usize, rng: &mut StdRng) -> SiteSeries {
        let phase = site as f64 * 0.4;
        let mut series = SiteSeries {
            absolute: Vec::with_capacity(self.timesteps),
            anomaly: Vec::with_capacity(self.timesteps),
            stress: Vec::with_capacity(self.timesteps),
        };

        for step in 0..self.timesteps {
            let season = (TAU * step as f64 / 365.0 + phase).sin();
            let mut absolute = [0.0; 6];
            let mut anomaly = [0.0; 6];
            for (i, variable) in FeatureVariable::ALL.iter().enumerate() {
                let (base, amplitude) = climatology(*variable);
                let deviation = rng.gen_range(-0.25..0.25) * amplitude;
                absolute[i] = (base + amplitude * season + deviation).max(0.01 * base);
                anomaly[i] = deviation;
            }

            // Stress rises with VPD and falls with available water
            let vpd = absolute[5];
            let ssh = absolute[2];
            let mut stress = 0.15 + 0.3 * vpd - 0.8 * (ssh - 0.3) + rng.gen_range(-0.05..0.05);
            if rng.gen_bool(0.02) {
                stress = 1.0 + rng.gen_range(0.01..0.2);
            }

            series.absolute.push(absolute);
            series.anomaly.push(anomaly);
            series.stress.push(stress.max(0.0));
        }
        series
    }

    fn maybe_sentinel(&self, value: f64, rng: &mut StdRng, count: &mut usize) -> f64 {
        if self.sentinel_rate > 0.0 && rng.gen_bool(self.sentinel_rate) {
            *count += 1;
            SENTINEL_VALUES[rng.gen_range(0..SENTINEL_VALUES.len())]
        } else {
            value
        }
    }

    fn write_table(&self, path: &Path, sites: &[String], columns: Vec<Vec<f64>>) -> io::Result<()> {
        let table = TimeSeriesTable::new(self.index(), sites.iter().cloned().zip(columns).collect())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_series(path, &table)?;
        Ok(())
    }

    /// Write catalog and tables under `input_dir` using the file names
    /// the training config expects for `vegetation`.
    ///
    /// Fails with `AlreadyExists`, writing nothing, if any of those files
    /// is already present.
    pub fn write_inputs(&self, input_dir: &Path, vegetation: &str) -> io::Result<SyntheticInputs> {
        // Same layout the config resolves, so a dev run needs no other setup
        let config = TrainingConfig {
            input_dir: input_dir.to_path_buf(),
            vegetation: vegetation.to_string(),
            ..TrainingConfig::default()
        };
        let sources = config.data_sources();

        let mut targets = vec![config.site_catalog_path(), sources.target.clone()];
        for variable in FeatureVariable::ALL {
            if let Some(source) = sources.get(variable) {
                targets.push(source.absolute.clone());
                targets.push(source.anomaly.clone());
            }
        }
        if let Some(existing) = targets.iter().find(|path| path.exists()) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists; dev mode needs an empty input directory", existing.display()),
            ));
        }

        fs::create_dir_all(input_dir)?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let sites = self.site_ids();

        let simulated: Vec<SiteSeries> = (0..self.sites).map(|s| self.simulate_site(s, &mut rng)).collect();
        let mut sentinel_cells = 0;

        for (i, variable) in FeatureVariable::ALL.iter().enumerate() {
            let Some(source) = sources.get(*variable) else {
                continue;
            };
            let mut absolute: Vec<Vec<f64>> = Vec::with_capacity(self.sites);
            let mut anomaly: Vec<Vec<f64>> = Vec::with_capacity(self.sites);
            for site in &simulated {
                absolute.push(
                    site.absolute
                        .iter()
                        .map(|row| self.maybe_sentinel(row[i], &mut rng, &mut sentinel_cells))
                        .collect(),
                );
                anomaly.push(
                    site.anomaly
                        .iter()
                        .map(|row| self.maybe_sentinel(row[i], &mut rng, &mut sentinel_cells))
                        .collect(),
                );
            }
            self.write_table(&source.absolute, &sites, absolute)?;
            self.write_table(&source.anomaly, &sites, anomaly)?;
        }

        let stress_above_bound: usize = simulated
            .iter()
            .map(|s| s.stress.iter().filter(|v| **v > 1.0).count())
            .sum();
        let stress: Vec<Vec<f64>> = simulated
            .iter()
            .map(|site| {
                site.stress
                    .iter()
                    .map(|v| self.maybe_sentinel(*v, &mut rng, &mut sentinel_cells))
                    .collect()
            })
            .collect();
        self.write_table(&sources.target, &sites, stress)?;

        let mut catalog = csv::Writer::from_path(config.site_catalog_path())?;
        catalog.write_record(["site", "latitude", "longitude", "igbp"])?;
        for (i, site) in sites.iter().enumerate() {
            let latitude = format!("{:.2}", 35.0 + 2.5 * i as f64);
            let longitude = format!("{:.2}", -120.0 + 7.0 * i as f64);
            catalog.write_record([site.as_str(), latitude.as_str(), longitude.as_str(), "GRA"])?;
        }
        // One incomplete entry the catalog loader must drop
        catalog.write_record(["XX-BAD", "", "0.00", "GRA"])?;
        catalog.flush()?;

        logging::info(
            Stage::System,
            None,
            &format!(
                "Dev mode: wrote {} sites x {} steps to {} ({} sentinels)",
                self.sites,
                self.timesteps,
                input_dir.display(),
                sentinel_cells
            ),
        );

        Ok(SyntheticInputs {
            site_ids: sites,
            timesteps: self.timesteps,
            sentinel_cells,
            stress_above_bound,
        })
    }
}
