//! # StressNet trainer
//!
//! Builds a training corpus of vegetation transpiration stress from
//! per-site environmental time series and fits a multi-branch dense
//! network against a Kling-Gupta skill-score loss.
//!
//! ## Modules
//!
//! - `catalog` - site list from the metadata table
//! - `ingest` - site-keyed time-series tables
//! - `join` - 13-column per-site alignment, sentinel filtering, target clamp
//! - `partition` - shuffle, robust scaling, split, batching
//! - `loss` - skill score, loss and gradient
//! - `network` - model factory, layers and optimizers
//! - `train` - epoch loop and history
//! - `artifact` - bundle persistence and inference
//! - `verify` - pre-flight source checks
//! - `dev_mode` - synthetic inputs

pub mod artifact;
pub mod catalog;
pub mod config;
pub mod dev_mode;
pub mod ingest;
pub mod join;
pub mod logging;
pub mod loss;
pub mod model;
pub mod network;
pub mod partition;
pub mod pipeline;
pub mod train;
pub mod verify;

pub use config::TrainingConfig;
pub use model::PipelineError;
pub use pipeline::{run, RunSummary};
