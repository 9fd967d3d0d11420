/// Readers for the tabular time-series inputs.
///
/// Submodules:
/// - `table`: wide site-keyed tables and the `SeriesReader` seam.

pub mod table;
