/// Site-keyed time-series tables
///
/// Every input variable is stored as a wide table: the first column is the
/// time index and each following column holds one site's series, with the
/// site identifier as header. Missing cells (`""`, `NaN`, `NA`, `null`)
/// load as `f64::NAN`; sentinel placeholders are kept verbatim so the
/// joiner decides how to treat them.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::{HashMap, HashSet};
use std::path::Path;

// ============================================================================
// Table
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesTable {
    index: Vec<NaiveDateTime>,
    sites: Vec<String>,
    /// `columns[site][row]`
    columns: Vec<Vec<f64>>,
    lookup: HashMap<String, usize>,
}

impl TimeSeriesTable {
    /// Build a table from a time index and per-site columns.
    ///
    /// Returns an error if a timestamp repeats, a column length disagrees
    /// with the index or a site header repeats.
    pub fn new(
        index: Vec<NaiveDateTime>,
        site_columns: Vec<(String, Vec<f64>)>,
    ) -> Result<Self, String> {
        let mut seen = HashSet::with_capacity(index.len());
        for time in &index {
            if !seen.insert(*time) {
                return Err(format!("duplicate time step {}", time));
            }
        }

        let mut sites = Vec::with_capacity(site_columns.len());
        let mut columns = Vec::with_capacity(site_columns.len());
        let mut lookup = HashMap::with_capacity(site_columns.len());

        for (site, values) in site_columns {
            if values.len() != index.len() {
                return Err(format!(
                    "column {} has {} values for {} time steps",
                    site,
                    values.len(),
                    index.len()
                ));
            }
            if lookup.insert(site.clone(), sites.len()).is_some() {
                return Err(format!("duplicate site column {}", site));
            }
            sites.push(site);
            columns.push(values);
        }

        Ok(Self {
            index,
            sites,
            columns,
            lookup,
        })
    }

    pub fn index(&self) -> &[NaiveDateTime] {
        &self.index
    }

    pub fn sites(&self) -> &[String] {
        &self.sites
    }

    pub fn has_site(&self, site: &str) -> bool {
        self.lookup.contains_key(site)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Raw values for one site, aligned with [`TimeSeriesTable::index`].
    pub fn site_values(&self, site: &str) -> Option<&[f64]> {
        self.lookup.get(site).map(|&i| self.columns[i].as_slice())
    }

    /// `(time, value)` pairs for one site.
    pub fn site_series(&self, site: &str) -> Option<impl Iterator<Item = (NaiveDateTime, f64)> + '_> {
        self.site_values(site)
            .map(|values| self.index.iter().copied().zip(values.iter().copied()))
    }

    /// Apply `f` to every value in place.
    pub fn map_values<F>(&mut self, f: F)
    where
        F: Fn(f64) -> f64,
    {
        for column in &mut self.columns {
            for value in column.iter_mut() {
                *value = f(*value);
            }
        }
    }

    /// Count of cells satisfying `predicate`, over every site.
    pub fn count_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(f64) -> bool,
    {
        self.columns
            .iter()
            .map(|c| c.iter().filter(|v| predicate(**v)).count())
            .sum()
    }
}

// ============================================================================
// Reading
// ============================================================================

/// Source of site-keyed tables. The joiner and verifier only see this
/// trait, so tests can serve tables from memory.
pub trait SeriesReader {
    fn read_series(&self, path: &Path) -> Result<TimeSeriesTable, String>;
}

/// Reads wide CSV tables from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvSeriesReader;

impl SeriesReader for CsvSeriesReader {
    fn read_series(&self, path: &Path) -> Result<TimeSeriesTable, String> {
        if is_hdf5_path(path) {
            return Err(format!(
                "{} is an HDF5 store; export it as a wide CSV table (time column, then one column per site)",
                path.display()
            ));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| e.to_string())?;

        let headers = reader.headers().map_err(|e| e.to_string())?.clone();
        if headers.len() < 2 {
            return Err("expected a time column followed by at least one site column".to_string());
        }
        let site_count = headers.len() - 1;

        let mut index = Vec::new();
        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); site_count];

        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|e| e.to_string())?;
            if record.len() != headers.len() {
                return Err(format!(
                    "row {} has {} fields, expected {}",
                    line + 2,
                    record.len(),
                    headers.len()
                ));
            }

            let time = parse_time(&record[0])
                .ok_or_else(|| format!("row {}: unparseable time '{}'", line + 2, &record[0]))?;
            index.push(time);

            for (i, column) in columns.iter_mut().enumerate() {
                let cell = &record[i + 1];
                let value = parse_cell(cell)
                    .ok_or_else(|| format!("row {}: unparseable value '{}'", line + 2, cell))?;
                column.push(value);
            }
        }

        let site_columns = headers
            .iter()
            .skip(1)
            .map(String::from)
            .zip(columns)
            .collect();

        TimeSeriesTable::new(index, site_columns)
    }
}

fn is_hdf5_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ["h5", "hdf5", "hdf"].iter().any(|h| ext.eq_ignore_ascii_case(h)))
}

/// Returns `true` for the spellings the source tables use for "no value".
pub fn is_missing_token(cell: &str) -> bool {
    let cell = cell.trim();
    cell.is_empty()
        || cell.eq_ignore_ascii_case("nan")
        || cell.eq_ignore_ascii_case("na")
        || cell.eq_ignore_ascii_case("null")
}

/// Parse one numeric cell. Missing tokens become `NaN`; anything else
/// that is not a number is a format error (`None`).
fn parse_cell(cell: &str) -> Option<f64> {
    if is_missing_token(cell) {
        Some(f64::NAN)
    } else {
        cell.trim().parse().ok()
    }
}

/// Accepts `2004-06-01`, `2004-06-01 12:00:00`, `2004-06-01T12:00:00`
/// and RFC 3339 timestamps (converted to UTC wall time).
pub fn parse_time(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.naive_utc())
}

// ============================================================================
// Writing
// ============================================================================

/// Write a table in the layout [`CsvSeriesReader`] reads. `NaN` is
/// written as an empty cell.
pub fn write_series(path: &Path, table: &TimeSeriesTable) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec!["time".to_string()];
    header.extend(table.sites().iter().cloned());
    writer.write_record(&header)?;

    for (row, time) in table.index().iter().enumerate() {
        let mut record = vec![time.format("%Y-%m-%d %H:%M:%S").to_string()];
        for column in &table.columns {
            let value = column[row];
            record.push(if value.is_nan() { String::new() } else { value.to_string() });
        }
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2010, 7, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_time_accepts_common_layouts() {
        assert_eq!(parse_time("2010-07-01"), Some(day(1)));
        assert_eq!(parse_time("2010-07-01 00:00:00"), Some(day(1)));
        assert_eq!(parse_time("2010-07-01T00:00:00"), Some(day(1)));
        assert_eq!(parse_time("2010-07-01T02:00:00+02:00"), Some(day(1)));
        assert_eq!(parse_time("July 1st"), None);
    }

    #[test]
    fn test_missing_tokens() {
        for token in ["", " ", "NaN", "nan", "NA", "null"] {
            assert!(is_missing_token(token), "'{}' should be missing", token);
        }
        assert!(!is_missing_token("-9999.0"));
        assert!(!is_missing_token("0"));
    }

    #[test]
    fn test_new_rejects_ragged_columns() {
        let err = TimeSeriesTable::new(
            vec![day(1), day(2)],
            vec![("US-Ton".to_string(), vec![1.0])],
        )
        .unwrap_err();
        assert!(err.contains("US-Ton"));
    }

    #[test]
    fn test_new_rejects_duplicate_sites() {
        let err = TimeSeriesTable::new(
            vec![day(1)],
            vec![
                ("US-Ton".to_string(), vec![1.0]),
                ("US-Ton".to_string(), vec![2.0]),
            ],
        )
        .unwrap_err();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn test_new_rejects_repeated_time_steps() {
        let err = TimeSeriesTable::new(
            vec![day(1), day(1), day(2)],
            vec![("US-Ton".to_string(), vec![0.3, 0.9, 0.5])],
        )
        .unwrap_err();
        assert!(err.contains("duplicate time step"), "{}", err);
    }

    #[test]
    fn test_csv_reader_names_hdf5_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ate_short_vegetation.h5");
        std::fs::write(&path, b"\x89HDF\r\n\x1a\n").unwrap();

        let err = CsvSeriesReader.read_series(&path).unwrap_err();
        assert!(err.contains("HDF5"), "{}", err);
        assert!(!is_hdf5_path(Path::new("ate_short_vegetation.csv")));
    }

    #[test]
    fn test_csv_reader_rejects_repeated_dates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "time,US-Ton").unwrap();
        writeln!(file, "2010-07-01,0.3").unwrap();
        writeln!(file, "2010-07-01,0.9").unwrap();
        writeln!(file, "2010-07-02,0.5").unwrap();
        file.flush().unwrap();

        let err = CsvSeriesReader.read_series(file.path()).unwrap_err();
        assert!(err.contains("2010-07-01"), "{}", err);
    }

    #[test]
    fn test_csv_reader_loads_sites_and_missing_cells() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "time,US-Ton,AU-How").unwrap();
        writeln!(file, "2010-07-01,0.5,-9999.0").unwrap();
        writeln!(file, "2010-07-02,,0.7").unwrap();
        writeln!(file, "2010-07-03,NaN,0.8").unwrap();
        file.flush().unwrap();

        let table = CsvSeriesReader.read_series(file.path()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.sites(), &["US-Ton".to_string(), "AU-How".to_string()]);

        let ton = table.site_values("US-Ton").unwrap();
        assert_eq!(ton[0], 0.5);
        assert!(ton[1].is_nan());
        assert!(ton[2].is_nan());

        // Sentinels are preserved for the joiner
        assert_eq!(table.site_values("AU-How").unwrap()[0], -9999.0);
        assert!(table.site_values("DE-Tha").is_none());
    }

    #[test]
    fn test_csv_reader_rejects_garbage_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "time,US-Ton").unwrap();
        writeln!(file, "2010-07-01,abc").unwrap();
        file.flush().unwrap();

        let err = CsvSeriesReader.read_series(file.path()).unwrap_err();
        assert!(err.contains("abc"));
    }

    #[test]
    fn test_write_then_read_preserves_values_and_gaps() {
        let table = TimeSeriesTable::new(
            vec![day(1), day(2)],
            vec![
                ("US-Ton".to_string(), vec![1.5, f64::NAN]),
                ("AU-How".to_string(), vec![-999.0, 0.25]),
            ],
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpd.csv");
        write_series(&path, &table).unwrap();

        let loaded = CsvSeriesReader.read_series(&path).unwrap();
        assert_eq!(loaded.index(), table.index());
        assert_eq!(loaded.site_values("US-Ton").unwrap()[0], 1.5);
        assert!(loaded.site_values("US-Ton").unwrap()[1].is_nan());
        assert_eq!(loaded.site_values("AU-How").unwrap()[0], -999.0);
    }

    #[test]
    fn test_map_values_and_count() {
        let mut table = TimeSeriesTable::new(
            vec![day(1), day(2), day(3)],
            vec![("US-Ton".to_string(), vec![0.5, 1.2, -9999.0])],
        )
        .unwrap();
        table.map_values(|v| if v > 1.0 { 1.0 } else { v });
        assert_eq!(table.site_values("US-Ton").unwrap(), &[0.5, 1.0, -9999.0]);
        assert_eq!(table.count_where(|v| v == -9999.0), 1);
    }
}
