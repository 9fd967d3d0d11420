/// Site catalog for the StressNet training corpus.
///
/// Resolves the canonical list of observation sites from the site-metadata
/// table. A site is usable only if every metadata field is present; the
/// rest are dropped here so no later stage ever sees them. This is the
/// single source of truth for site ids: the joiner iterates sites in the
/// order returned from here.

use std::path::Path;

use crate::ingest::table::is_missing_token;
use crate::logging::{self, Stage};
use crate::model::CatalogError;

// ---------------------------------------------------------------------------
// Site metadata
// ---------------------------------------------------------------------------

/// One complete catalog row.
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    pub site_id: String,
    /// Remaining metadata columns as `(header, value)`, in table order.
    pub fields: Vec<(String, String)>,
}

impl Site {
    /// Metadata value by column header.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(header, _)| header == name)
            .map(|(_, value)| value.as_str())
    }
}

/// The resolved site list.
#[derive(Debug, Clone, Default)]
pub struct SiteCatalog {
    sites: Vec<Site>,
    dropped: Vec<String>,
}

impl SiteCatalog {
    /// Site ids in source order, suitable for passing to the joiner.
    pub fn site_ids(&self) -> Vec<String> {
        self.sites.iter().map(|s| s.site_id.clone()).collect()
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    /// Ids of rows discarded for incomplete metadata.
    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Looks up a site by id. Returns `None` if absent or dropped.
    pub fn find_site(&self, site_id: &str) -> Option<&Site> {
        self.sites.iter().find(|s| s.site_id == site_id)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Read the site-metadata CSV at `path`.
///
/// The first column is the site id, every other column is metadata. Rows
/// with any missing field (id included) are dropped.
pub fn load_site_catalog(path: &Path) -> Result<SiteCatalog, CatalogError> {
    let unreadable = |reason: String| CatalogError::Unreadable {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| unreadable(e.to_string()))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| unreadable(e.to_string()))?
        .iter()
        .map(String::from)
        .collect();
    if headers.is_empty() {
        return Err(unreadable("missing header row".to_string()));
    }

    let mut catalog = SiteCatalog::default();

    for record in reader.records() {
        let record = record.map_err(|e| unreadable(e.to_string()))?;
        let site_id = record.get(0).unwrap_or_default().to_string();

        // Short rows count as missing trailing fields
        let complete = record.len() == headers.len()
            && record.iter().all(|field| !is_missing_token(field));

        if !complete {
            logging::debug(
                Stage::Catalog,
                Some(&site_id),
                "dropping site with incomplete metadata",
            );
            catalog.dropped.push(site_id);
            continue;
        }

        let fields = headers
            .iter()
            .skip(1)
            .cloned()
            .zip(record.iter().skip(1).map(String::from))
            .collect();
        catalog.sites.push(Site { site_id, fields });
    }

    if catalog.sites.is_empty() {
        return Err(CatalogError::Empty {
            path: path.to_path_buf(),
            dropped: catalog.dropped.len(),
        });
    }

    logging::info(
        Stage::Catalog,
        None,
        &format!(
            "Resolved {} sites ({} dropped for missing metadata)",
            catalog.sites.len(),
            catalog.dropped.len()
        ),
    );

    Ok(catalog)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
