//! CSV export of successful rows.
//!
//! Fixed column order `Filename,Title,Description,Keywords`, RFC 4180
//! escaping. Only rows in a terminal success state with all three metadata
//! fields present are exported.

use crate::store::ResultStore;
use crate::{Error, Result};
use std::path::Path;
use tracing::info;

const CSV_HEADER: &str = "Filename,Title,Description,Keywords";

/// Quote a field when it contains a comma, quote, or line break; double any
/// embedded quotes.
pub fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Render eligible rows as a CSV document with a trailing newline.
pub fn export_csv(store: &ResultStore) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');

    for row in store.rows().iter().filter(|r| r.is_exportable()) {
        out.push_str(&escape_field(&row.filename));
        out.push(',');
        out.push_str(&escape_field(&row.title));
        out.push(',');
        out.push_str(&escape_field(&row.description));
        out.push(',');
        out.push_str(&escape_field(&row.keywords_csv));
        out.push('\n');
    }

    out
}

/// Write the CSV document to disk.
pub async fn write_csv(store: &ResultStore, path: &Path) -> Result<usize> {
    let exported = store.rows().iter().filter(|r| r.is_exportable()).count();
    let csv = export_csv(store);
    tokio::fs::write(path, csv)
        .await
        .map_err(|e| Error::Storage(format!("CSV write failed: {}", e)))?;
    info!("Exported {} rows to {}", exported, path.display());
    Ok(exported)
}
