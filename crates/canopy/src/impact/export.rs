//! CSV export of a shop's ledger rows.

use std::io::Write;

use chrono::SecondsFormat;
use serde::Serialize;

use super::domain::ImpactLedgerEntry;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to write ledger csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to flush ledger csv: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
struct LedgerCsvRow<'a> {
    id: i64,
    created_at: String,
    source_system: &'a str,
    source_type: &'static str,
    reference_id: &'a str,
    trees_planted: u32,
    co2_offset_kg: f64,
    metadata: String,
}

impl<'a> From<&'a ImpactLedgerEntry> for LedgerCsvRow<'a> {
    fn from(entry: &'a ImpactLedgerEntry) -> Self {
        Self {
            id: entry.id,
            created_at: entry.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            source_system: &entry.source_system,
            source_type: entry.source.as_str(),
            reference_id: &entry.reference_id,
            trees_planted: entry.trees_planted,
            co2_offset_kg: entry.co2_offset_kg,
            metadata: entry.metadata.to_string(),
        }
    }
}

/// Writes a header row followed by one row per entry.
pub fn write_ledger_csv<W: Write>(
    writer: W,
    entries: &[ImpactLedgerEntry],
) -> Result<(), ExportError> {
    let mut csv = csv::Writer::from_writer(writer);
    if entries.is_empty() {
        csv.write_record([
            "id",
            "created_at",
            "source_system",
            "source_type",
            "reference_id",
            "trees_planted",
            "co2_offset_kg",
            "metadata",
        ])?;
    }
    for entry in entries {
        csv.serialize(LedgerCsvRow::from(entry))?;
    }
    csv.flush()?;
    Ok(())
}

pub fn ledger_csv(entries: &[ImpactLedgerEntry]) -> Result<Vec<u8>, ExportError> {
    let mut buffer = Vec::new();
    write_ledger_csv(&mut buffer, entries)?;
    Ok(buffer)
}
