//! Writing results to disk.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::aggregate::{AggregatedStat, TileResult};
use crate::error::Result;

/// Column order of the aggregate table.
pub const CSV_HEADER: [&str; 6] = [
    "subdirectory",
    "country",
    "total_pixels",
    "valid_pixels",
    "fraction_valid",
    "tiff_count",
];

/// Write the aggregate table as CSV. The header is written even when there
/// are no rows.
pub fn write_csv<W: Write>(writer: W, rows: &[AggregatedStat]) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
    wtr.write_record(CSV_HEADER)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_csv_file<P: AsRef<Path>>(path: P, rows: &[AggregatedStat]) -> Result<()> {
    let path = path.as_ref();
    write_csv(BufWriter::new(File::create(path)?), rows)?;
    info!(path = %path.display(), rows = rows.len(), "Results saved");
    Ok(())
}

/// Per-tile detail as pretty JSON.
pub fn write_tiles_json<P: AsRef<Path>>(path: P, results: &[TileResult]) -> Result<()> {
    let path = path.as_ref();
    let mut out = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut out, results)?;
    out.flush()?;
    info!(path = %path.display(), tiles = results.len(), "Tile details saved");
    Ok(())
}
