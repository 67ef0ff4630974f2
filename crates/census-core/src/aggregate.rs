//! Fold per-tile results into (subdirectory, country) totals.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::stats::CountryPixelStat;

/// Number of countries listed in the run summary.
pub const TOP_COUNTRIES: usize = 10;

/// Outcome of one successfully analysed tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileResult {
    pub tile_id: String,
    pub subdir: String,
    /// Candidate countries in region load order.
    pub countries: Vec<String>,
    pub analysis: BTreeMap<String, CountryPixelStat>,
}

impl TileResult {
    /// A tile that touched no country.
    #[cfg(test)]
    pub(crate) fn empty(tile_id: impl Into<String>, subdir: impl Into<String>) -> Self {
        Self {
            tile_id: tile_id.into(),
            subdir: subdir.into(),
            countries: Vec::new(),
            analysis: BTreeMap::new(),
        }
    }
}

/// One output row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedStat {
    pub subdirectory: String,
    pub country: String,
    pub total_pixels: u64,
    pub valid_pixels: u64,
    pub fraction_valid: f64,
    pub tiff_count: u64,
}

#[derive(Default)]
struct Accumulator {
    total: u64,
    valid: u64,
    tiffs: u64,
}

/// Group by exact (subdirectory, country) strings and sum.
///
/// The fraction is recomputed from the summed counts. Rows come out sorted by
/// (subdirectory, country), independent of input order.
pub fn aggregate(results: &[TileResult]) -> Vec<AggregatedStat> {
    let mut groups: BTreeMap<(&str, &str), Accumulator> = BTreeMap::new();
    for result in results {
        for (country, stat) in &result.analysis {
            let acc = groups
                .entry((result.subdir.as_str(), country.as_str()))
                .or_default();
            acc.total += stat.total_pixels;
            acc.valid += stat.valid_pixels;
            acc.tiffs += 1;
        }
    }

    groups
        .into_iter()
        .map(|((subdir, country), acc)| {
            let stat = CountryPixelStat::from_counts(acc.total, acc.valid);
            AggregatedStat {
                subdirectory: subdir.to_string(),
                country: country.to_string(),
                total_pixels: stat.total_pixels,
                valid_pixels: stat.valid_pixels,
                fraction_valid: stat.fraction_valid,
                tiff_count: acc.tiffs,
            }
        })
        .collect()
}

/// Run-level report over the aggregate table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub subdirectories: usize,
    pub countries: usize,
    pub tiff_count: u64,
    /// Unweighted mean of the per-row fractions. Informational only.
    pub mean_fraction_valid: f64,
    /// Countries by summed total pixels, largest first.
    pub top_countries: Vec<(String, u64)>,
}

pub fn summarize(rows: &[AggregatedStat]) -> RunSummary {
    let subdirectories: BTreeSet<&str> = rows.iter().map(|r| r.subdirectory.as_str()).collect();

    let mut by_country: BTreeMap<&str, u64> = BTreeMap::new();
    for row in rows {
        *by_country.entry(row.country.as_str()).or_default() += row.total_pixels;
    }

    let mean_fraction_valid = if rows.is_empty() {
        0.0
    } else {
        rows.iter().map(|r| r.fraction_valid).sum::<f64>() / rows.len() as f64
    };

    let countries = by_country.len();
    let mut top: Vec<(String, u64)> = by_country
        .into_iter()
        .map(|(name, total)| (name.to_string(), total))
        .collect();
    // Stable sort keeps name order among equal totals.
    top.sort_by(|a, b| b.1.cmp(&a.1));
    top.truncate(TOP_COUNTRIES);

    RunSummary {
        subdirectories: subdirectories.len(),
        countries,
        tiff_count: rows.iter().map(|r| r.tiff_count).sum(),
        mean_fraction_valid,
        top_countries: top,
    }
}
