//! Per-country pixel counts over one tile.
use serde::{Deserialize, Serialize};

use crate::rasterize::OccupancyMask;

/// Inclusive range of sample values counted as valid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidRange {
    pub low: f64,
    pub high: f64,
}

impl Default for ValidRange {
    fn default() -> Self {
        Self { low: 1.0, high: 6.0 }
    }
}

impl ValidRange {
    #[inline]
    pub fn contains(&self, v: f64) -> bool {
        v >= self.low && v <= self.high
    }
}

/// How pixels are attributed to a country that touches a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionStrategy {
    /// Only pixels whose centre falls inside the country polygon.
    #[default]
    ExactMask,
    /// Every pixel of the tile, for every country touching it.
    BoundingBox,
}

/// Which samples of a tile a statistic is taken over.
#[derive(Debug, Clone, Copy)]
pub enum Selection<'a> {
    Whole,
    Mask(&'a OccupancyMask),
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CountryPixelStat {
    pub total_pixels: u64,
    pub valid_pixels: u64,
    pub fraction_valid: f64,
}

impl CountryPixelStat {
    /// Build from counts, deriving the fraction (0.0 when there is no data).
    pub fn from_counts(total_pixels: u64, valid_pixels: u64) -> Self {
        let fraction_valid = if total_pixels == 0 {
            0.0
        } else {
            valid_pixels as f64 / total_pixels as f64
        };
        Self { total_pixels, valid_pixels, fraction_valid }
    }
}

#[inline]
fn is_nodata(v: f64, nodata: Option<f64>) -> bool {
    match nodata {
        None => false,
        Some(nd) if nd.is_nan() => v.is_nan(),
        Some(nd) => v == nd,
    }
}

/// Count data and valid pixels among the selected samples.
///
/// Nodata samples are excluded from both counts. NaN samples with a non-NaN
/// sentinel count as data but never as valid.
pub fn compute_stat(
    samples: &[f64],
    nodata: Option<f64>,
    selection: Selection<'_>,
    range: ValidRange,
) -> CountryPixelStat {
    let mut total = 0u64;
    let mut valid = 0u64;
    let mut tally = |v: f64| {
        if is_nodata(v, nodata) {
            return;
        }
        total += 1;
        if range.contains(v) {
            valid += 1;
        }
    };

    match selection {
        Selection::Whole => samples.iter().copied().for_each(&mut tally),
        Selection::Mask(mask) => samples
            .iter()
            .zip(&mask.cells)
            .filter(|&(_, &selected)| selected)
            .for_each(|(&v, _)| tally(v)),
    }

    CountryPixelStat::from_counts(total, valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mask(cells: &[bool]) -> OccupancyMask {
        OccupancyMask { width: cells.len(), height: 1, cells: cells.to_vec() }
    }

    #[test]
    fn counts_valid_range_inclusively() {
        let samples = [0.0, 1.0, 3.5, 6.0, 6.5, 7.0];
        let s = compute_stat(&samples, None, Selection::Whole, ValidRange::default());
        assert_eq!(s.total_pixels, 6);
        assert_eq!(s.valid_pixels, 3);
        assert_relative_eq!(s.fraction_valid, 0.5);
    }

    #[test]
    fn nodata_is_excluded_from_both_counts() {
        let samples = [255.0, 255.0, 2.0, 0.0];
        let s = compute_stat(&samples, Some(255.0), Selection::Whole, ValidRange::default());
        assert_eq!(s.total_pixels, 2);
        assert_eq!(s.valid_pixels, 1);

        // A sentinel inside the valid range is still not counted as valid.
        let samples = [1.0, 1.0, 2.0];
        let s = compute_stat(&samples, Some(1.0), Selection::Whole, ValidRange::default());
        assert_eq!((s.total_pixels, s.valid_pixels), (1, 1));
    }

    #[test]
    fn nan_sentinel_matches_nan_samples() {
        let samples = [f64::NAN, 2.0, f64::NAN, 9.0];
        let s = compute_stat(&samples, Some(f64::NAN), Selection::Whole, ValidRange::default());
        assert_eq!((s.total_pixels, s.valid_pixels), (2, 1));
    }

    #[test]
    fn all_nodata_yields_zero_fraction() {
        let samples = [0.0; 16];
        let s = compute_stat(&samples, Some(0.0), Selection::Whole, ValidRange::default());
        assert_eq!(s, CountryPixelStat::from_counts(0, 0));
        assert_eq!(s.fraction_valid, 0.0);
    }

    #[test]
    fn mask_restricts_selection() {
        let samples = [1.0, 2.0, 9.0, 3.0];
        let m = mask(&[true, false, true, false]);
        let s = compute_stat(&samples, None, Selection::Mask(&m), ValidRange::default());
        assert_eq!((s.total_pixels, s.valid_pixels), (2, 1));

        let empty = mask(&[false; 4]);
        let s = compute_stat(&samples, None, Selection::Mask(&empty), ValidRange::default());
        assert_eq!(s, CountryPixelStat::default());
    }

    #[test]
    fn custom_range_is_honoured() {
        let samples = [10.0, 20.0, 30.0];
        let range = ValidRange { low: 15.0, high: 30.0 };
        let s = compute_stat(&samples, None, Selection::Whole, range);
        assert_eq!(s.valid_pixels, 2);
    }

    #[test]
    fn strategy_serializes_in_snake_case() {
        let json = serde_json::to_string(&AttributionStrategy::BoundingBox).unwrap();
        assert_eq!(json, "\"bounding_box\"");
        assert_eq!(AttributionStrategy::default(), AttributionStrategy::ExactMask);
    }
}
