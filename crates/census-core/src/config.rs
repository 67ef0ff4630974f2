//! Run configuration.
//!
//! Every field has a default, so a JSON config file only needs the values it
//! changes. Command-line flags are applied on top by the binary.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CensusError, Result};
use crate::stats::{AttributionStrategy, ValidRange};

pub const DEFAULT_PREFIX: &str = "chunked-rasters/";
pub const DEFAULT_OUTPUT: &str = "tile_census_results.csv";
pub const DEFAULT_REGIONS: &str = "countries.geojson";
pub const DEFAULT_FETCH_RETRIES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CensusConfig {
    /// Directory holding the tile tree.
    pub tile_root: PathBuf,
    /// Path under `tile_root` to list from.
    pub prefix: String,
    pub output: PathBuf,
    /// Country polygons: GeoJSON, or a `.shp` shapefile.
    pub regions: PathBuf,
    /// Process at most this many tiles.
    pub limit: Option<usize>,
    pub valid_range: ValidRange,
    pub strategy: AttributionStrategy,
    /// Worker threads; `None` uses every logical CPU.
    pub jobs: Option<usize>,
    /// Feature property used as the country label.
    pub label_property: Option<String>,
    pub fetch_retries: u32,
    /// Extra points per tile edge when reprojecting bounds.
    pub densify: usize,
    /// Optional per-tile JSON detail output.
    pub tiles_json: Option<PathBuf>,
}

impl Default for CensusConfig {
    fn default() -> Self {
        Self {
            tile_root: PathBuf::from("."),
            prefix: DEFAULT_PREFIX.to_string(),
            output: PathBuf::from(DEFAULT_OUTPUT),
            regions: PathBuf::from(DEFAULT_REGIONS),
            limit: None,
            valid_range: ValidRange::default(),
            strategy: AttributionStrategy::default(),
            jobs: None,
            label_property: None,
            fetch_retries: DEFAULT_FETCH_RETRIES,
            densify: 0,
            tiles_json: None,
        }
    }
}

impl CensusConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        let r = self.valid_range;
        if !r.low.is_finite() || !r.high.is_finite() || r.low > r.high {
            return Err(CensusError::Config(format!(
                "valid range [{}, {}] is empty or not finite",
                r.low, r.high
            )));
        }
        if self.jobs == Some(0) {
            return Err(CensusError::Config("jobs must be at least 1".to_string()));
        }
        Ok(())
    }
}
