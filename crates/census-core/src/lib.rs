//! Per-country pixel statistics over collections of GeoTIFF tiles.
//!
//! Tiles are listed from a [`source::TileSource`], decoded one at a time,
//! matched against country polygons and reduced to valid-pixel counts, which
//! are then summed per (subdirectory, country).

pub mod aggregate;
pub mod bounds;
pub mod config;
pub mod crs;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod raster;
pub mod rasterize;
pub mod region;
pub mod source;
pub mod stats;
pub mod transform;

pub use aggregate::{aggregate, summarize, AggregatedStat, RunSummary, TileResult};
pub use bounds::Bounds;
pub use config::CensusConfig;
pub use error::{CensusError, Result};
pub use pipeline::{analyze_tile, Pipeline, RunReport, TileAnalysis, TileFailure, TileSettings, TileStage};
pub use raster::RasterTile;
pub use region::{CountryRegion, RegionIndex};
pub use source::{FetchedTile, LocalTileSource, TileRef, TileSource};
pub use stats::{AttributionStrategy, CountryPixelStat, ValidRange};
