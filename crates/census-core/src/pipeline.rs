//! Pipeline driver: lists tiles, analyses each one, folds the results.
//!
//! Per tile:
//!   1. Fetch into temporary storage (with bounded retries)
//!   2. Decode and normalize bounds to WGS84
//!   3. Find candidate countries
//!   4. Count pixels per country
//!
//! Any per-tile failure is logged and recorded; the run carries on. Only a
//! failed or empty listing aborts it.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use geo::{BooleanOps, BoundingRect, MultiPolygon};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::aggregate::{aggregate, AggregatedStat, TileResult};
use crate::bounds::Bounds;
use crate::config::CensusConfig;
use crate::crs::{normalize_bounds, reproject_polygons, CrsTransformer, WGS84};
use crate::error::{CensusError, Result};
use crate::raster::RasterTile;
use crate::rasterize::{rasterize_mask, OccupancyMask};
use crate::region::{CountryRegion, RegionIndex};
use crate::source::{FetchedTile, TileRef, TileSource};
use crate::stats::{compute_stat, AttributionStrategy, CountryPixelStat, Selection, ValidRange};

// ── Stages ────────────────────────────────────────────────────────────────────

/// How far a tile got through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TileStage {
    Pending,
    Downloaded,
    BoundsComputed,
    CountriesIdentified,
    StatisticsComputed,
}

impl fmt::Display for TileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TileStage::Pending => "pending",
            TileStage::Downloaded => "downloaded",
            TileStage::BoundsComputed => "bounds computed",
            TileStage::CountriesIdentified => "countries identified",
            TileStage::StatisticsComputed => "statistics computed",
        };
        f.write_str(s)
    }
}

/// A tile that did not make it. `stage` is the last stage it completed.
#[derive(Debug, Clone, Serialize)]
pub struct TileFailure {
    pub tile_id: String,
    pub stage: TileStage,
    pub error: String,
}

// ── Per-tile analysis ─────────────────────────────────────────────────────────

/// Knobs for the in-memory part of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileSettings {
    pub valid_range: ValidRange,
    pub strategy: AttributionStrategy,
    pub densify: usize,
}

impl Default for TileSettings {
    fn default() -> Self {
        Self {
            valid_range: ValidRange::default(),
            strategy: AttributionStrategy::default(),
            densify: 0,
        }
    }
}

impl From<&CensusConfig> for TileSettings {
    fn from(c: &CensusConfig) -> Self {
        Self { valid_range: c.valid_range, strategy: c.strategy, densify: c.densify }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TileAnalysis {
    /// Tile extent in WGS84.
    pub bounds: Bounds,
    /// Candidate countries, load order, each name once.
    pub countries: Vec<String>,
    pub analysis: BTreeMap<String, CountryPixelStat>,
}

/// Share of the tile's larger WGS84 side added around it before clipping.
const CLIP_MARGIN: f64 = 0.25;

/// Latitude bound for clip windows headed into a projected reference;
/// several projections (Mercator among them) are undefined at the poles.
const PROJECTED_LAT_LIMIT: f64 = 89.99;

/// WGS84 window around a tile that region polygons are clipped to.
fn clip_window(bounds: &Bounds, projected: bool) -> Bounds {
    let lat = if projected { PROJECTED_LAT_LIMIT } else { 90.0 };
    let pad = CLIP_MARGIN * bounds.width().max(bounds.height());
    bounds.padded(pad, &Bounds::new(-180.0, -lat, 180.0, lat))
}

/// The part of a region inside `window`, in the tile's native reference.
///
/// Clipping happens in WGS84 before any reprojection, so only vertices near
/// the tile ever reach its projection.
fn native_geometry<'r>(
    region: &'r CountryRegion,
    window: &Bounds,
    to_native: Option<&CrsTransformer>,
) -> Result<Cow<'r, MultiPolygon<f64>>> {
    let inside = region
        .geometry
        .bounding_rect()
        .is_some_and(|r| window.contains(&Bounds::from(r)));
    let clipped = if inside {
        Cow::Borrowed(&region.geometry)
    } else {
        let rect = MultiPolygon::new(vec![window.to_rect().to_polygon()]);
        Cow::Owned(region.geometry.intersection(&rect))
    };
    match to_native {
        None => Ok(clipped),
        Some(tf) => reproject_polygons(&clipped, tf).map(Cow::Owned),
    }
}

/// Bounds, candidates and per-country counts for one decoded tile.
///
/// Fails only when the tile's bounds cannot be brought into WGS84. A country
/// whose mask cannot be built gets zero counts. Regions sharing a label are
/// summed under that label.
pub fn analyze_tile(
    tile: &RasterTile,
    index: &RegionIndex,
    settings: &TileSettings,
) -> Result<TileAnalysis> {
    analyze_staged(tile, index, settings).map_err(|(_, e)| e)
}

/// [`analyze_tile`], reporting the last stage completed when it fails.
fn analyze_staged(
    tile: &RasterTile,
    index: &RegionIndex,
    settings: &TileSettings,
) -> std::result::Result<TileAnalysis, (TileStage, CensusError)> {
    let exact = settings.strategy == AttributionStrategy::ExactMask;
    let (bounds, to_native) = tile_bounds(tile, settings.densify, exact)
        .map_err(|e| (TileStage::Downloaded, e))?;
    debug!(stage = %TileStage::BoundsComputed, ?bounds, "Stage reached");

    let candidates = index.candidates(&bounds);
    debug!(stage = %TileStage::CountriesIdentified, candidates = candidates.len(), "Stage reached");

    let window = clip_window(&bounds, to_native.is_some());
    let mut countries: Vec<String> = Vec::with_capacity(candidates.len());
    let mut analysis: BTreeMap<String, CountryPixelStat> = BTreeMap::new();

    for region in candidates {
        let stat = match settings.strategy {
            AttributionStrategy::BoundingBox => {
                compute_stat(&tile.data, tile.nodata, Selection::Whole, settings.valid_range)
            }
            AttributionStrategy::ExactMask => {
                let mask = native_geometry(region, &window, to_native.as_ref())
                    .and_then(|g| rasterize_mask(&g, &tile.transform, tile.width, tile.height))
                    .unwrap_or_else(|e| {
                        warn!(country = %region.name, error = %e, "Mask failed, counting nothing");
                        OccupancyMask::empty(tile.width, tile.height)
                    });
                compute_stat(&tile.data, tile.nodata, Selection::Mask(&mask), settings.valid_range)
            }
        };

        match analysis.get_mut(&region.name) {
            Some(prev) => {
                *prev = CountryPixelStat::from_counts(
                    prev.total_pixels + stat.total_pixels,
                    prev.valid_pixels + stat.valid_pixels,
                );
            }
            None => {
                countries.push(region.name.clone());
                analysis.insert(region.name.clone(), stat);
            }
        }
    }

    Ok(TileAnalysis { bounds, countries, analysis })
}

/// WGS84 bounds of the tile and, for exact masks on projected tiles, the
/// transformer back into its native reference.
fn tile_bounds(
    tile: &RasterTile,
    densify: usize,
    exact: bool,
) -> Result<(Bounds, Option<CrsTransformer>)> {
    let bounds = normalize_bounds(tile.native_bounds(), tile.epsg, densify)?;
    let to_native = match tile.epsg {
        Some(code) if code != WGS84 && exact => Some(CrsTransformer::new(WGS84, code)?),
        _ => None,
    };
    Ok((bounds, to_native))
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Successful tiles, in listing order.
    pub results: Vec<TileResult>,
    pub failures: Vec<TileFailure>,
    pub aggregated: Vec<AggregatedStat>,
    pub elapsed_ms: u64,
}

pub struct Pipeline<'a> {
    index: &'a RegionIndex,
    settings: TileSettings,
    jobs: Option<usize>,
    fetch_retries: u32,
    limit: Option<usize>,
}

impl<'a> Pipeline<'a> {
    pub fn new(index: &'a RegionIndex, config: &CensusConfig) -> Self {
        Self {
            index,
            settings: TileSettings::from(config),
            jobs: config.jobs,
            fetch_retries: config.fetch_retries,
            limit: config.limit,
        }
    }

    /// Process every listed tile, then aggregate once.
    pub fn run<S: TileSource + ?Sized>(&self, source: &S) -> Result<RunReport> {
        let start = Instant::now();

        let tiles = source.list(self.limit)?;
        if tiles.is_empty() {
            return Err(CensusError::Listing("no GeoTIFF files found".to_string()));
        }
        info!(tiles = tiles.len(), countries = self.index.len(), "Starting analysis");

        let outcomes = self.process_all(source, &tiles)?;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(r) => results.push(r),
                Err(f) => failures.push(f),
            }
        }

        let aggregated = aggregate(&results);
        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            processed = results.len(),
            failed = failures.len(),
            rows = aggregated.len(),
            elapsed_ms,
            "Analysis complete"
        );
        if !failures.is_empty() {
            warn!(failed = failures.len(), "Some tiles could not be processed");
        }

        Ok(RunReport { results, failures, aggregated, elapsed_ms })
    }

    #[cfg(feature = "threading")]
    fn process_all<S: TileSource + ?Sized>(
        &self,
        source: &S,
        tiles: &[TileRef],
    ) -> Result<Vec<std::result::Result<TileResult, TileFailure>>> {
        use rayon::prelude::*;

        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(n) = self.jobs {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| CensusError::Config(format!("worker pool: {e}")))?;
        Ok(pool.install(|| tiles.par_iter().map(|t| self.process_tile(source, t)).collect()))
    }

    #[cfg(not(feature = "threading"))]
    fn process_all<S: TileSource + ?Sized>(
        &self,
        source: &S,
        tiles: &[TileRef],
    ) -> Result<Vec<std::result::Result<TileResult, TileFailure>>> {
        Ok(tiles.iter().map(|t| self.process_tile(source, t)).collect())
    }

    fn process_tile<S: TileSource + ?Sized>(
        &self,
        source: &S,
        tile: &TileRef,
    ) -> std::result::Result<TileResult, TileFailure> {
        let fail = |stage: TileStage, e: CensusError| {
            warn!(tile = %tile.id, %stage, error = %e, "Tile failed");
            TileFailure { tile_id: tile.id.clone(), stage, error: e.to_string() }
        };

        info!(tile = %tile.id, subdir = %tile.subdir, "Processing tile");
        let fetched = self.fetch_with_retries(source, tile).map_err(|e| fail(TileStage::Pending, e))?;
        debug!(tile = %tile.id, stage = %TileStage::Downloaded, "Stage reached");

        // `fetched` owns the temporary copy; it is removed when this returns.
        let raster = RasterTile::open(fetched.path()).map_err(|e| fail(TileStage::Downloaded, e))?;
        let outcome = analyze_staged(&raster, self.index, &self.settings)
            .map_err(|(stage, e)| fail(stage, e))?;

        debug!(tile = %tile.id, stage = %TileStage::StatisticsComputed, "Stage reached");
        if outcome.countries.is_empty() {
            debug!(tile = %tile.id, "No countries intersect tile");
        } else {
            info!(tile = %tile.id, countries = ?outcome.countries, "Found countries");
        }

        Ok(TileResult {
            tile_id: tile.id.clone(),
            subdir: tile.subdir.clone(),
            countries: outcome.countries,
            analysis: outcome.analysis,
        })
    }

    fn fetch_with_retries<S: TileSource + ?Sized>(&self, source: &S, tile: &TileRef) -> Result<FetchedTile> {
        let mut attempt = 0;
        loop {
            match source.fetch(tile) {
                Ok(f) => return Ok(f),
                Err(e) if attempt < self.fetch_retries => {
                    attempt += 1;
                    warn!(tile = %tile.id, attempt, error = %e, "Fetch failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
