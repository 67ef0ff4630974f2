/// Tile census: per-country valid-pixel statistics over a tree of GeoTIFF
/// tiles, aggregated per (subdirectory, country) and written as CSV.
///
/// Layout expected under `--input`:
///   <prefix>/<subdir...>/<tile>.tif
/// Tiles directly under the prefix are reported under subdirectory "root".
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use census_core::export::{write_csv_file, write_tiles_json};
use census_core::{
    summarize, AttributionStrategy, CensusConfig, LocalTileSource, Pipeline, RegionIndex, RunSummary,
};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Strategy {
    /// Pixels whose centre lies inside the country polygon
    Exact,
    /// Every pixel of every tile the country touches
    Bbox,
}

impl From<Strategy> for AttributionStrategy {
    fn from(s: Strategy) -> Self {
        match s {
            Strategy::Exact => AttributionStrategy::ExactMask,
            Strategy::Bbox => AttributionStrategy::BoundingBox,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "tile-census",
    about = "Count valid pixels per country across GeoTIFF tiles and export a CSV summary"
)]
struct Args {
    /// JSON config file; flags given on the command line override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the tile tree
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Path under --input to list tiles from
    #[arg(long)]
    prefix: Option<String>,

    /// Output CSV path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Country polygons: GeoJSON FeatureCollection, or an ESRI shapefile (.shp)
    #[arg(long, visible_alias = "shapefile")]
    regions: Option<PathBuf>,

    /// Process only the first N tiles (for testing)
    #[arg(long)]
    limit: Option<usize>,

    /// Pixel attribution strategy
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,

    /// Worker threads (default: all logical CPUs)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Lowest valid sample value (inclusive)
    #[arg(long)]
    valid_min: Option<f64>,

    /// Highest valid sample value (inclusive)
    #[arg(long)]
    valid_max: Option<f64>,

    /// Feature property holding the country label (default: name, then NAME)
    #[arg(long)]
    label_property: Option<String>,

    /// Extra fetch attempts per tile
    #[arg(long)]
    fetch_retries: Option<u32>,

    /// Extra points per tile edge when reprojecting bounds
    #[arg(long)]
    densify: Option<usize>,

    /// Also write per-tile results as JSON
    #[arg(long)]
    tiles_json: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Args {
    /// Layer command-line values over a base configuration.
    fn apply(self, mut c: CensusConfig) -> CensusConfig {
        if let Some(v) = self.input {
            c.tile_root = v;
        }
        if let Some(v) = self.prefix {
            c.prefix = v;
        }
        if let Some(v) = self.output {
            c.output = v;
        }
        if let Some(v) = self.regions {
            c.regions = v;
        }
        if self.limit.is_some() {
            c.limit = self.limit;
        }
        if let Some(v) = self.strategy {
            c.strategy = v.into();
        }
        if self.jobs.is_some() {
            c.jobs = self.jobs;
        }
        if let Some(v) = self.valid_min {
            c.valid_range.low = v;
        }
        if let Some(v) = self.valid_max {
            c.valid_range.high = v;
        }
        if self.label_property.is_some() {
            c.label_property = self.label_property;
        }
        if let Some(v) = self.fetch_retries {
            c.fetch_retries = v;
        }
        if let Some(v) = self.densify {
            c.densify = v;
        }
        if self.tiles_json.is_some() {
            c.tiles_json = self.tiles_json;
        }
        c
    }

    fn log_level(&self) -> Level {
        if self.quiet {
            return Level::WARN;
        }
        match self.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

// ── Report ───────────────────────────────────────────────────────────────────

fn print_summary(summary: &RunSummary, processed: usize, failed: usize) {
    println!();
    println!("=== SUMMARY ===");
    println!("Tiles processed:          {processed}");
    println!("Tiles failed:             {failed}");
    println!("Subdirectories:           {}", summary.subdirectories);
    println!("Countries:                {}", summary.countries);
    println!("Country/tile pairs:       {}", summary.tiff_count);
    println!("Mean fraction valid:      {:.4}", summary.mean_fraction_valid);
    if !summary.top_countries.is_empty() {
        println!();
        println!("Top {} countries by total pixels:", summary.top_countries.len());
        for (country, total) in &summary.top_countries {
            println!("  {country:<32} {total:>14}");
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to install logger")?;

    let base = match &args.config {
        Some(path) => CensusConfig::from_json_file(path)
            .with_context(|| format!("Cannot load config {}", path.display()))?,
        None => CensusConfig::default(),
    };
    let config = args.apply(base);
    config.validate().context("Invalid configuration")?;

    let regions = RegionIndex::from_path(&config.regions, config.label_property.as_deref())
        .with_context(|| format!("Cannot load country shapes from {}", config.regions.display()))?;
    if regions.is_empty() {
        bail!("{} contains no usable country polygons", config.regions.display());
    }

    let source = LocalTileSource::new(&config.tile_root, config.prefix.clone());
    let report = Pipeline::new(&regions, &config)
        .run(&source)
        .with_context(|| format!("Cannot list tiles under {}", config.tile_root.display()))?;

    write_csv_file(&config.output, &report.aggregated)
        .with_context(|| format!("Cannot write {}", config.output.display()))?;
    if let Some(path) = &config.tiles_json {
        write_tiles_json(path, &report.results)
            .with_context(|| format!("Cannot write {}", path.display()))?;
    }

    info!(elapsed_ms = report.elapsed_ms, "Done");
    print_summary(&summarize(&report.aggregated), report.results.len(), report.failures.len());
    Ok(())
}
