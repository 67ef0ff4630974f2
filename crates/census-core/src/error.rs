use thiserror::Error;

/// Errors produced by the census pipeline.
///
/// Which variants are fatal depends on where they surface: a `Listing` error
/// aborts the run, everything raised while handling one tile only skips that
/// tile, and `Geometry` raised by the rasterizer only zeroes one country.
#[derive(Error, Debug)]
pub enum CensusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF decoding error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("Shapefile error: {0}")]
    Shapefile(#[from] shapefile::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Unsupported raster: {0}")]
    Raster(String),

    #[error("Unsupported CRS: {0}")]
    UnsupportedCrs(String),

    #[error("Projection failed: {0}")]
    Projection(String),

    #[error("Invalid geometry: {0}")]
    Geometry(String),

    #[error("Invalid affine transform: {0}")]
    Affine(String),

    #[error("Tile listing failed: {0}")]
    Listing(String),

    #[error("Fetching tile {id} failed: {reason}")]
    Fetch { id: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CensusError>;
