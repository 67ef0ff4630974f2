//! Where tiles come from.
//!
//! A [`TileSource`] lists tile keys and materializes one tile at a time into
//! private temporary storage. The temporary file is removed when the
//! [`FetchedTile`] is dropped, whatever happened to the analysis.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{CensusError, Result};

/// Subdirectory label for tiles sitting directly under the prefix.
pub const ROOT_SUBDIR: &str = "root";

const EXTENSIONS: [&str; 2] = ["tif", "tiff"];

/// Identity of one tile in a listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileRef {
    /// Key relative to the source root, `/`-separated.
    pub id: String,
    /// Parent path relative to the listing prefix, or [`ROOT_SUBDIR`].
    pub subdir: String,
}

/// A tile copied into scoped temporary storage.
#[derive(Debug)]
pub struct FetchedTile {
    file: NamedTempFile,
}

impl FetchedTile {
    pub fn from_temp(file: NamedTempFile) -> Self {
        Self { file }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

pub trait TileSource: Send + Sync {
    /// Every tile under the configured prefix, sorted by id, truncated to
    /// `limit` entries when given.
    fn list(&self, limit: Option<usize>) -> Result<Vec<TileRef>>;

    fn fetch(&self, tile: &TileRef) -> Result<FetchedTile>;
}

/// Tiles stored on the local filesystem at `<root>/<prefix>`.
#[derive(Debug, Clone)]
pub struct LocalTileSource {
    root: PathBuf,
    prefix: String,
}

impl LocalTileSource {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self { root: root.into(), prefix: prefix.into() }
    }

    fn prefix_dir(&self) -> PathBuf {
        let trimmed = self.prefix.trim_matches('/');
        if trimmed.is_empty() {
            self.root.clone()
        } else {
            self.root.join(trimmed)
        }
    }
}

fn has_tiff_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

fn slash_join(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Subdirectory label of a path relative to the prefix directory.
pub fn subdir_label(relative: &Path) -> String {
    match relative.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => slash_join(parent),
        _ => ROOT_SUBDIR.to_string(),
    }
}

impl TileSource for LocalTileSource {
    fn list(&self, limit: Option<usize>) -> Result<Vec<TileRef>> {
        let dir = self.prefix_dir();
        if !dir.is_dir() {
            return Err(CensusError::Listing(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        info!(dir = %dir.display(), "Listing tiles");

        let mut tiles = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(true) {
            let entry = entry.map_err(|e| CensusError::Listing(e.to_string()))?;
            if !entry.file_type().is_file() || !has_tiff_extension(entry.path()) {
                continue;
            }
            let under_prefix = entry
                .path()
                .strip_prefix(&dir)
                .map_err(|e| CensusError::Listing(e.to_string()))?;
            let under_root = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| CensusError::Listing(e.to_string()))?;
            tiles.push(TileRef {
                id: slash_join(under_root),
                subdir: subdir_label(under_prefix),
            });
        }

        tiles.sort();
        if let Some(n) = limit {
            tiles.truncate(n);
        }
        info!(count = tiles.len(), "Found GeoTIFF files");
        Ok(tiles)
    }

    fn fetch(&self, tile: &TileRef) -> Result<FetchedTile> {
        let fail = |e: io::Error| CensusError::Fetch { id: tile.id.clone(), reason: e.to_string() };

        let src_path = self.root.join(&tile.id);
        let mut src = File::open(&src_path).map_err(fail)?;
        let mut tmp = tempfile::Builder::new()
            .prefix("tile-")
            .suffix(".tif")
            .tempfile()
            .map_err(fail)?;
        let bytes = io::copy(&mut src, tmp.as_file_mut()).map_err(fail)?;
        debug!(tile = %tile.id, bytes, tmp = %tmp.path().display(), "Fetched tile");
        Ok(FetchedTile::from_temp(tmp))
    }
}
