//! Polygon → pixel occupancy.
//!
//! A pixel belongs to a polygon when its centre lies inside it. Polygons are
//! carried into fractional pixel space through the inverse affine transform,
//! so rotated and sheared grids need no special casing, and then scanned one
//! row at a time along the line through the row's pixel centres.
//!
//! Boundary rule: an edge spans rows with `y0 <= y < y1` and a pixel is filled
//! when `x_left <= centre < x_right`. Two polygons sharing an edge therefore
//! never both claim a pixel whose centre lies exactly on that edge.
use geo::{Coord, LineString, MultiPolygon, Polygon};

use crate::error::{CensusError, Result};
use crate::transform::GeoTransform;

/// Row-major boolean grid aligned with a raster.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyMask {
    pub width: usize,
    pub height: usize,
    pub cells: Vec<bool>,
}

impl OccupancyMask {
    pub fn empty(width: usize, height: usize) -> Self {
        Self { width, height, cells: vec![false; width * height] }
    }

    /// Every pixel selected.
    pub fn full(width: usize, height: usize) -> Self {
        Self { width, height, cells: vec![true; width * height] }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> bool {
        self.cells[row * self.width + col]
    }

    pub fn count(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.cells.iter().any(|&c| c)
    }
}

/// A polygon edge in pixel space.
#[derive(Debug, Clone, Copy)]
struct Edge {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
}

impl Edge {
    /// Crossing with the horizontal line `y`, honouring the half-open rule.
    #[inline]
    fn crossing(&self, y: f64) -> Option<f64> {
        let (lo, hi) = if self.y0 <= self.y1 { (self.y0, self.y1) } else { (self.y1, self.y0) };
        if lo <= y && y < hi {
            let t = (y - self.y0) / (self.y1 - self.y0);
            Some(self.x0 + t * (self.x1 - self.x0))
        } else {
            None
        }
    }
}

/// Rasterize a multipolygon onto a `width` × `height` grid.
///
/// Rings are combined with the even-odd rule within a polygon, so holes are
/// excluded; the parts of a multipolygon are unioned. Rings with fewer than
/// three distinct vertices or non-finite coordinates are rejected.
pub fn rasterize_mask(
    geometry: &MultiPolygon<f64>,
    transform: &GeoTransform,
    width: usize,
    height: usize,
) -> Result<OccupancyMask> {
    let to_pixel = transform.inverse()?;
    let mut mask = OccupancyMask::empty(width, height);
    if width == 0 || height == 0 {
        return Ok(mask);
    }

    for polygon in &geometry.0 {
        let edges = pixel_edges(polygon, &to_pixel)?;
        fill_polygon(&edges, &mut mask);
    }
    Ok(mask)
}

fn pixel_edges(polygon: &Polygon<f64>, to_pixel: &GeoTransform) -> Result<Vec<Edge>> {
    let mut edges = Vec::new();
    for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
        validate_ring(ring)?;
        let pts: Vec<(f64, f64)> = ring.coords().map(|c| to_pixel.forward(c.x, c.y)).collect();
        for pair in pts.windows(2) {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            if y0 != y1 {
                edges.push(Edge { x0, y0, x1, y1 });
            }
        }
    }
    Ok(edges)
}

fn validate_ring(ring: &LineString<f64>) -> Result<()> {
    if ring.coords().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return Err(CensusError::Geometry("ring has non-finite coordinates".to_string()));
    }
    let mut distinct: Vec<Coord<f64>> = Vec::with_capacity(4);
    for c in ring.coords() {
        if !distinct.contains(c) {
            distinct.push(*c);
            if distinct.len() >= 3 {
                return Ok(());
            }
        }
    }
    Err(CensusError::Geometry(format!(
        "ring has {} distinct vertices, need at least 3",
        distinct.len()
    )))
}

/// First row whose centre the edge reaches, and the row after its last.
#[inline]
fn row_span(e: &Edge) -> (f64, f64) {
    let (lo, hi) = if e.y0 <= e.y1 { (e.y0, e.y1) } else { (e.y1, e.y0) };
    ((lo - 0.5).ceil(), (hi - 0.5).ceil())
}

/// Scanline fill with an edge table: each edge enters the active list on its
/// first row and leaves after its last, so a row only looks at the edges
/// that cross it.
fn fill_polygon(edges: &[Edge], mask: &mut OccupancyMask) {
    let height = mask.height as f64;
    let mut table: Vec<Vec<usize>> = vec![Vec::new(); mask.height];
    let mut last_row: Vec<usize> = vec![0; edges.len()];
    for (i, e) in edges.iter().enumerate() {
        let (start, end) = row_span(e);
        if end <= 0.0 || start >= height || end <= start {
            continue;
        }
        table[start.max(0.0) as usize].push(i);
        last_row[i] = end.min(height) as usize;
    }

    let mut active: Vec<usize> = Vec::new();
    let mut xs: Vec<f64> = Vec::new();
    for (row, entering) in table.iter().enumerate() {
        active.retain(|&i| last_row[i] > row);
        active.extend_from_slice(entering);
        if active.is_empty() {
            continue;
        }

        let y = row as f64 + 0.5;
        xs.clear();
        xs.extend(active.iter().filter_map(|&i| edges[i].crossing(y)));
        xs.sort_by(|a, b| a.total_cmp(b));

        for span in xs.chunks_exact(2) {
            let start = (span[0] - 0.5).ceil().max(0.0);
            let end = (span[1] - 0.5).ceil().min(mask.width as f64);
            if end <= start {
                continue;
            }
            let base = row * mask.width;
            for col in start as usize..end as usize {
                mask.cells[base + col] = true;
            }
        }
    }
}
