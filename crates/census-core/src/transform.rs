//! Affine pixel-to-map transform.
//!
//! Maps pixel coordinates (col, row) to map coordinates (x, y):
//!   x = c + a * col + b * row
//!   y = f + d * col + e * row
//!
//! Pixel (0, 0) is the outer corner of the upper-left pixel; pixel centres sit
//! at half-integer coordinates.
use serde::{Deserialize, Serialize};

use crate::bounds::Bounds;
use crate::error::{CensusError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl GeoTransform {
    /// North-up transform from the upper-left corner and pixel size.
    /// `pixel_height` is positive; rows grow southwards.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            a: pixel_width,
            b: 0.0,
            c: origin_x,
            d: 0.0,
            e: -pixel_height,
            f: origin_y,
        }
    }

    /// From a GDAL-ordered array `[c, a, b, f, d, e]`.
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self { a: gt[1], b: gt[2], c: gt[0], d: gt[4], e: gt[5], f: gt[3] }
    }

    #[inline]
    pub fn forward(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.c + self.a * col + self.b * row,
            self.f + self.d * col + self.e * row,
        )
    }

    /// Inverse transform: map (x, y) to fractional (col, row).
    pub fn inverse(&self) -> Result<GeoTransform> {
        let det = self.a * self.e - self.b * self.d;
        if det == 0.0 || !det.is_finite() {
            return Err(CensusError::Affine(format!(
                "singular transform (determinant {det})"
            )));
        }
        let inv = 1.0 / det;
        Ok(GeoTransform {
            a: self.e * inv,
            b: -self.b * inv,
            c: (self.b * self.f - self.e * self.c) * inv,
            d: -self.d * inv,
            e: self.a * inv,
            f: (self.d * self.c - self.a * self.f) * inv,
        })
    }

    /// Map-space rectangle enclosing a `width` × `height` grid.
    pub fn grid_bounds(&self, width: usize, height: usize) -> Bounds {
        let (w, h) = (width as f64, height as f64);
        let corners = [
            self.forward(0.0, 0.0),
            self.forward(w, 0.0),
            self.forward(w, h),
            self.forward(0.0, h),
        ];
        let xs = corners.map(|c| c.0);
        let ys = corners.map(|c| c.1);
        Bounds {
            min_x: xs.iter().cloned().fold(f64::INFINITY, f64::min),
            min_y: ys.iter().cloned().fold(f64::INFINITY, f64::min),
            max_x: xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            max_y: ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}
