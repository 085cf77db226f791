use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Spacing between neighbouring reference corners, in board units.
pub const DEFAULT_SQUARE_SIZE: f64 = 50.0;

/// Number of inner corners of a chessboard, `cols` across and `rows` down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSize {
    pub cols: u32,
    pub rows: u32,
}

impl PatternSize {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }

    /// Total number of corners.
    pub fn count(&self) -> usize {
        self.cols as usize * self.rows as usize
    }
}

impl Default for PatternSize {
    fn default() -> Self {
        Self::new(7, 5)
    }
}

impl std::fmt::Display for PatternSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{},{}", self.cols, self.rows)
    }
}

impl std::str::FromStr for PatternSize {
    type Err = Error;

    /// Parse `"cols,rows"`, e.g. `"7,5"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidPattern(s.to_string());
        let (cols, rows) = s.split_once(',').ok_or_else(invalid)?;
        let cols: u32 = cols.trim().parse().map_err(|_| invalid())?;
        let rows: u32 = rows.trim().parse().map_err(|_| invalid())?;
        // A chessboard needs at least a 2x2 grid of inner corners.
        if cols < 2 || rows < 2 {
            return Err(invalid());
        }
        Ok(Self { cols, rows })
    }
}

/// Reference corner positions of a flat chessboard.
///
/// Points are ordered row by row, matching the order in which corners are
/// reported by detection: index `row * cols + col` holds
/// `(col * square_size, row * square_size, 0)`.
pub fn object_points(pattern: PatternSize, square_size: f64) -> Vec<Point3<f64>> {
    let mut points = Vec::with_capacity(pattern.count());
    for row in 0..pattern.rows {
        for col in 0..pattern.cols {
            points.push(Point3::new(
                col as f64 * square_size,
                row as f64 * square_size,
                0.0,
            ));
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pattern() {
        let p: PatternSize = "7,5".parse().unwrap();
        assert_eq!(p, PatternSize::new(7, 5));
        let p: PatternSize = " 9 , 6 ".parse().unwrap();
        assert_eq!(p, PatternSize::new(9, 6));
        assert_eq!(p.to_string(), "9,6");

        for bad in ["", "7", "7x5", "7,", ",5", "a,b", "1,5", "7,-5"] {
            assert!(bad.parse::<PatternSize>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn default_pattern_grid() {
        let pattern = PatternSize::default();
        let pts = object_points(pattern, DEFAULT_SQUARE_SIZE);
        assert_eq!(pts.len(), 35);
        assert!(pts.iter().all(|p| p.z == 0.0));

        for row in 0..5 {
            for col in 0..7 {
                let p = pts[row * 7 + col];
                assert_eq!(p.x, col as f64 * 50.0);
                assert_eq!(p.y, row as f64 * 50.0);
            }
        }

        // neighbours along a row differ by exactly one square
        for w in pts[..7].windows(2) {
            assert_eq!(w[1].x - w[0].x, DEFAULT_SQUARE_SIZE);
            assert_eq!(w[1].y, w[0].y);
        }
        assert_eq!(pts[34].x, 300.0);
        assert_eq!(pts[34].y, 200.0);
    }
}
