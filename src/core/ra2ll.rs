use crate::core::lazy::{ChunkKernel, LazyMatrix};
use crate::core::radar_grid::RadarGrid;
use crate::core::transform::TransformDataset;
use crate::types::{ChunkRegion, GeocodeResult, MatrixRole};
use ndarray::Array2;
use std::sync::Arc;

/// Builds the radar-to-geographic index matrix
///
/// Every transform dataset cell is snapped to the nearest radar grid cell by
/// affine rounding of its azimuth/range; cells that land outside the radar
/// grid get no index. The result lives on the geographic grid and shares the
/// transform dataset's chunk partition.
pub struct Ra2LlMatrixBuilder {
    origin: (f64, f64),
    cell_size: (f64, f64),
    shape: (usize, usize),
    transform: Arc<TransformDataset>,
}

impl Ra2LlMatrixBuilder {
    pub fn new(grid: &RadarGrid, transform: Arc<TransformDataset>) -> Self {
        Self {
            origin: grid.origin(),
            cell_size: grid.cell_size(),
            shape: (grid.height(), grid.width()),
            transform,
        }
    }

    /// Describe the matrix as a lazy chunk graph
    pub fn build(self) -> LazyMatrix {
        log::debug!(
            "ra2ll: radar grid {}x{}, origin {:?}, cell size {:?}, {} transform chunks",
            self.shape.0,
            self.shape.1,
            self.origin,
            self.cell_size,
            self.transform.layout().num_chunks()
        );

        let axes = self.transform.axes();
        let layout = self.transform.layout();
        LazyMatrix::new(MatrixRole::Ra2Ll, axes, layout, Arc::new(self))
    }
}

impl ChunkKernel for Ra2LlMatrixBuilder {
    fn compute_chunk(&self, region: &ChunkRegion) -> GeocodeResult<Array2<Option<u32>>> {
        let azi = self.transform.azimuth();
        let rng = self.transform.range();
        let (r0, c0) = (region.rows.start, region.cols.start);

        Ok(Array2::from_shape_fn(region.shape(), |(i, j)| {
            radar_flat_index(
                azi[[r0 + i, c0 + j]],
                rng[[r0 + i, c0 + j]],
                self.origin,
                self.cell_size,
                self.shape,
            )
        }))
    }
}

/// Flat `row * width + col` index of the radar cell nearest to (azimuth, range)
pub fn radar_flat_index(
    azimuth: f64,
    range: f64,
    origin: (f64, f64),
    cell_size: (f64, f64),
    shape: (usize, usize),
) -> Option<u32> {
    let row = snap(azimuth, origin.0, cell_size.0, shape.0)?;
    let col = snap(range, origin.1, cell_size.1, shape.1)?;
    Some((row * shape.1 + col) as u32)
}

fn snap(value: f64, origin: f64, step: f64, size: usize) -> Option<usize> {
    let index = ((value - origin) / step).round_ties_even();
    if index.is_finite() && index >= 0.0 && index < size as f64 {
        Some(index as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lazy::{CancellationToken, NoProgress};

    /// 4x4 geographic grid with radar positions only at the four corners
    fn corner_transform() -> TransformDataset {
        let mut azi = Array2::from_elem((4, 4), f64::NAN);
        let mut rng = Array2::from_elem((4, 4), f64::NAN);
        for &(i, j) in &[(0, 0), (0, 3), (3, 0), (3, 3)] {
            azi[[i, j]] = i as f64;
            rng[[i, j]] = j as f64;
        }
        let lat = vec![50.0, 50.1, 50.2, 50.3];
        let lon = vec![8.0, 8.1, 8.2, 8.3];
        TransformDataset::new(azi, rng, lat, lon, (2, 2)).unwrap()
    }

    #[test]
    fn test_corner_points() {
        let grid = RadarGrid::regular((0.0, 0.0), (1.0, 1.0), (4, 4), (2, 2)).unwrap();
        let lazy = Ra2LlMatrixBuilder::new(&grid, Arc::new(corner_transform())).build();
        let matrix = lazy.compute(&NoProgress, &CancellationToken::new()).unwrap();

        assert_eq!(matrix.get(0, 0), Some(0));
        assert_eq!(matrix.get(0, 3), Some(3));
        assert_eq!(matrix.get(3, 0), Some(12));
        assert_eq!(matrix.get(3, 3), Some(15));
        assert_eq!(matrix.valid_count(), 4);
        assert_eq!(matrix.role, MatrixRole::Ra2Ll);
    }

    #[test]
    fn test_outside_grid_has_no_index() {
        let shape = (4, 4);
        assert_eq!(radar_flat_index(-0.6, 0.0, (0.0, 0.0), (1.0, 1.0), shape), None);
        assert_eq!(radar_flat_index(0.0, 3.6, (0.0, 0.0), (1.0, 1.0), shape), None);
        assert_eq!(radar_flat_index(-0.4, 3.4, (0.0, 0.0), (1.0, 1.0), shape), Some(3));
        assert_eq!(radar_flat_index(f64::NAN, 1.0, (0.0, 0.0), (1.0, 1.0), shape), None);
    }

    #[test]
    fn test_rounding_and_scaling() {
        // 2x4 looks: azimuth step 2, range step 4, origin (1, 2)
        let shape = (10, 10);
        let origin = (1.0, 2.0);
        let cell = (2.0, 4.0);
        assert_eq!(radar_flat_index(5.0, 10.0, origin, cell, shape), Some(2 * 10 + 2));
        assert_eq!(radar_flat_index(5.9, 11.9, origin, cell, shape), Some(2 * 10 + 2));
        // ties go to the even cell
        assert_eq!(radar_flat_index(2.0, 2.0, origin, cell, shape), Some(0));
    }

    #[test]
    fn test_layout_follows_transform() {
        let grid = RadarGrid::regular((0.0, 0.0), (1.0, 1.0), (4, 4), (4, 4)).unwrap();
        let transform = Arc::new(corner_transform());
        let lazy = Ra2LlMatrixBuilder::new(&grid, Arc::clone(&transform)).build();
        assert_eq!(lazy.layout(), transform.layout());
        assert_eq!(lazy.axes(), &transform.axes());
    }
}
