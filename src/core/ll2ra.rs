use crate::core::lazy::{ChunkKernel, LazyMatrix};
use crate::core::radar_grid::RadarGrid;
use crate::core::transform::{BlockExtentIndex, TransformDataset};
use crate::types::{ChunkLayout, ChunkRegion, GeocodeError, GeocodeResult, MatrixRole};
use ndarray::Array2;
use rayon::prelude::*;
use rstar::primitives::GeomWithData;
use rstar::RTree;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Transform dataset point in (azimuth, range) space tagged with its linear index
type IndexedPoint = GeomWithData<[f64; 2], u32>;

/// Where the nearest-neighbor index comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NeighborSearch {
    /// Build a private R-tree per radar chunk from its candidate blocks
    #[default]
    PerChunk,
    /// Build one R-tree over the whole transform dataset, shared read-only by all chunks
    Shared,
}

/// Builds the geographic-to-radar index matrix
///
/// For every radar cell the nearest transform dataset point in
/// (azimuth, range) space is looked up and its linear index stored. The
/// output shares the radar grid's chunk partition exactly.
pub struct Ll2RaMatrixBuilder {
    grid: RadarGrid,
    transform: Arc<TransformDataset>,
    extents: Arc<BlockExtentIndex>,
    chunk: (usize, usize),
    search: NeighborSearch,
}

impl Ll2RaMatrixBuilder {
    /// Output chunk size
    pub fn new(
        grid: &RadarGrid,
        transform: Arc<TransformDataset>,
        extents: Arc<BlockExtentIndex>,
        chunk: (usize, usize),
    ) -> Self {
        Self {
            grid: grid.clone(),
            transform,
            extents,
            chunk,
            search: NeighborSearch::default(),
        }
    }

    pub fn with_search(mut self, search: NeighborSearch) -> Self {
        self.search = search;
        self
    }

    /// Describe the matrix as a lazy chunk graph
    ///
    /// Fails with [`GeocodeError::ChunkMismatch`] when the output partition
    /// would differ from the radar grid's.
    pub fn build(self) -> GeocodeResult<LazyMatrix> {
        let layout = ChunkLayout::new(self.grid.layout().shape, self.chunk)?;
        if layout != self.grid.layout() {
            return Err(GeocodeError::ChunkMismatch {
                expected: self.grid.layout(),
                actual: layout,
            });
        }

        let shared = match self.search {
            NeighborSearch::PerChunk => None,
            NeighborSearch::Shared => Some(Arc::new(self.shared_tree())),
        };

        let (dy, dx) = self.grid.cell_size();
        let kernel = Ll2RaKernel {
            y: self.grid.y().to_vec(),
            x: self.grid.x().to_vec(),
            margin: (dy.abs(), dx.abs()),
            transform: self.transform,
            extents: self.extents,
            shared,
        };

        log::debug!(
            "ll2ra: radar grid {}x{} in {} chunks, {:?} neighbor search",
            layout.shape.0,
            layout.shape.1,
            layout.num_chunks(),
            self.search
        );

        Ok(LazyMatrix::new(
            MatrixRole::Ll2Ra,
            self.grid.axes(),
            layout,
            Arc::new(kernel),
        ))
    }

    fn shared_tree(&self) -> RTree<IndexedPoint> {
        let points: Vec<IndexedPoint> = self
            .extents
            .extents()
            .par_iter()
            .flat_map_iter(|e| self.transform.block_points(e.block_row, e.block_col))
            .map(|(position, index)| IndexedPoint::new(position, index))
            .collect();

        log::debug!("ll2ra: shared R-tree over {} transform points", points.len());
        RTree::bulk_load(points)
    }
}

struct Ll2RaKernel {
    y: Vec<f64>,
    x: Vec<f64>,
    margin: (f64, f64),
    transform: Arc<TransformDataset>,
    extents: Arc<BlockExtentIndex>,
    shared: Option<Arc<RTree<IndexedPoint>>>,
}

impl ChunkKernel for Ll2RaKernel {
    fn compute_chunk(&self, region: &ChunkRegion) -> GeocodeResult<Array2<Option<u32>>> {
        let ys = &self.y[region.rows.clone()];
        let xs = &self.x[region.cols.clone()];

        let candidates = self
            .extents
            .candidates(min_max(ys), min_max(xs), self.margin);

        // Expected along scene mosaic seams
        if candidates.is_empty() {
            log::debug!(
                "ll2ra: no transform blocks near chunk ({}, {}), leaving it unmatched",
                region.block_row,
                region.block_col
            );
            return Ok(Array2::from_elem(region.shape(), None));
        }

        let local;
        let tree: &RTree<IndexedPoint> = match &self.shared {
            Some(tree) => tree.as_ref(),
            None => {
                let points: Vec<IndexedPoint> = candidates
                    .iter()
                    .flat_map(|e| self.transform.block_points(e.block_row, e.block_col))
                    .map(|(position, index)| IndexedPoint::new(position, index))
                    .collect();
                local = RTree::bulk_load(points);
                &local
            }
        };

        Ok(Array2::from_shape_fn(region.shape(), |(i, j)| {
            tree.nearest_neighbor(&[ys[i], xs[j]]).map(|p| p.data)
        }))
    }
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}
