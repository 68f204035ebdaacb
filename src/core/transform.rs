use crate::types::{
    check_addressable, BlockExtent, ChunkLayout, ChunkRegion, GeocodeError, GeocodeResult,
    GridAxes, TransformPoint,
};
use ndarray::Array2;
use rayon::prelude::*;

/// Precomputed radar <-> geographic correspondence on the geographic grid
///
/// Each (lat, lon) cell stores the azimuth/range it maps to and its linear
/// index in the geographic flattening. Cells without a radar position carry
/// non-finite azimuth or range.
#[derive(Debug, Clone)]
pub struct TransformDataset {
    azi: Array2<f64>,
    rng: Array2<f64>,
    idx: Array2<u32>,
    lat: Vec<f64>,
    lon: Vec<f64>,
    layout: ChunkLayout,
}

impl TransformDataset {
    /// Build from azimuth/range rasters, numbering cells row-major
    pub fn new(
        azi: Array2<f64>,
        rng: Array2<f64>,
        lat: Vec<f64>,
        lon: Vec<f64>,
        chunk: (usize, usize),
    ) -> GeocodeResult<Self> {
        let (rows, cols) = azi.dim();
        check_addressable(rows * cols)?;
        let idx = Array2::from_shape_fn((rows, cols), |(i, j)| (i * cols + j) as u32);
        Self::with_index(azi, rng, idx, lat, lon, chunk)
    }

    /// Build with an explicit linear index raster
    pub fn with_index(
        azi: Array2<f64>,
        rng: Array2<f64>,
        idx: Array2<u32>,
        lat: Vec<f64>,
        lon: Vec<f64>,
        chunk: (usize, usize),
    ) -> GeocodeResult<Self> {
        let shape = azi.dim();
        if rng.dim() != shape || idx.dim() != shape {
            return Err(GeocodeError::InvalidGrid(format!(
                "Transform fields disagree in shape: azi {:?}, rng {:?}, idx {:?}",
                shape, rng.dim(), idx.dim()
            )));
        }
        if (lat.len(), lon.len()) != shape {
            return Err(GeocodeError::InvalidGrid(format!(
                "Transform axes {}x{} do not match raster {}x{}",
                lat.len(), lon.len(), shape.0, shape.1
            )));
        }

        Ok(Self {
            layout: ChunkLayout::new(shape, chunk)?,
            azi,
            rng,
            idx,
            lat,
            lon,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.layout.shape
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    pub fn azimuth(&self) -> &Array2<f64> {
        &self.azi
    }

    pub fn range(&self) -> &Array2<f64> {
        &self.rng
    }

    pub fn index(&self) -> &Array2<u32> {
        &self.idx
    }

    pub fn axes(&self) -> GridAxes {
        GridAxes::Geographic {
            lat: self.lat.clone(),
            lon: self.lon.clone(),
        }
    }

    pub fn point(&self, row: usize, col: usize) -> TransformPoint {
        TransformPoint {
            azimuth: self.azi[[row, col]],
            range: self.rng[[row, col]],
            latitude: self.lat[row],
            longitude: self.lon[col],
            linear_index: self.idx[[row, col]],
        }
    }

    /// (azimuth, range) positions and linear indices of one chunk, skipping
    /// cells without a radar position
    pub fn block_points(&self, block_row: usize, block_col: usize) -> Vec<([f64; 2], u32)> {
        let region = self.layout.region(block_row, block_col);
        let mut points = Vec::with_capacity(region.rows.len() * region.cols.len());
        for i in region.rows.clone() {
            for j in region.cols.clone() {
                let (a, r) = (self.azi[[i, j]], self.rng[[i, j]]);
                if a.is_finite() && r.is_finite() {
                    points.push(([a, r], self.idx[[i, j]]));
                }
            }
        }
        points
    }

    fn block_extent(&self, region: &ChunkRegion) -> Option<BlockExtent> {
        let mut extent = BlockExtent {
            block_row: region.block_row,
            block_col: region.block_col,
            azimuth_min: f64::INFINITY,
            azimuth_max: f64::NEG_INFINITY,
            range_min: f64::INFINITY,
            range_max: f64::NEG_INFINITY,
        };
        let mut found = false;

        for i in region.rows.clone() {
            for j in region.cols.clone() {
                let (a, r) = (self.azi[[i, j]], self.rng[[i, j]]);
                if !(a.is_finite() && r.is_finite()) {
                    continue;
                }
                found = true;
                extent.azimuth_min = extent.azimuth_min.min(a);
                extent.azimuth_max = extent.azimuth_max.max(a);
                extent.range_min = extent.range_min.min(r);
                extent.range_max = extent.range_max.max(r);
            }
        }

        found.then_some(extent)
    }
}

/// Per-chunk radar bounding boxes of a [`TransformDataset`]
///
/// Immutable once computed; shared read-only by all chunk tasks.
#[derive(Debug, Clone, Default)]
pub struct BlockExtentIndex {
    extents: Vec<BlockExtent>,
}

impl BlockExtentIndex {
    /// Scan every chunk of the dataset. Chunks with no valid radar position are left out.
    pub fn from_dataset(dataset: &TransformDataset) -> Self {
        let extents: Vec<BlockExtent> = dataset
            .layout()
            .regions()
            .par_iter()
            .filter_map(|region| dataset.block_extent(region))
            .collect();

        log::debug!(
            "Block extent index: {} of {} transform chunks hold radar positions",
            extents.len(),
            dataset.layout().num_chunks()
        );
        Self { extents }
    }

    pub fn from_extents(extents: Vec<BlockExtent>) -> Self {
        Self { extents }
    }

    pub fn extents(&self) -> &[BlockExtent] {
        &self.extents
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Blocks whose extent, grown by `margin`, intersects the azimuth/range box
    pub fn candidates(
        &self,
        azimuth: (f64, f64),
        range: (f64, f64),
        margin: (f64, f64),
    ) -> Vec<&BlockExtent> {
        self.extents
            .iter()
            .filter(|e| e.intersects(azimuth, range, margin))
            .collect()
    }
}
