use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

/// Reserved "no valid correspondence" value for both index matrices.
///
/// Only ever written at the storage boundary; in memory a missing match is `None`.
pub const NO_INDEX: u32 = u32::MAX;

/// Single cell of the transform dataset (radar <-> geographic correspondence)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformPoint {
    pub azimuth: f64,
    pub range: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub linear_index: u32,
}

/// Bounding box of one transform dataset chunk in radar coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockExtent {
    pub block_row: usize,
    pub block_col: usize,
    pub azimuth_min: f64,
    pub azimuth_max: f64,
    pub range_min: f64,
    pub range_max: f64,
}

impl BlockExtent {
    /// True when this extent, grown by `margin` on every side, touches the box
    pub fn intersects(
        &self,
        azimuth: (f64, f64),
        range: (f64, f64),
        margin: (f64, f64),
    ) -> bool {
        self.azimuth_max >= azimuth.0 - margin.0
            && self.azimuth_min <= azimuth.1 + margin.0
            && self.range_max >= range.0 - margin.1
            && self.range_min <= range.1 + margin.1
    }
}

/// Regular chunk partition of a 2-D raster
///
/// Chunk sizes are clipped to the raster shape, so two layouts compare equal
/// exactly when they describe the same partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLayout {
    pub shape: (usize, usize),
    pub chunk: (usize, usize),
}

/// One chunk of a [`ChunkLayout`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRegion {
    pub block_row: usize,
    pub block_col: usize,
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl ChunkRegion {
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.cols.len())
    }
}

impl ChunkLayout {
    /// Create a partition of `shape` into chunks of at most `chunk` cells per axis
    pub fn new(shape: (usize, usize), chunk: (usize, usize)) -> GeocodeResult<Self> {
        if shape.0 == 0 || shape.1 == 0 {
            return Err(GeocodeError::InvalidGrid(format!(
                "Grid shape {}x{} is empty", shape.0, shape.1
            )));
        }
        if chunk.0 == 0 || chunk.1 == 0 {
            return Err(GeocodeError::InvalidGrid(format!(
                "Chunk size {}x{} must be positive", chunk.0, chunk.1
            )));
        }
        Ok(Self {
            shape,
            chunk: (chunk.0.min(shape.0), chunk.1.min(shape.1)),
        })
    }

    /// Number of chunks along each axis
    pub fn blocks(&self) -> (usize, usize) {
        (
            (self.shape.0 + self.chunk.0 - 1) / self.chunk.0,
            (self.shape.1 + self.chunk.1 - 1) / self.chunk.1,
        )
    }

    pub fn num_chunks(&self) -> usize {
        let (rows, cols) = self.blocks();
        rows * cols
    }

    pub fn num_cells(&self) -> usize {
        self.shape.0 * self.shape.1
    }

    pub fn region(&self, block_row: usize, block_col: usize) -> ChunkRegion {
        let row_start = block_row * self.chunk.0;
        let col_start = block_col * self.chunk.1;
        ChunkRegion {
            block_row,
            block_col,
            rows: row_start..(row_start + self.chunk.0).min(self.shape.0),
            cols: col_start..(col_start + self.chunk.1).min(self.shape.1),
        }
    }

    /// All chunks in row-major block order
    pub fn regions(&self) -> Vec<ChunkRegion> {
        let (rows, cols) = self.blocks();
        (0..rows)
            .flat_map(|br| (0..cols).map(move |bc| (br, bc)))
            .map(|(br, bc)| self.region(br, bc))
            .collect()
    }
}

/// Which coordinate system a grid lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisKind {
    /// Azimuth/range sample indices (y, x)
    Radar,
    /// Latitude/longitude
    Geographic,
}

impl std::fmt::Display for AxisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AxisKind::Radar => write!(f, "(y, x)"),
            AxisKind::Geographic => write!(f, "(lat, lon)"),
        }
    }
}

/// 1-D coordinate axes of a 2-D grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GridAxes {
    Radar { y: Vec<f64>, x: Vec<f64> },
    Geographic { lat: Vec<f64>, lon: Vec<f64> },
}

impl GridAxes {
    pub fn kind(&self) -> AxisKind {
        match self {
            GridAxes::Radar { .. } => AxisKind::Radar,
            GridAxes::Geographic { .. } => AxisKind::Geographic,
        }
    }

    /// Row-axis coordinates (y or lat)
    pub fn rows(&self) -> &[f64] {
        match self {
            GridAxes::Radar { y, .. } => y,
            GridAxes::Geographic { lat, .. } => lat,
        }
    }

    /// Column-axis coordinates (x or lon)
    pub fn cols(&self) -> &[f64] {
        match self {
            GridAxes::Radar { x, .. } => x,
            GridAxes::Geographic { lon, .. } => lon,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows().len(), self.cols().len())
    }
}

/// Semantic role of a persisted index matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatrixRole {
    /// Geographic grid -> flat radar index
    Ra2Ll,
    /// Radar grid -> flat transform dataset index
    Ll2Ra,
}

impl MatrixRole {
    /// Fixed storage key
    pub fn key(&self) -> &'static str {
        match self {
            MatrixRole::Ra2Ll => "intf_ra2ll",
            MatrixRole::Ll2Ra => "intf_ll2ra",
        }
    }

    /// Progress label used while materializing
    pub fn label(&self) -> &'static str {
        match self {
            MatrixRole::Ra2Ll => "Build ra2ll Transform",
            MatrixRole::Ll2Ra => "Build ll2ra Transform",
        }
    }
}

impl std::fmt::Display for MatrixRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Materialized index matrix
///
/// `None` marks cells without a valid correspondence; the reserved
/// [`NO_INDEX`] value never appears here.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatrix {
    pub role: MatrixRole,
    pub axes: GridAxes,
    pub layout: ChunkLayout,
    pub cells: Array2<Option<u32>>,
}

impl IndexMatrix {
    pub fn get(&self, row: usize, col: usize) -> Option<u32> {
        self.cells.get((row, col)).copied().flatten()
    }

    /// Number of cells holding a valid index
    pub fn valid_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    /// Sentinel-encoded copy for serialization
    pub fn to_raw(&self) -> Array2<u32> {
        self.cells.mapv(|c| c.unwrap_or(NO_INDEX))
    }
}

/// One or more data layers sharing the same 2-D axes
#[derive(Debug, Clone, PartialEq)]
pub struct GridStack {
    /// (layer, row, col)
    pub data: Array3<f32>,
    pub axes: GridAxes,
    pub layout: ChunkLayout,
    /// False for a single 2-D grid wrapped as one layer
    pub stacked: bool,
    /// Non-spatial coordinate metadata (e.g. pair dates), carried through unchanged
    pub coords: BTreeMap<String, Vec<f64>>,
}

impl GridStack {
    /// Wrap a single 2-D grid
    pub fn single(data: Array2<f32>, axes: GridAxes, chunk: (usize, usize)) -> GeocodeResult<Self> {
        let mut grid = Self::stack(data.insert_axis(Axis(0)), axes, chunk)?;
        grid.stacked = false;
        Ok(grid)
    }

    /// Wrap a (layer, row, col) stack
    pub fn stack(data: Array3<f32>, axes: GridAxes, chunk: (usize, usize)) -> GeocodeResult<Self> {
        let (_, rows, cols) = data.dim();
        if axes.shape() != (rows, cols) {
            return Err(GeocodeError::InvalidGrid(format!(
                "Grid data {}x{} does not match axes {}x{}",
                rows, cols, axes.shape().0, axes.shape().1
            )));
        }
        Ok(Self {
            layout: ChunkLayout::new((rows, cols), chunk)?,
            data,
            axes,
            stacked: true,
            coords: BTreeMap::new(),
        })
    }

    /// Attach a non-spatial coordinate
    pub fn with_coord(mut self, name: &str, values: Vec<f64>) -> Self {
        self.coords.insert(name.to_string(), values);
        self
    }

    pub fn num_layers(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn layer(&self, index: usize) -> ArrayView2<'_, f32> {
        self.data.index_axis(Axis(0), index)
    }
}

/// Error types for geocoding
#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error("Chunk mismatch: expected {expected:?}, got {actual:?}")]
    ChunkMismatch {
        expected: ChunkLayout,
        actual: ChunkLayout,
    },

    #[error("Grid is not in {expected} coordinates (found {found})")]
    MissingAxis { expected: AxisKind, found: AxisKind },

    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("Grid of {cells} cells cannot be addressed by a 32-bit flat index")]
    GridTooLarge { cells: usize },

    #[error("Computation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for geocoding operations
pub type GeocodeResult<T> = Result<T, GeocodeError>;

/// Fail when flat indices over `cells` cells could reach [`NO_INDEX`]
pub(crate) fn check_addressable(cells: usize) -> GeocodeResult<()> {
    if cells >= NO_INDEX as usize {
        return Err(GeocodeError::GridTooLarge { cells });
    }
    Ok(())
}
