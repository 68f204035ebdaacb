use crate::types::{check_addressable, ChunkLayout, GeocodeError, GeocodeResult, GridAxes};
use ndarray::{Array2, Array3, Axis, Zip};

/// Target radar raster for matrix builds
///
/// Axes are azimuth (y) and range (x) sample coordinates on a regular
/// spacing; the chunk partition is what the geographic-to-radar matrix
/// must reproduce exactly.
#[derive(Debug, Clone)]
pub struct RadarGrid {
    y: Vec<f64>,
    x: Vec<f64>,
    layout: ChunkLayout,
    /// Cells covered by at least one interferogram pair
    coverage: Option<Array2<bool>>,
}

impl RadarGrid {
    /// Grid from explicit axis coordinates
    pub fn new(y: Vec<f64>, x: Vec<f64>, chunk: (usize, usize)) -> GeocodeResult<Self> {
        let layout = ChunkLayout::new((y.len(), x.len()), chunk)?;
        check_addressable(layout.num_cells())?;
        Ok(Self {
            y,
            x,
            layout,
            coverage: None,
        })
    }

    /// Regular grid of `shape` cells starting at `origin` (y, x)
    pub fn regular(
        origin: (f64, f64),
        cell_size: (f64, f64),
        shape: (usize, usize),
        chunk: (usize, usize),
    ) -> GeocodeResult<Self> {
        let y = (0..shape.0).map(|i| origin.0 + i as f64 * cell_size.0).collect();
        let x = (0..shape.1).map(|j| origin.1 + j as f64 * cell_size.1).collect();
        Self::new(y, x, chunk)
    }

    /// Attach a coverage mask; must match the grid shape
    pub fn with_coverage(mut self, coverage: Array2<bool>) -> GeocodeResult<Self> {
        if coverage.dim() != self.layout.shape {
            return Err(GeocodeError::InvalidGrid(format!(
                "Coverage mask {:?} does not match radar grid {:?}",
                coverage.dim(),
                self.layout.shape
            )));
        }
        self.coverage = Some(coverage);
        Ok(self)
    }

    /// Same axes, different chunk partition
    pub fn rechunk(&self, chunk: (usize, usize)) -> GeocodeResult<Self> {
        Ok(Self {
            layout: ChunkLayout::new(self.layout.shape, chunk)?,
            ..self.clone()
        })
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn height(&self) -> usize {
        self.y.len()
    }

    pub fn width(&self) -> usize {
        self.x.len()
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    pub fn coverage(&self) -> Option<&Array2<bool>> {
        self.coverage.as_ref()
    }

    /// Share of cells covered by any pair, when a coverage mask is attached
    pub fn coverage_fraction(&self) -> Option<f64> {
        self.coverage.as_ref().map(|mask| {
            mask.iter().filter(|&&covered| covered).count() as f64 / mask.len() as f64
        })
    }

    pub fn axes(&self) -> GridAxes {
        GridAxes::Radar {
            y: self.y.clone(),
            x: self.x.clone(),
        }
    }

    /// Minimum azimuth and range coordinate
    pub fn origin(&self) -> (f64, f64) {
        (axis_min(&self.y), axis_min(&self.x))
    }

    /// Axis step in azimuth and range; a single-sample axis counts as unit spacing
    pub fn cell_size(&self) -> (f64, f64) {
        (axis_step(&self.y), axis_step(&self.x))
    }
}

fn axis_min(axis: &[f64]) -> f64 {
    axis.iter().copied().fold(f64::INFINITY, f64::min)
}

fn axis_step(axis: &[f64]) -> f64 {
    if axis.len() < 2 {
        1.0
    } else {
        axis[1] - axis[0]
    }
}

/// Stack of interferogram pairs sharing radar axes
#[derive(Debug, Clone)]
pub struct PairStack {
    pub pairs: Vec<String>,
    /// (pair, y, x)
    pub data: Array3<f32>,
    pub y: Vec<f64>,
    pub x: Vec<f64>,
}

impl PairStack {
    pub fn new(pairs: Vec<String>, data: Array3<f32>, y: Vec<f64>, x: Vec<f64>) -> GeocodeResult<Self> {
        let (count, rows, cols) = data.dim();
        if count != pairs.len() {
            return Err(GeocodeError::InvalidGrid(format!(
                "Pair stack holds {} layers for {} pair names",
                count,
                pairs.len()
            )));
        }
        if (rows, cols) != (y.len(), x.len()) {
            return Err(GeocodeError::InvalidGrid(format!(
                "Pair stack {}x{} does not match axes {}x{}",
                rows,
                cols,
                y.len(),
                x.len()
            )));
        }
        Ok(Self { pairs, data, y, x })
    }

    /// Representative radar footprint: a cell is covered when any pair holds
    /// a finite value there
    pub fn footprint(&self, chunk: (usize, usize)) -> GeocodeResult<RadarGrid> {
        if self.pairs.is_empty() {
            return Err(GeocodeError::InvalidGrid(
                "No interferogram pairs available to derive the radar footprint".to_string(),
            ));
        }

        let (_, rows, cols) = self.data.dim();
        let mut coverage = Array2::from_elem((rows, cols), false);
        for layer in self.data.axis_iter(Axis(0)) {
            Zip::from(&mut coverage)
                .and(&layer)
                .for_each(|covered, &value| *covered |= value.is_finite());
        }

        log::debug!(
            "Radar footprint from {} pairs: {}x{} cells",
            self.pairs.len(),
            rows,
            cols
        );

        RadarGrid::new(self.y.clone(), self.x.clone(), chunk)?.with_coverage(coverage)
    }
}
