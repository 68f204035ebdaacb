use crate::types::{
    AxisKind, ChunkLayout, GeocodeError, GeocodeResult, GridAxes, GridStack, IndexMatrix,
    MatrixRole,
};
use ndarray::{Array3, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What to do with a grid that is not in the expected coordinate system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MissingAxisPolicy {
    /// Log a warning and return the grid unchanged
    #[default]
    PassThrough,
    /// Fail with [`GeocodeError::MissingAxis`]
    Error,
}

/// Moves data grids between radar and geographic coordinates using the two
/// persisted index matrices
#[derive(Debug, Clone)]
pub struct GridResampler {
    ra2ll: Arc<IndexMatrix>,
    ll2ra: Arc<IndexMatrix>,
    chunk: (usize, usize),
    missing_axis: MissingAxisPolicy,
}

impl GridResampler {
    pub fn new(ra2ll: IndexMatrix, ll2ra: IndexMatrix) -> GeocodeResult<Self> {
        if ra2ll.role != MatrixRole::Ra2Ll || ll2ra.role != MatrixRole::Ll2Ra {
            return Err(GeocodeError::InvalidArtifact(format!(
                "Expected ({}, {}) matrices, got ({}, {})",
                MatrixRole::Ra2Ll,
                MatrixRole::Ll2Ra,
                ra2ll.role,
                ll2ra.role
            )));
        }
        if ra2ll.axes.kind() != AxisKind::Geographic || ll2ra.axes.kind() != AxisKind::Radar {
            return Err(GeocodeError::InvalidArtifact(
                "Index matrices carry swapped coordinate axes".to_string(),
            ));
        }
        check_targets(&ra2ll, ll2ra.layout.num_cells())?;
        check_targets(&ll2ra, ra2ll.layout.num_cells())?;

        Ok(Self {
            chunk: ra2ll.layout.chunk,
            ra2ll: Arc::new(ra2ll),
            ll2ra: Arc::new(ll2ra),
            missing_axis: MissingAxisPolicy::default(),
        })
    }

    /// Output chunk size for resampled grids
    pub fn with_chunk_size(mut self, chunk: (usize, usize)) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn with_missing_axis(mut self, policy: MissingAxisPolicy) -> Self {
        self.missing_axis = policy;
        self
    }

    pub fn radar_axes(&self) -> &GridAxes {
        &self.ll2ra.axes
    }

    pub fn geographic_axes(&self) -> &GridAxes {
        &self.ra2ll.axes
    }

    /// Resample radar grids onto the geographic grid
    ///
    /// Geographic cells without a radar correspondence become NaN.
    pub fn to_geographic(&self, grids: GridStack) -> GeocodeResult<GridStack> {
        if !self.accepts(&grids, AxisKind::Radar)? {
            return Ok(grids);
        }
        let grids = interp_nearest(&grids, self.radar_axes(), self.ll2ra.layout.chunk)?;
        self.gather(&grids, &self.ra2ll)
    }

    /// Resample geographic grids onto the radar grid
    pub fn to_radar(&self, grids: GridStack) -> GeocodeResult<GridStack> {
        if !self.accepts(&grids, AxisKind::Geographic)? {
            return Ok(grids);
        }
        let grids = interp_nearest(&grids, self.geographic_axes(), self.ra2ll.layout.chunk)?;
        // Unmatched radar cells only come from degenerate chunks
        self.gather(&grids, &self.ll2ra)
    }

    fn accepts(&self, grids: &GridStack, expected: AxisKind) -> GeocodeResult<bool> {
        let found = grids.axes.kind();
        if found == expected {
            return Ok(true);
        }
        match self.missing_axis {
            MissingAxisPolicy::PassThrough => {
                log::warn!(
                    "Grid is not in {} coordinates (found {}), skipping geocoding",
                    expected,
                    found
                );
                Ok(false)
            }
            MissingAxisPolicy::Error => Err(GeocodeError::MissingAxis { expected, found }),
        }
    }

    fn gather(&self, grids: &GridStack, matrix: &IndexMatrix) -> GeocodeResult<GridStack> {
        let (rows, cols) = matrix.layout.shape;
        let mut data = Array3::from_elem((grids.num_layers(), rows, cols), f32::NAN);

        for (mut out, source) in data.axis_iter_mut(Axis(0)).zip(grids.data.axis_iter(Axis(0))) {
            Zip::from(&mut out)
                .and(&matrix.cells)
                .par_for_each(|value, cell| {
                    if let Some(index) = cell {
                        *value = flat_get(&source, *index as usize);
                    }
                });
        }

        log::debug!(
            "Resampled {} layer(s) through {} onto {}x{} cells",
            grids.num_layers(),
            matrix.role,
            rows,
            cols
        );

        Ok(GridStack {
            data,
            axes: matrix.axes.clone(),
            layout: ChunkLayout::new((rows, cols), self.chunk)?,
            stacked: grids.stacked,
            coords: grids.coords.clone(),
        })
    }
}

fn flat_get(source: &ArrayView2<'_, f32>, index: usize) -> f32 {
    let cols = source.ncols();
    source
        .get((index / cols, index % cols))
        .copied()
        .unwrap_or(f32::NAN)
}

fn check_targets(matrix: &IndexMatrix, target_cells: usize) -> GeocodeResult<()> {
    let out_of_range = matrix
        .cells
        .iter()
        .flatten()
        .any(|&index| index as usize >= target_cells);
    if out_of_range {
        return Err(GeocodeError::InvalidArtifact(format!(
            "{} references cells beyond its {}-cell target grid",
            matrix.role, target_cells
        )));
    }
    Ok(())
}

/// Resample grids onto `target` axes by nearest coordinate
///
/// Target coordinates outside the source axis range get NaN. Grids already
/// on `target` are only re-chunked.
pub fn interp_nearest(
    grids: &GridStack,
    target: &GridAxes,
    chunk: (usize, usize),
) -> GeocodeResult<GridStack> {
    if grids.axes.kind() != target.kind() {
        return Err(GeocodeError::MissingAxis {
            expected: target.kind(),
            found: grids.axes.kind(),
        });
    }
    let layout = ChunkLayout::new(target.shape(), chunk)?;

    if grids.axes == *target {
        return Ok(GridStack {
            layout,
            ..grids.clone()
        });
    }

    let rows = nearest_indices(grids.axes.rows(), target.rows());
    let cols = nearest_indices(grids.axes.cols(), target.cols());
    let (height, width) = target.shape();

    let mut data = Array3::from_elem((grids.num_layers(), height, width), f32::NAN);
    for (mut out, source) in data.axis_iter_mut(Axis(0)).zip(grids.data.axis_iter(Axis(0))) {
        for (i, row) in rows.iter().enumerate() {
            let Some(si) = row else { continue };
            for (j, col) in cols.iter().enumerate() {
                if let Some(sj) = col {
                    out[[i, j]] = source[[*si, *sj]];
                }
            }
        }
    }

    Ok(GridStack {
        data,
        axes: target.clone(),
        layout,
        stacked: grids.stacked,
        coords: grids.coords.clone(),
    })
}

/// Index of the nearest `source` sample for each `target` coordinate, `None`
/// outside the source range
fn nearest_indices(source: &[f64], target: &[f64]) -> Vec<Option<usize>> {
    let mut order: Vec<usize> = (0..source.len()).collect();
    order.sort_by(|&a, &b| source[a].total_cmp(&source[b]));
    let sorted: Vec<f64> = order.iter().map(|&i| source[i]).collect();

    let (Some(&lo), Some(&hi)) = (sorted.first(), sorted.last()) else {
        return vec![None; target.len()];
    };
    let eps = 1e-9 * (hi - lo).abs().max(1.0);

    target
        .iter()
        .map(|&t| {
            if !(t >= lo - eps && t <= hi + eps) {
                return None;
            }
            let pos = sorted.partition_point(|&v| v < t);
            let best = match (pos.checked_sub(1), sorted.get(pos)) {
                (Some(below), Some(&above)) if (above - t) < (t - sorted[below]) => pos,
                (Some(below), Some(_)) => below,
                (Some(below), None) => below,
                (None, _) => pos,
            };
            Some(order[best])
        })
        .collect()
}
