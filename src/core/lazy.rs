//! Lazy chunk graphs for index matrices
//!
//! Builders only describe how each chunk is computed. Work happens when a
//! [`LazyMatrix`] is materialized, either in memory with [`LazyMatrix::compute`]
//! or streamed to storage by the artifact store. Chunk tasks share nothing
//! mutable, so the result does not depend on scheduling order.

use crate::types::{
    ChunkLayout, ChunkRegion, GeocodeError, GeocodeResult, GridAxes, IndexMatrix, MatrixRole,
};
use ndarray::{s, Array2};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Per-chunk computation of an index matrix
pub trait ChunkKernel: Send + Sync {
    /// Compute the cells of one output chunk (`None` = no correspondence)
    fn compute_chunk(&self, region: &ChunkRegion) -> GeocodeResult<Array2<Option<u32>>>;
}

/// Receives materialization progress
pub trait ProgressReporter: Send + Sync {
    fn report(&self, label: &str, completed: usize, total: usize);
}

/// Logs progress at every 10% step
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn report(&self, label: &str, completed: usize, total: usize) {
        if total == 0 {
            return;
        }
        let decile = completed * 10 / total;
        let previous = completed.saturating_sub(1) * 10 / total;
        if completed == 1 || decile != previous || completed == total {
            log::info!(
                "{}: {}/{} chunks ({:.1}%)",
                label,
                completed,
                total,
                completed as f64 / total as f64 * 100.0
            );
        }
    }
}

/// Discards progress
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _label: &str, _completed: usize, _total: usize) {}
}

/// Cooperative cancellation flag, checked before every chunk task
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Not-yet-materialized index matrix
#[derive(Clone)]
pub struct LazyMatrix {
    role: MatrixRole,
    axes: GridAxes,
    layout: ChunkLayout,
    kernel: Arc<dyn ChunkKernel>,
}

impl std::fmt::Debug for LazyMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyMatrix")
            .field("role", &self.role)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl LazyMatrix {
    pub fn new(
        role: MatrixRole,
        axes: GridAxes,
        layout: ChunkLayout,
        kernel: Arc<dyn ChunkKernel>,
    ) -> Self {
        Self {
            role,
            axes,
            layout,
            kernel,
        }
    }

    pub fn role(&self) -> MatrixRole {
        self.role
    }

    pub fn axes(&self) -> &GridAxes {
        &self.axes
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    /// Evaluate a single chunk
    pub fn compute_chunk(&self, region: &ChunkRegion) -> GeocodeResult<Array2<Option<u32>>> {
        let block = self.kernel.compute_chunk(region)?;
        if block.dim() != region.shape() {
            return Err(GeocodeError::InvalidGrid(format!(
                "{} chunk ({}, {}) produced {:?} cells, expected {:?}",
                self.role,
                region.block_row,
                region.block_col,
                block.dim(),
                region.shape()
            )));
        }
        Ok(block)
    }

    /// Run every chunk task and hand each result to `sink`
    pub fn for_each_chunk<F>(
        &self,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
        sink: F,
    ) -> GeocodeResult<()>
    where
        F: Fn(&ChunkRegion, Array2<Option<u32>>) -> GeocodeResult<()> + Sync,
    {
        let regions = self.layout.regions();
        let total = regions.len();
        let completed = AtomicUsize::new(0);
        let label = self.role.label();

        let task = |region: &ChunkRegion| -> GeocodeResult<()> {
            if cancel.is_cancelled() {
                return Err(GeocodeError::Cancelled);
            }
            let block = self.compute_chunk(region)?;
            sink(region, block)?;
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            progress.report(label, done, total);
            Ok(())
        };

        #[cfg(feature = "parallel")]
        let result = {
            use rayon::prelude::*;
            regions.par_iter().try_for_each(task)
        };

        #[cfg(not(feature = "parallel"))]
        let result = regions.iter().try_for_each(task);

        result
    }

    /// Materialize the whole matrix in memory
    pub fn compute(
        &self,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> GeocodeResult<IndexMatrix> {
        let cells = Mutex::new(Array2::from_elem(self.layout.shape, None));

        self.for_each_chunk(progress, cancel, |region, block| {
            let mut cells = cells
                .lock()
                .map_err(|_| GeocodeError::InvalidGrid("Matrix assembly lock poisoned".to_string()))?;
            cells
                .slice_mut(s![region.rows.clone(), region.cols.clone()])
                .assign(&block);
            Ok(())
        })?;

        let cells = cells
            .into_inner()
            .map_err(|_| GeocodeError::InvalidGrid("Matrix assembly lock poisoned".to_string()))?;

        Ok(IndexMatrix {
            role: self.role,
            axes: self.axes.clone(),
            layout: self.layout,
            cells,
        })
    }
}
