use crate::core::lazy::{CancellationToken, LazyMatrix, LogProgress, ProgressReporter};
use crate::core::ll2ra::{Ll2RaMatrixBuilder, NeighborSearch};
use crate::core::ra2ll::Ra2LlMatrixBuilder;
use crate::core::radar_grid::{PairStack, RadarGrid};
use crate::core::resample::{GridResampler, MissingAxisPolicy};
use crate::core::transform::{BlockExtentIndex, TransformDataset};
use crate::io::store::{ArtifactStore, Compression, Persisted};
use crate::types::{GeocodeResult, GridStack, MatrixRole};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Supplies the transform dataset, producing the supporting topography and
/// transform artifacts first when they do not exist yet
pub trait TransformSource: Send + Sync {
    fn transform_dataset(&self) -> GeocodeResult<Arc<TransformDataset>>;
}

impl TransformSource for Arc<TransformDataset> {
    fn transform_dataset(&self) -> GeocodeResult<Arc<TransformDataset>> {
        Ok(Arc::clone(self))
    }
}

/// Geocoding parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeParams {
    /// Chunk size (rows, cols) of the radar footprint, the matrices and resampled grids
    pub chunk_size: (usize, usize),
    /// Compression of persisted matrix chunks
    pub compression: Compression,
    /// Return lazy matrices instead of writing them
    pub interactive: bool,
    pub neighbor_search: NeighborSearch,
    pub missing_axis: MissingAxisPolicy,
}

impl Default for GeocodeParams {
    fn default() -> Self {
        Self {
            chunk_size: (512, 512),
            compression: Compression::default(),
            interactive: false,
            neighbor_search: NeighborSearch::PerChunk,
            missing_axis: MissingAxisPolicy::PassThrough,
        }
    }
}

/// Both matrices produced by [`Geocoder::geocode`]
#[derive(Debug)]
pub struct GeocodeOutcome {
    pub ll2ra: Persisted,
    pub ra2ll: Persisted,
}

/// Builds, persists and applies the interferogram geocoding matrices
pub struct Geocoder {
    store: ArtifactStore,
    params: GeocodeParams,
    progress: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
}

impl Geocoder {
    /// Geocoder persisting matrices under `root`
    pub fn new<P: AsRef<Path>>(root: P, params: GeocodeParams) -> Self {
        Self::with_store(ArtifactStore::new(root), params)
    }

    pub fn with_store(store: ArtifactStore, params: GeocodeParams) -> Self {
        Self {
            store: store.with_compression(params.compression),
            params,
            progress: Arc::new(LogProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn params(&self) -> &GeocodeParams {
        &self.params
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Token that stops a running build between chunk tasks
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Build both index matrices for the footprint of `pairs`
    ///
    /// Outside interactive mode both matrices are written to staging storage
    /// first and replace the stored pair only once both are complete, so a
    /// failed or cancelled run leaves the previous pair untouched.
    pub fn geocode(
        &self,
        source: &dyn TransformSource,
        pairs: &PairStack,
    ) -> GeocodeResult<GeocodeOutcome> {
        log::info!("Geocoding {} interferogram pairs", pairs.pairs.len());

        let transform = source.transform_dataset()?;
        log::debug!(
            "Transform dataset: {}x{} cells in {} chunks",
            transform.shape().0,
            transform.shape().1,
            transform.layout().num_chunks()
        );
        let extents = Arc::new(BlockExtentIndex::from_dataset(&transform));

        let grid = pairs.footprint(self.params.chunk_size)?;
        if let Some(fraction) = grid.coverage_fraction() {
            log::info!(
                "Radar footprint {}x{}, {:.1}% covered by pairs",
                grid.height(),
                grid.width(),
                fraction * 100.0
            );
        }

        let ll2ra = self.ll2ra_matrix(&grid, Arc::clone(&transform), extents)?;
        let ra2ll = Ra2LlMatrixBuilder::new(&grid, transform).build();

        if self.params.interactive {
            return Ok(GeocodeOutcome {
                ll2ra: self.persist(ll2ra)?,
                ra2ll: self.persist(ra2ll)?,
            });
        }

        let progress = self.progress.as_ref();
        let staged_ll2ra = self.store.stage(&ll2ra, progress, &self.cancel)?;
        let staged_ra2ll = self.store.stage(&ra2ll, progress, &self.cancel)?;
        let ll2ra = self.store.commit(staged_ll2ra)?;
        let ra2ll = self.store.commit(staged_ra2ll)?;

        log::info!("Geocoding matrices ready");
        Ok(GeocodeOutcome {
            ll2ra: Persisted::Materialized(ll2ra),
            ra2ll: Persisted::Materialized(ra2ll),
        })
    }

    fn ll2ra_matrix(
        &self,
        grid: &RadarGrid,
        transform: Arc<TransformDataset>,
        extents: Arc<BlockExtentIndex>,
    ) -> GeocodeResult<LazyMatrix> {
        Ll2RaMatrixBuilder::new(grid, transform, extents, self.params.chunk_size)
            .with_search(self.params.neighbor_search)
            .build()
    }

    fn persist(&self, lazy: LazyMatrix) -> GeocodeResult<Persisted> {
        self.store
            .persist(lazy, self.params.interactive, self.progress.as_ref(), &self.cancel)
    }

    /// Resampler over the persisted matrices
    pub fn resampler(&self) -> GeocodeResult<GridResampler> {
        let ra2ll = self.store.load(MatrixRole::Ra2Ll)?;
        let ll2ra = self.store.load(MatrixRole::Ll2Ra)?;
        Ok(GridResampler::new(ra2ll, ll2ra)?
            .with_chunk_size(self.params.chunk_size)
            .with_missing_axis(self.params.missing_axis))
    }

    pub fn to_geographic(&self, grids: GridStack) -> GeocodeResult<GridStack> {
        self.resampler()?.to_geographic(grids)
    }

    pub fn to_radar(&self, grids: GridStack) -> GeocodeResult<GridStack> {
        self.resampler()?.to_radar(grids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lazy::NoProgress;
    use crate::types::GeocodeError;
    use ndarray::{Array2, Array3};

    fn identity_transform() -> Arc<TransformDataset> {
        let azi = Array2::from_shape_fn((6, 6), |(i, _)| i as f64);
        let rng = Array2::from_shape_fn((6, 6), |(_, j)| j as f64);
        let lat = (0..6).map(|i| 45.0 + i as f64 * 0.001).collect();
        let lon = (0..6).map(|j| 7.0 + j as f64 * 0.001).collect();
        Arc::new(TransformDataset::new(azi, rng, lat, lon, (3, 3)).unwrap())
    }

    fn pairs() -> PairStack {
        PairStack::new(
            vec!["2021-03-01 2021-03-13".to_string()],
            Array3::ones((1, 4, 4)),
            (0..4).map(|i| i as f64).collect(),
            (0..4).map(|j| j as f64).collect(),
        )
        .unwrap()
    }

    fn params() -> GeocodeParams {
        GeocodeParams {
            chunk_size: (2, 2),
            ..GeocodeParams::default()
        }
    }

    #[test]
    fn test_default_params() {
        let params = GeocodeParams::default();
        assert_eq!(params.chunk_size, (512, 512));
        assert_eq!(params.compression, Compression::Deflate { level: 3 });
        assert!(!params.interactive);
    }

    #[test]
    fn test_geocode_persists_both() {
        let dir = tempfile::tempdir().unwrap();
        let geocoder = Geocoder::new(dir.path(), params()).with_progress(Arc::new(NoProgress));

        let outcome = geocoder.geocode(&identity_transform(), &pairs()).unwrap();
        assert!(outcome.ll2ra.artifact().is_some());
        assert!(outcome.ra2ll.artifact().is_some());

        let ra2ll = geocoder.store().load(MatrixRole::Ra2Ll).unwrap();
        assert_eq!(ra2ll.get(2, 3), Some(2 * 4 + 3));
        assert_eq!(ra2ll.get(5, 0), None);

        let ll2ra = geocoder.store().load(MatrixRole::Ll2Ra).unwrap();
        assert_eq!(ll2ra.get(1, 2), Some(6 + 2));
    }

    #[test]
    fn test_interactive_returns_lazy() {
        let dir = tempfile::tempdir().unwrap();
        let geocoder = Geocoder::new(
            dir.path(),
            GeocodeParams {
                interactive: true,
                ..params()
            },
        );

        let outcome = geocoder.geocode(&identity_transform(), &pairs()).unwrap();
        assert!(outcome.ll2ra.is_pending());
        assert!(outcome.ra2ll.is_pending());
        assert!(!geocoder.store().exists(MatrixRole::Ll2Ra));
        assert!(matches!(
            geocoder.resampler(),
            Err(GeocodeError::InvalidArtifact(_))
        ));
    }

    /// Cancels once every chunk of `role` is done
    struct CancelAfter {
        role: MatrixRole,
        cancel: CancellationToken,
    }

    impl ProgressReporter for CancelAfter {
        fn report(&self, label: &str, completed: usize, total: usize) {
            if label == self.role.label() && completed == total {
                self.cancel.cancel();
            }
        }
    }

    #[test]
    fn test_failed_geocode_keeps_previous_pair() {
        let dir = tempfile::tempdir().unwrap();
        let geocoder = Geocoder::new(dir.path(), params()).with_progress(Arc::new(NoProgress));
        geocoder.geocode(&identity_transform(), &pairs()).unwrap();
        let ll2ra = geocoder.store().load(MatrixRole::Ll2Ra).unwrap();
        let ra2ll = geocoder.store().load(MatrixRole::Ra2Ll).unwrap();

        // range axis mirrored, so the new ll2ra differs
        let azi = Array2::from_shape_fn((6, 6), |(i, _)| i as f64);
        let rng = Array2::from_shape_fn((6, 6), |(_, j)| 5.0 - j as f64);
        let lat = (0..6).map(|i| 45.0 + i as f64 * 0.001).collect();
        let lon = (0..6).map(|j| 7.0 + j as f64 * 0.001).collect();
        let mirrored = Arc::new(TransformDataset::new(azi, rng, lat, lon, (3, 3)).unwrap());

        let geocoder = Geocoder::new(dir.path(), params());
        let progress = CancelAfter {
            role: MatrixRole::Ll2Ra,
            cancel: geocoder.cancellation_token(),
        };
        let geocoder = geocoder.with_progress(Arc::new(progress));

        let result = geocoder.geocode(&mirrored, &pairs());
        assert!(matches!(result, Err(GeocodeError::Cancelled)));
        assert_eq!(geocoder.store().load(MatrixRole::Ll2Ra).unwrap(), ll2ra);
        assert_eq!(geocoder.store().load(MatrixRole::Ra2Ll).unwrap(), ra2ll);
        assert_eq!(ll2ra.get(1, 2), Some(6 + 2));
    }

    #[test]
    fn test_cancelled_geocode() {
        let dir = tempfile::tempdir().unwrap();
        let geocoder = Geocoder::new(dir.path(), params()).with_progress(Arc::new(NoProgress));
        geocoder.cancellation_token().cancel();

        let result = geocoder.geocode(&identity_transform(), &pairs());
        assert!(matches!(result, Err(GeocodeError::Cancelled)));
        assert!(!geocoder.store().exists(MatrixRole::Ll2Ra));
    }
}
