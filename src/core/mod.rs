//! Core geocoding modules

pub mod geocode;
pub mod lazy;
pub mod ll2ra;
pub mod ra2ll;
pub mod radar_grid;
pub mod resample;
pub mod transform;

// Re-export main types
pub use geocode::{GeocodeOutcome, GeocodeParams, Geocoder, TransformSource};
pub use lazy::{CancellationToken, ChunkKernel, LazyMatrix, LogProgress, NoProgress, ProgressReporter};
pub use ll2ra::{Ll2RaMatrixBuilder, NeighborSearch};
pub use ra2ll::{radar_flat_index, Ra2LlMatrixBuilder};
pub use radar_grid::{PairStack, RadarGrid};
pub use resample::{interp_nearest, GridResampler, MissingAxisPolicy};
pub use transform::{BlockExtentIndex, TransformDataset};
