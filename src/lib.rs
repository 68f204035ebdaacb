//! intf-geocode: interferogram geocoding matrices
//!
//! Builds two complementary index matrices between the radar (azimuth/range)
//! grid of an interferogram stack and the geographic (lat/lon) grid of its
//! transform dataset, persists them as chunked artifacts and uses them to
//! resample data grids in either direction.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    AxisKind, BlockExtent, ChunkLayout, ChunkRegion, GeocodeError, GeocodeResult, GridAxes,
    GridStack, IndexMatrix, MatrixRole, TransformPoint, NO_INDEX,
};

pub use crate::core::{
    BlockExtentIndex, GeocodeParams, Geocoder, GridResampler, PairStack, RadarGrid,
    TransformDataset,
};
pub use crate::io::{ArtifactStore, Compression, Persisted};
