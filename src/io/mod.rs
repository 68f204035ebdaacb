//! Input/output modules

pub mod store;

pub use store::{
    ArtifactManifest, ArtifactNaming, ArtifactStore, Compression, DirectoryNaming,
    MatrixArtifact, Persisted, StagedMatrix,
};
