//! Durable chunked storage for index matrices
//!
//! Each matrix is a directory holding `manifest.json` and one file per chunk
//! under `chunks/`, named `<block_row>.<block_col>`. Chunk files are
//! little-endian `u32` cells in row-major order with [`NO_INDEX`] marking
//! cells without a match, optionally zlib-compressed.
//!
//! Writes go to a staging directory next to the target; the finished
//! artifact replaces the previous one only after every chunk is written.

use crate::core::lazy::{CancellationToken, LazyMatrix, ProgressReporter};
use crate::types::{
    ChunkLayout, GeocodeError, GeocodeResult, GridAxes, IndexMatrix, MatrixRole, NO_INDEX,
};
use chrono::{DateTime, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const MANIFEST_FILE: &str = "manifest.json";
const CHUNKS_DIR: &str = "chunks";
const FORMAT_VERSION: u32 = 1;

/// Chunk compression scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "codec", rename_all = "lowercase")]
pub enum Compression {
    None,
    /// zlib at the given level (0-9)
    Deflate { level: u32 },
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Deflate { level: 3 }
    }
}

/// Resolves a matrix storage key to a filesystem path
pub trait ArtifactNaming: Send + Sync {
    fn resolve(&self, key: &str) -> PathBuf;
}

/// Stores every artifact directly under one root directory
#[derive(Debug, Clone)]
pub struct DirectoryNaming {
    root: PathBuf,
}

impl DirectoryNaming {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl ArtifactNaming for DirectoryNaming {
    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

/// Artifact metadata written next to the chunk files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub format_version: u32,
    pub role: MatrixRole,
    pub shape: (usize, usize),
    pub chunk: (usize, usize),
    pub axes: GridAxes,
    pub compression: Compression,
    pub sentinel: u32,
    pub created: DateTime<Utc>,
}

/// Handle to a matrix materialized on disk
#[derive(Debug, Clone)]
pub struct MatrixArtifact {
    pub path: PathBuf,
    pub manifest: ArtifactManifest,
}

/// Outcome of [`ArtifactStore::persist`]
#[derive(Debug)]
pub enum Persisted {
    /// Written to durable storage
    Materialized(MatrixArtifact),
    /// Interactive mode: nothing was computed or written
    Pending(LazyMatrix),
}

impl Persisted {
    pub fn is_pending(&self) -> bool {
        matches!(self, Persisted::Pending(_))
    }

    pub fn artifact(&self) -> Option<&MatrixArtifact> {
        match self {
            Persisted::Materialized(artifact) => Some(artifact),
            Persisted::Pending(_) => None,
        }
    }

    pub fn into_pending(self) -> Option<LazyMatrix> {
        match self {
            Persisted::Pending(lazy) => Some(lazy),
            Persisted::Materialized(_) => None,
        }
    }
}

/// Matrix fully written to staging storage but not yet in place
#[derive(Debug)]
pub struct StagedMatrix {
    staging: TempDir,
    parent: PathBuf,
    layout: ChunkLayout,
    artifact: MatrixArtifact,
}

/// Chunked on-disk store for index matrices
pub struct ArtifactStore {
    naming: Box<dyn ArtifactNaming>,
    compression: Compression,
}

impl ArtifactStore {
    /// Store artifacts under `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self::with_naming(DirectoryNaming::new(root))
    }

    pub fn with_naming<N: ArtifactNaming + 'static>(naming: N) -> Self {
        Self {
            naming: Box::new(naming),
            compression: Compression::default(),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn path_for(&self, role: MatrixRole) -> PathBuf {
        self.naming.resolve(role.key())
    }

    pub fn exists(&self, role: MatrixRole) -> bool {
        self.path_for(role).join(MANIFEST_FILE).is_file()
    }

    /// Delete the stored artifact, if any
    pub fn remove(&self, role: MatrixRole) -> GeocodeResult<()> {
        let path = self.path_for(role);
        if path.exists() {
            log::debug!("Removing {} at {}", role, path.display());
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    /// Materialize `lazy` to storage, or hand it back untouched in interactive mode
    pub fn persist(
        &self,
        lazy: LazyMatrix,
        interactive: bool,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> GeocodeResult<Persisted> {
        if interactive {
            log::info!("Interactive mode: {} left unmaterialized", lazy.role());
            return Ok(Persisted::Pending(lazy));
        }
        self.write(&lazy, progress, cancel).map(Persisted::Materialized)
    }

    /// Compute every chunk of `lazy` and store it, replacing any previous version
    pub fn write(
        &self,
        lazy: &LazyMatrix,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> GeocodeResult<MatrixArtifact> {
        let staged = self.stage(lazy, progress, cancel)?;
        self.commit(staged)
    }

    /// Compute every chunk of `lazy` into a staging directory next to its target
    ///
    /// Nothing at the target changes until the result is passed to
    /// [`ArtifactStore::commit`]. Dropping it discards the staged chunks.
    pub fn stage(
        &self,
        lazy: &LazyMatrix,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> GeocodeResult<StagedMatrix> {
        let role = lazy.role();
        let path = self.path_for(role);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;

        log::info!("Writing {} to {}", role, path.display());

        // Removed on drop unless renamed into place
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}.", role.key()))
            .tempdir_in(&parent)?;
        let chunks_dir = staging.path().join(CHUNKS_DIR);
        fs::create_dir(&chunks_dir)?;

        let compression = self.compression;
        lazy.for_each_chunk(progress, cancel, |region, block| {
            let file = chunks_dir.join(chunk_name(region.block_row, region.block_col));
            write_chunk(&file, &block, compression)
        })?;

        let layout = lazy.layout();
        let manifest = ArtifactManifest {
            format_version: FORMAT_VERSION,
            role,
            shape: layout.shape,
            chunk: layout.chunk,
            axes: lazy.axes().clone(),
            compression,
            sentinel: NO_INDEX,
            created: Utc::now(),
        };
        let mut writer = BufWriter::new(File::create(staging.path().join(MANIFEST_FILE))?);
        serde_json::to_writer_pretty(&mut writer, &manifest)?;
        writer.flush()?;

        Ok(StagedMatrix {
            staging,
            parent,
            layout,
            artifact: MatrixArtifact { path, manifest },
        })
    }

    /// Move a staged matrix into place, replacing any previous version
    pub fn commit(&self, staged: StagedMatrix) -> GeocodeResult<MatrixArtifact> {
        let StagedMatrix {
            staging,
            parent,
            layout,
            artifact,
        } = staged;
        let role = artifact.manifest.role;
        replace_dir(staging.path(), &artifact.path, &parent, role)?;

        log::info!(
            "Saved {}: {}x{} cells in {} chunks",
            role,
            layout.shape.0,
            layout.shape.1,
            layout.num_chunks()
        );
        Ok(artifact)
    }

    pub fn manifest(&self, role: MatrixRole) -> GeocodeResult<ArtifactManifest> {
        let path = self.path_for(role).join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(GeocodeError::InvalidArtifact(format!(
                "No {} artifact at {}",
                role,
                path.display()
            )));
        }
        let manifest: ArtifactManifest = serde_json::from_reader(BufReader::new(File::open(&path)?))?;
        if manifest.role != role {
            return Err(GeocodeError::InvalidArtifact(format!(
                "{} holds a {} matrix",
                path.display(),
                manifest.role
            )));
        }
        if manifest.sentinel != NO_INDEX || manifest.format_version != FORMAT_VERSION {
            return Err(GeocodeError::InvalidArtifact(format!(
                "{} uses an unsupported format (version {}, sentinel {})",
                path.display(),
                manifest.format_version,
                manifest.sentinel
            )));
        }
        Ok(manifest)
    }

    /// Read a stored matrix back into memory
    pub fn load(&self, role: MatrixRole) -> GeocodeResult<IndexMatrix> {
        let manifest = self.manifest(role)?;
        if manifest.axes.shape() != manifest.shape {
            return Err(GeocodeError::InvalidArtifact(format!(
                "{} axes {:?} disagree with shape {:?}",
                role,
                manifest.axes.shape(),
                manifest.shape
            )));
        }

        let layout = ChunkLayout::new(manifest.shape, manifest.chunk)?;
        let chunks_dir = self.path_for(role).join(CHUNKS_DIR);
        let mut cells = Array2::from_elem(layout.shape, None);

        for region in layout.regions() {
            let file = chunks_dir.join(chunk_name(region.block_row, region.block_col));
            let block = read_chunk(&file, region.shape(), manifest.compression)?;
            cells
                .slice_mut(s![region.rows.clone(), region.cols.clone()])
                .assign(&block);
        }

        log::debug!("Loaded {} ({} chunks)", role, layout.num_chunks());
        Ok(IndexMatrix {
            role,
            axes: manifest.axes,
            layout,
            cells,
        })
    }
}

fn chunk_name(block_row: usize, block_col: usize) -> String {
    format!("{}.{}", block_row, block_col)
}

fn write_chunk(path: &Path, block: &Array2<Option<u32>>, compression: Compression) -> GeocodeResult<()> {
    let mut bytes = Vec::with_capacity(block.len() * 4);
    for cell in block.iter() {
        bytes.extend_from_slice(&cell.unwrap_or(NO_INDEX).to_le_bytes());
    }

    let file = BufWriter::new(File::create(path)?);
    match compression {
        Compression::None => {
            let mut file = file;
            file.write_all(&bytes)?;
            file.flush()?;
        }
        Compression::Deflate { level } => {
            let mut encoder = ZlibEncoder::new(file, flate2::Compression::new(level.min(9)));
            encoder.write_all(&bytes)?;
            encoder.finish()?.flush()?;
        }
    }
    Ok(())
}

fn read_chunk(
    path: &Path,
    shape: (usize, usize),
    compression: Compression,
) -> GeocodeResult<Array2<Option<u32>>> {
    let file = BufReader::new(File::open(path)?);
    let mut bytes = Vec::new();
    match compression {
        Compression::None => {
            let mut file = file;
            file.read_to_end(&mut bytes)?;
        }
        Compression::Deflate { .. } => {
            ZlibDecoder::new(file).read_to_end(&mut bytes)?;
        }
    }

    let expected = shape.0 * shape.1 * 4;
    if bytes.len() != expected {
        return Err(GeocodeError::InvalidArtifact(format!(
            "Chunk {} holds {} bytes, expected {}",
            path.display(),
            bytes.len(),
            expected
        )));
    }

    let values: Vec<Option<u32>> = bytes
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .map(|v| (v != NO_INDEX).then_some(v))
        .collect();
    Array2::from_shape_vec(shape, values)
        .map_err(|e| GeocodeError::InvalidArtifact(format!("Failed to reshape chunk: {}", e)))
}

/// Move `staging` to `target`; an existing `target` is set aside first and
/// only deleted once the new version is in place
fn replace_dir(staging: &Path, target: &Path, parent: &Path, role: MatrixRole) -> GeocodeResult<()> {
    if !target.exists() {
        fs::rename(staging, target)?;
        return Ok(());
    }

    let previous = parent.join(format!(".{}.previous", role.key()));
    if previous.exists() {
        fs::remove_dir_all(&previous)?;
    }
    log::debug!("Replacing previous {} at {}", role, target.display());
    fs::rename(target, &previous)?;

    if let Err(e) = fs::rename(staging, target) {
        log::warn!("Failed to move new {} into place, restoring previous: {}", role, e);
        fs::rename(&previous, target)?;
        return Err(e.into());
    }
    fs::remove_dir_all(&previous)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lazy::{ChunkKernel, NoProgress};
    use crate::types::ChunkRegion;
    use std::sync::Arc;

    /// Every third cell unmatched, the rest numbered by flat position + offset
    struct PatternKernel {
        width: usize,
        offset: u32,
    }

    impl ChunkKernel for PatternKernel {
        fn compute_chunk(&self, region: &ChunkRegion) -> GeocodeResult<Array2<Option<u32>>> {
            let (r0, c0) = (region.rows.start, region.cols.start);
            Ok(Array2::from_shape_fn(region.shape(), |(i, j)| {
                let flat = (r0 + i) * self.width + c0 + j;
                (flat % 3 != 0).then_some(flat as u32 + self.offset)
            }))
        }
    }

    fn pattern(offset: u32) -> LazyMatrix {
        let layout = ChunkLayout::new((5, 7), (2, 3)).unwrap();
        let axes = GridAxes::Geographic {
            lat: (0..5).map(|i| i as f64).collect(),
            lon: (0..7).map(|j| j as f64).collect(),
        };
        LazyMatrix::new(MatrixRole::Ra2Ll, axes, layout, Arc::new(PatternKernel { width: 7, offset }))
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_then_load() {
        for compression in [Compression::None, Compression::Deflate { level: 6 }] {
            let dir = tempfile::tempdir().unwrap();
            let store = ArtifactStore::new(dir.path()).with_compression(compression);
            let lazy = pattern(0);

            let artifact = store.write(&lazy, &NoProgress, &CancellationToken::new()).unwrap();
            assert_eq!(artifact.manifest.compression, compression);
            assert!(store.exists(MatrixRole::Ra2Ll));
            assert!(!store.exists(MatrixRole::Ll2Ra));

            let expected = lazy.compute(&NoProgress, &CancellationToken::new()).unwrap();
            let loaded = store.load(MatrixRole::Ra2Ll).unwrap();
            assert_eq!(loaded, expected);
        }
    }

    #[test]
    fn test_rewrite_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let cancel = CancellationToken::new();

        store.write(&pattern(100), &NoProgress, &cancel).unwrap();
        store.write(&pattern(0), &NoProgress, &cancel).unwrap();
        let first = store.load(MatrixRole::Ra2Ll).unwrap();
        store.write(&pattern(0), &NoProgress, &cancel).unwrap();
        let second = store.load(MatrixRole::Ra2Ll).unwrap();

        assert_eq!(first, second);
        assert_eq!(second.get(0, 1), Some(1));
        assert_eq!(entries(dir.path()), vec!["intf_ra2ll".to_string()]);

        let chunks = entries(&store.path_for(MatrixRole::Ra2Ll).join(CHUNKS_DIR));
        assert_eq!(chunks.len(), 9);
    }

    #[test]
    fn test_manifest_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let artifact = store.write(&pattern(0), &NoProgress, &CancellationToken::new()).unwrap();

        let manifest = store.manifest(MatrixRole::Ra2Ll).unwrap();
        assert_eq!(manifest, artifact.manifest);
        assert_eq!(manifest.shape, (5, 7));
        assert_eq!(manifest.chunk, (2, 3));
        assert_eq!(manifest.sentinel, NO_INDEX);
    }

    #[test]
    fn test_staged_matrix_not_in_place_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let cancel = CancellationToken::new();
        store.write(&pattern(0), &NoProgress, &cancel).unwrap();

        let staged = store.stage(&pattern(100), &NoProgress, &cancel).unwrap();
        assert_eq!(store.load(MatrixRole::Ra2Ll).unwrap().get(0, 1), Some(1));

        store.commit(staged).unwrap();
        assert_eq!(store.load(MatrixRole::Ra2Ll).unwrap().get(0, 1), Some(101));
        assert_eq!(entries(dir.path()), vec!["intf_ra2ll".to_string()]);

        // dropped without commit
        let staged = store.stage(&pattern(0), &NoProgress, &cancel).unwrap();
        drop(staged);
        assert_eq!(store.load(MatrixRole::Ra2Ll).unwrap().get(0, 1), Some(101));
        assert_eq!(entries(dir.path()), vec!["intf_ra2ll".to_string()]);
    }

    #[test]
    fn test_interactive_skips_storage() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let persisted = store
            .persist(pattern(0), true, &NoProgress, &CancellationToken::new())
            .unwrap();

        assert!(persisted.is_pending());
        assert!(persisted.artifact().is_none());
        assert!(!store.exists(MatrixRole::Ra2Ll));
        let lazy = persisted.into_pending().unwrap();
        assert_eq!(lazy.layout().shape, (5, 7));
    }

    #[test]
    fn test_cancelled_write_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.write(&pattern(0), &NoProgress, &CancellationToken::new()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = store.write(&pattern(100), &NoProgress, &cancel);
        assert!(matches!(result, Err(GeocodeError::Cancelled)));

        let loaded = store.load(MatrixRole::Ra2Ll).unwrap();
        assert_eq!(loaded.get(0, 1), Some(1));
        assert_eq!(entries(dir.path()), vec!["intf_ra2ll".to_string()]);
    }

    #[test]
    fn test_truncated_chunk_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).with_compression(Compression::None);
        store.write(&pattern(0), &NoProgress, &CancellationToken::new()).unwrap();

        let chunk = store.path_for(MatrixRole::Ra2Ll).join(CHUNKS_DIR).join("1.1");
        fs::write(&chunk, [0u8; 3]).unwrap();
        assert!(matches!(
            store.load(MatrixRole::Ra2Ll),
            Err(GeocodeError::InvalidArtifact(_))
        ));
    }

    #[test]
    fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(matches!(
            store.load(MatrixRole::Ll2Ra),
            Err(GeocodeError::InvalidArtifact(_))
        ));
        store.remove(MatrixRole::Ll2Ra).unwrap();
    }

    #[test]
    fn test_custom_naming() {
        struct Prefixed(PathBuf);
        impl ArtifactNaming for Prefixed {
            fn resolve(&self, key: &str) -> PathBuf {
                self.0.join("scene_a").join(format!("{}.grid", key))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::with_naming(Prefixed(dir.path().to_path_buf()));
        store.write(&pattern(0), &NoProgress, &CancellationToken::new()).unwrap();
        assert!(dir.path().join("scene_a/intf_ra2ll.grid/manifest.json").is_file());

        store.remove(MatrixRole::Ra2Ll).unwrap();
        assert!(!store.exists(MatrixRole::Ra2Ll));
    }
}
