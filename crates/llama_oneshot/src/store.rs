//! Where model files come from: a plain path, or a named asset materialised into a cache
//! directory.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::ProjectDirs;
use thiserror::Error;
use tracing::{info, trace, warn};

/// An error raised while resolving a [`ModelSource`] to a file.
#[derive(Error, Debug)]
pub enum AssetError {
    /// The asset store has no asset by that name.
    #[error("Asset not found: {0}")]
    NotFound(String),

    /// The name would escape the store or the cache directory.
    #[error("Invalid asset name: {0:?}")]
    InvalidName(String),

    /// Reading the asset or writing the cached copy failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The file being read or written.
        path: PathBuf,

        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// No cache directory could be determined for this platform.
    #[error("No cache directory available")]
    NoCacheDirectory,
}

/// A read-only collection of named files, such as the assets bundled with an application.
pub trait AssetStore: Send + Sync {
    /// Opens the asset called `name` for reading.
    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>, AssetError>;
}

/// An [`AssetStore`] over the files of a single directory.
#[derive(Clone, Debug)]
pub struct DirectoryAssets {
    root: PathBuf,
}

impl DirectoryAssets {
    /// Serves the files directly under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetStore for DirectoryAssets {
    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>, AssetError> {
        validate_name(name)?;

        let path = self.root.join(name);
        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(AssetError::NotFound(name.to_owned()))
            }
            Err(source) => Err(AssetError::Io { path, source }),
        }
    }
}

/// Where to load a model from.
#[derive(Clone)]
pub enum ModelSource {
    /// A GGUF file on the filesystem.
    Path(PathBuf),

    /// A named asset, copied into a [`ModelCache`] before loading.
    Asset {
        /// The store holding the asset.
        store: Arc<dyn AssetStore>,

        /// The asset's name within `store`.
        name: String,

        /// Replace any existing cached copy.
        overwrite: bool,
    },
}

impl ModelSource {
    /// A model file on the filesystem.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// A named asset, reusing a cached copy if there is one.
    pub fn asset(store: Arc<dyn AssetStore>, name: impl Into<String>) -> Self {
        Self::Asset {
            store,
            name: name.into(),
            overwrite: false,
        }
    }

    /// Returns this source with `overwrite` set, if it is an asset.
    pub fn overwrite(self, overwrite: bool) -> Self {
        match self {
            Self::Asset { store, name, .. } => Self::Asset {
                store,
                name,
                overwrite,
            },
            path => path,
        }
    }

    /// Resolves this source to a file, materialising assets into `cache`.
    pub fn resolve(&self, cache: Option<&ModelCache>) -> Result<PathBuf, AssetError> {
        match self {
            Self::Path(path) => Ok(path.clone()),
            Self::Asset {
                store,
                name,
                overwrite,
            } => {
                let cache = cache.ok_or(AssetError::NoCacheDirectory)?;
                cache.materialize(store.as_ref(), name, *overwrite)
            }
        }
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Asset {
                name, overwrite, ..
            } => f
                .debug_struct("Asset")
                .field("name", name)
                .field("overwrite", overwrite)
                .finish_non_exhaustive(),
        }
    }
}

/// A directory holding materialised copies of model assets.
#[derive(Clone, Debug)]
pub struct ModelCache {
    dir: PathBuf,
}

impl ModelCache {
    /// Uses `dir` as the cache directory; it is created on first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The platform's cache directory for this crate, under `models/`.
    pub fn default_location() -> Result<Self, AssetError> {
        let dirs =
            ProjectDirs::from("", "", "llama_oneshot").ok_or(AssetError::NoCacheDirectory)?;

        Ok(Self::new(dirs.cache_dir().join("models")))
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copies asset `name` out of `store` into the cache, returning the cached path.
    ///
    /// An existing copy is reused unless `overwrite` is set. Data is written to a `.part` file
    /// first and renamed into place, so an interrupted copy is never mistaken for a model.
    pub fn materialize(
        &self,
        store: &dyn AssetStore,
        name: &str,
        overwrite: bool,
    ) -> Result<PathBuf, AssetError> {
        validate_name(name)?;

        let target = self.dir.join(name);

        if !overwrite && target.is_file() {
            trace!("Reusing cached asset {}", target.to_string_lossy());
            return Ok(target);
        }

        fs::create_dir_all(&self.dir).map_err(|source| AssetError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut reader = store.open(name)?;
        let partial = self.dir.join(format!("{name}.part"));

        let copied = File::create(&partial)
            .and_then(|mut file| {
                let n = io::copy(&mut reader, &mut file)?;
                file.sync_all()?;
                Ok(n)
            })
            .and_then(|n| fs::rename(&partial, &target).map(|_| n));

        match copied {
            Ok(n) => {
                info!("Materialised asset {name} ({n} bytes) at {}", target.to_string_lossy());
                Ok(target)
            }
            Err(source) => {
                if let Err(e) = fs::remove_file(&partial) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!("Could not remove {}: {e}", partial.to_string_lossy());
                    }
                }

                Err(AssetError::Io {
                    path: target,
                    source,
                })
            }
        }
    }
}

/// Rejects names that are empty, absolute, or could reach outside a single directory.
fn validate_name(name: &str) -> Result<(), AssetError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).is_absolute();

    if invalid {
        Err(AssetError::InvalidName(name.to_owned()))
    } else {
        Ok(())
    }
}
