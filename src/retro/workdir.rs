//! Index config and directory layout

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

fn default_index_type() -> String {
    "faiss-par-add".to_string()
}

fn default_nclusters() -> usize {
    4096
}

fn default_hnsw_m() -> usize {
    32
}

fn default_ivf_dim() -> usize {
    256
}

fn default_pq_m() -> usize {
    32
}

/// Retrieval index configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetroIndexConfig {
    /// Root of the retrieval workdir
    pub workdir: PathBuf,
    /// Index implementation, e.g. `faiss-base` or `faiss-par-add`
    #[serde(default = "default_index_type")]
    pub index_type: String,
    /// IVF centroid count
    #[serde(default = "default_nclusters")]
    pub nclusters: usize,
    /// HNSW neighbours per node in the coarse quantizer
    #[serde(default = "default_hnsw_m")]
    pub hnsw_m: usize,
    /// Dimension after the OPQ rotation
    #[serde(default = "default_ivf_dim")]
    pub ivf_dim: usize,
    /// Product quantizer sub-vector count
    #[serde(default = "default_pq_m")]
    pub pq_m: usize,
}

impl RetroIndexConfig {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            index_type: default_index_type(),
            nclusters: default_nclusters(),
            hnsw_m: default_hnsw_m(),
            ivf_dim: default_ivf_dim(),
            pq_m: default_pq_m(),
        }
    }

    pub fn with_index_type(mut self, index_type: impl Into<String>) -> Self {
        self.index_type = index_type.into();
        self
    }

    pub fn with_nclusters(mut self, nclusters: usize) -> Self {
        self.nclusters = nclusters;
        self
    }

    pub fn with_hnsw_m(mut self, hnsw_m: usize) -> Self {
        self.hnsw_m = hnsw_m;
        self
    }

    pub fn with_ivf_dim(mut self, ivf_dim: usize) -> Self {
        self.ivf_dim = ivf_dim;
        self
    }

    pub fn with_pq_m(mut self, pq_m: usize) -> Self {
        self.pq_m = pq_m;
        self
    }

    /// Read a config from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: Self = serde_json::from_str(&json).map_err(|e| Error::InvalidArgument {
            arg: "config",
            reason: format!("failed to parse {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.index_type.is_empty() || self.index_type.contains(std::path::MAIN_SEPARATOR) {
            return Err(Error::InvalidArgument {
                arg: "index_type",
                reason: format!("'{}' is not a valid directory name", self.index_type),
            });
        }
        for (arg, value) in [
            ("nclusters", self.nclusters),
            ("hnsw_m", self.hnsw_m),
            ("ivf_dim", self.ivf_dim),
            ("pq_m", self.pq_m),
        ] {
            if value == 0 {
                return Err(Error::InvalidArgument {
                    arg,
                    reason: "must be positive".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Faiss factory string: `OPQ<m>_<d>,IVF<k>_HNSW<h>,PQ<m>`.
    pub fn index_str(&self) -> String {
        format!(
            "OPQ{}_{},IVF{}_HNSW{},PQ{}",
            self.pq_m, self.ivf_dim, self.nclusters, self.hnsw_m, self.pq_m
        )
    }
}

/// Paths of one index inside a retrieval workdir.
#[derive(Debug, Clone)]
pub struct IndexWorkdir {
    config: RetroIndexConfig,
}

impl IndexWorkdir {
    pub fn new(config: RetroIndexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RetroIndexConfig {
        &self.config
    }

    /// `<workdir>/index/<index_type>/<index_str>`
    pub fn index_dir(&self) -> PathBuf {
        self.config
            .workdir
            .join("index")
            .join(&self.config.index_type)
            .join(self.config.index_str())
    }

    /// [`index_dir`](Self::index_dir), created if missing.
    pub fn ensure_index_dir(&self) -> Result<PathBuf> {
        let dir = self.index_dir();
        if !dir.is_dir() {
            std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
            info!(dir = %dir.display(), "created index dir");
        }
        Ok(dir)
    }

    pub fn training_data_dir(&self) -> PathBuf {
        self.index_dir().join("training_data_tmp")
    }

    pub fn training_data_block_dir(&self) -> PathBuf {
        self.training_data_dir().join("blocks")
    }

    /// Sorted `*.hdf5` block files. Empty if the block dir doesn't exist yet.
    pub fn training_data_block_paths(&self) -> Result<Vec<PathBuf>> {
        let dir = self.training_data_block_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&dir, e)),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::io(&dir, e))?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "hdf5") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub fn training_data_merged_path(&self) -> PathBuf {
        self.training_data_dir().join("merged.hdf5")
    }

    /// Delete the staged training data.
    ///
    /// Only rank 0 touches the filesystem; returns whether anything was removed.
    pub fn remove_training_data(&self, rank: usize) -> Result<bool> {
        if rank != 0 {
            return Ok(false);
        }
        let dir = self.training_data_dir();
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(dir = %dir.display(), "removed training data");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(&dir, e)),
        }
    }
}
