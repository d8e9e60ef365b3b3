//! Retrieval index workdir conventions.
//!
//! A retrieval index lives under `<workdir>/index/<index_type>/<index_str>`,
//! where `index_str` is the Faiss factory string of the index. Training
//! vectors are staged in `training_data_tmp/` below it, first as per-block
//! HDF5 files and then merged into one file.

pub mod workdir;

pub use workdir::{IndexWorkdir, RetroIndexConfig};
