//! Checkpoint files on disk.
//!
//! ```text
//! <dir>/latest_checkpointed_iteration.txt
//! <dir>/iter_<N>/mp_rank_TT[_PPP]/model_optim_rng.safetensors
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

/// Name of the file that records the latest saved iteration.
pub const TRACKER_FILENAME: &str = "latest_checkpointed_iteration.txt";

/// State dict file inside every partition directory.
pub const STATE_DICT_FILENAME: &str = "model_optim_rng.safetensors";

/// Flat `name -> tensor` model state.
pub type StateDict = HashMap<String, Tensor>;

/// Read the tracker file of a checkpoint directory (trimmed).
pub fn read_tracker(dir: &Path) -> Result<String> {
    let path = dir.join(TRACKER_FILENAME);
    let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
    let iteration = text.trim();
    if iteration.is_empty() {
        return Err(Error::CheckpointError {
            reason: format!("{} is empty", path.display()),
        });
    }
    Ok(iteration.to_string())
}

/// Copy the tracker file into `output`, creating the directory.
pub fn copy_tracker(input: &Path, output: &Path) -> Result<()> {
    std::fs::create_dir_all(output).map_err(|e| Error::io(output, e))?;
    let src = input.join(TRACKER_FILENAME);
    let dst = output.join(TRACKER_FILENAME);
    std::fs::copy(&src, &dst).map_err(|e| Error::io(&src, e))?;
    Ok(())
}

/// Resolve the iteration directory named by `iteration`.
///
/// Tries `iter_<iteration>` verbatim first, then the zero-padded
/// `iter_{:07}` form for numeric iterations.
pub fn iteration_dir(dir: &Path, iteration: &str) -> Result<PathBuf> {
    let verbatim = dir.join(format!("iter_{iteration}"));
    if verbatim.is_dir() {
        return Ok(verbatim);
    }
    if let Ok(n) = iteration.parse::<u64>() {
        let padded = dir.join(format!("iter_{n:07}"));
        if padded.is_dir() {
            return Ok(padded);
        }
    }
    Err(Error::CheckpointError {
        reason: format!(
            "no iteration directory for '{iteration}' under {}",
            dir.display()
        ),
    })
}

/// Load the state dict of one partition.
pub fn load_state_dict(partition_dir: &Path, device: &Device) -> Result<StateDict> {
    let path = partition_dir.join(STATE_DICT_FILENAME);
    if !path.is_file() {
        return Err(Error::CheckpointError {
            reason: format!("missing state dict {}", path.display()),
        });
    }
    Ok(candle_core::safetensors::load(&path, device)?)
}

/// Save a state dict into `partition_dir`, creating it.
pub fn save_state_dict(partition_dir: &Path, state: &StateDict) -> Result<()> {
    std::fs::create_dir_all(partition_dir).map_err(|e| Error::io(partition_dir, e))?;
    candle_core::safetensors::save(state, partition_dir.join(STATE_DICT_FILENAME))?;
    Ok(())
}
