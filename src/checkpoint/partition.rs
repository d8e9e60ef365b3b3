//! Model-parallel partitions of a checkpoint iteration
//!
//! Each partition is a directory named `mp_rank_TT` (tensor parallel only) or
//! `mp_rank_TT_PPP` (tensor and pipeline parallel). The tensor rank is zero
//! padded to at least two digits, so rank 100 and above is `mp_rank_100`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

const PARTITION_PREFIX: &str = "mp_rank_";

static PARTITION_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^mp_rank_(\d{2,})(?:_(\d{3}))?$").expect("valid partition regex")
});

/// Layer stride between pipeline stages in global layer numbers
pub const PIPELINE_LAYER_STRIDE: usize = 1000;

/// One tensor/pipeline partition directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub path: PathBuf,
    pub tp_rank: usize,
    pub pp_rank: Option<usize>,
}

impl Partition {
    /// Parse a partition from its directory path. Returns `None` for
    /// directories that don't follow the `mp_rank_*` naming, including
    /// non-canonical padding such as `mp_rank_003`.
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let name = path.file_name()?.to_str()?;
        let caps = PARTITION_NAME.captures(name)?;

        let tp_rank = caps[1].parse().ok()?;
        let pp_rank = match caps.get(2) {
            Some(pp) => Some(pp.as_str().parse().ok()?),
            None => None,
        };
        let partition = Self {
            path: path.clone(),
            tp_rank,
            pp_rank,
        };
        // output directories are named from the parsed ranks
        (partition.dir_name() == name).then_some(partition)
    }

    /// Directory name, e.g. `mp_rank_01_002`.
    pub fn dir_name(&self) -> String {
        match self.pp_rank {
            Some(pp) => format!("mp_rank_{:02}_{:03}", self.tp_rank, pp),
            None => format!("mp_rank_{:02}", self.tp_rank),
        }
    }

    /// Map a partition-local layer index to a layer number that is unique
    /// across pipeline stages.
    ///
    /// Layer indices restart at 0 on every pipeline stage, so stage `p`
    /// is offset by `1000 * p`. Partitions that differ only in tensor rank map
    /// to the same global layer.
    pub fn global_layer(&self, local: usize) -> usize {
        match self.pp_rank {
            Some(pp) => PIPELINE_LAYER_STRIDE * pp + local,
            None => local,
        }
    }
}

/// List the partitions of an iteration directory, sorted by (pp, tp) rank.
///
/// Entries not starting with `mp_rank_` are ignored. An `mp_rank_*` entry that
/// is not a directory or whose name doesn't parse is an error, so no partition
/// is silently left out of the conversion.
pub fn discover_partitions(iter_dir: &Path) -> Result<Vec<Partition>> {
    let entries = std::fs::read_dir(iter_dir).map_err(|e| Error::io(iter_dir, e))?;

    let mut partitions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(iter_dir, e))?;
        let path = entry.path();
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(PARTITION_PREFIX) {
            continue;
        }
        if !path.is_dir() {
            return Err(Error::CheckpointError {
                reason: format!("partition {} is not a directory", path.display()),
            });
        }
        let partition = Partition::from_path(&path).ok_or_else(|| Error::CheckpointError {
            reason: format!(
                "unrecognized partition name {:?}, expected mp_rank_TT or mp_rank_TT_PPP",
                name.to_string_lossy()
            ),
        })?;
        partitions.push(partition);
    }
    partitions.sort_by_key(|p| (p.pp_rank.unwrap_or(0), p.tp_rank));
    Ok(partitions)
}

/// Tensor- and pipeline-parallel sizes implied by a set of partitions.
///
/// Ranks must be contiguous from 0 along both axes and every (tp, pp) pair
/// must be present exactly once.
pub fn parallel_sizes(partitions: &[Partition]) -> Result<(usize, usize)> {
    if partitions.is_empty() {
        return Err(Error::CheckpointError {
            reason: "no mp_rank_* partitions found".to_string(),
        });
    }

    let pipelined = partitions.iter().filter(|p| p.pp_rank.is_some()).count();
    if pipelined != 0 && pipelined != partitions.len() {
        return Err(Error::CheckpointError {
            reason: "partitions mix mp_rank_TT and mp_rank_TT_PPP naming".to_string(),
        });
    }

    let tp_ranks: BTreeSet<usize> = partitions.iter().map(|p| p.tp_rank).collect();
    let pp_ranks: BTreeSet<usize> = partitions
        .iter()
        .map(|p| p.pp_rank.unwrap_or(0))
        .collect();
    let (tp, pp) = (tp_ranks.len(), pp_ranks.len());

    if tp * pp != partitions.len() {
        return Err(Error::CheckpointError {
            reason: format!(
                "{} partitions don't form a {tp}x{pp} tensor/pipeline grid",
                partitions.len()
            ),
        });
    }
    check_contiguous("tensor", &tp_ranks)?;
    check_contiguous("pipeline", &pp_ranks)?;

    Ok((tp, pp))
}

fn check_contiguous(axis: &str, ranks: &BTreeSet<usize>) -> Result<()> {
    let first = ranks.first().copied().unwrap_or(0);
    let last = ranks.last().copied().unwrap_or(0);
    if first != 0 || last != ranks.len() - 1 {
        return Err(Error::CheckpointError {
            reason: format!("{axis} parallel ranks {ranks:?} are not contiguous from 0"),
        });
    }
    Ok(())
}
