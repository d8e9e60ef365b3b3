//! The model-parallel group interface and its trivial single-rank form.

use crate::error::Result;

/// Reduction applied by a collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across ranks
    Sum,
    /// Element-wise maximum across ranks (NaN propagates)
    Max,
}

impl ReduceOp {
    /// Combine two contributions.
    pub fn combine(self, acc: f64, value: f64) -> f64 {
        match self {
            ReduceOp::Sum => acc + value,
            ReduceOp::Max => {
                if acc.is_nan() || value.is_nan() {
                    f64::NAN
                } else {
                    acc.max(value)
                }
            }
        }
    }
}

/// The set of ranks that together hold one model replica (tensor + pipeline
/// parallel peers) and must agree on a single gradient norm.
///
/// Membership is owned by the caller. Every collective is blocking: all ranks
/// of the group must issue the same sequence of calls with buffers of the same
/// length, or the call deadlocks or fails with `DistributedError`.
pub trait ModelParallelGroup: Send + Sync {
    /// This rank's index within the model-parallel group.
    fn rank(&self) -> usize;

    /// Number of ranks in the model-parallel group.
    fn world_size(&self) -> usize;

    /// This rank's index along the tensor-parallel dimension.
    fn tensor_model_parallel_rank(&self) -> usize;

    /// In-place all-reduce of `values` across the group.
    fn all_reduce(&self, values: &mut [f64], op: ReduceOp) -> Result<()>;
}

/// All-reduce a single value and return the reduced result.
pub fn all_reduce_scalar<G>(group: &G, value: f64, op: ReduceOp) -> Result<f64>
where
    G: ModelParallelGroup + ?Sized,
{
    let mut buf = [value];
    group.all_reduce(&mut buf, op)?;
    Ok(buf[0])
}

/// A model-parallel group containing only the calling rank.
///
/// Reductions are the identity. The tensor-parallel rank is configurable so
/// that a single process can stand in for a non-zero TP rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleRankGroup {
    tp_rank: usize,
}

impl SingleRankGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend to sit at `tp_rank` along the tensor-parallel dimension.
    pub fn with_tensor_model_parallel_rank(tp_rank: usize) -> Self {
        Self { tp_rank }
    }
}

impl ModelParallelGroup for SingleRankGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn tensor_model_parallel_rank(&self) -> usize {
        self.tp_rank
    }

    fn all_reduce(&self, _values: &mut [f64], _op: ReduceOp) -> Result<()> {
        Ok(())
    }
}
