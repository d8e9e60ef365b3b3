//! In-process model-parallel group
//!
//! Every member lives on its own thread and owns one crossbeam channel per
//! peer and direction. A collective sends the local buffer to every peer,
//! then folds all contributions in rank order, so every member ends up with a
//! bit-identical result.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::{Receiver, Sender, unbounded};

use super::group::{ModelParallelGroup, ReduceOp};
use crate::error::{Error, Result};

/// One rank's buffer for one collective call.
#[derive(Debug)]
struct Contribution {
    seq: u64,
    op: ReduceOp,
    values: Vec<f64>,
}

/// A member of an in-process model-parallel group.
///
/// Created in bulk with [`LocalGroup::new_group`]; move each member onto its
/// own thread. There is no timeout: a peer that is alive but never joins the
/// collective blocks the others. A peer that has been dropped makes the
/// collective fail with `DistributedError`.
pub struct LocalGroup {
    rank: usize,
    tp_rank: usize,
    seq: AtomicU64,
    /// `outboxes[dst]`, `None` at our own rank
    outboxes: Vec<Option<Sender<Contribution>>>,
    /// `inboxes[src]`, `None` at our own rank
    inboxes: Vec<Option<Receiver<Contribution>>>,
}

impl LocalGroup {
    /// Build a group with one member per entry of `tp_ranks`.
    ///
    /// `tp_ranks[i]` is the tensor-parallel rank reported by member `i`.
    pub fn new_group(tp_ranks: &[usize]) -> Vec<LocalGroup> {
        let world_size = tp_ranks.len();

        let mut outboxes: Vec<Vec<Option<Sender<Contribution>>>> = (0..world_size)
            .map(|_| (0..world_size).map(|_| None).collect())
            .collect();
        let mut inboxes: Vec<Vec<Option<Receiver<Contribution>>>> = (0..world_size)
            .map(|_| (0..world_size).map(|_| None).collect())
            .collect();

        for src in 0..world_size {
            for dst in 0..world_size {
                if src != dst {
                    let (tx, rx) = unbounded();
                    outboxes[src][dst] = Some(tx);
                    inboxes[dst][src] = Some(rx);
                }
            }
        }

        outboxes
            .into_iter()
            .zip(inboxes)
            .zip(tp_ranks.iter().copied())
            .enumerate()
            .map(|(rank, ((outboxes, inboxes), tp_rank))| LocalGroup {
                rank,
                tp_rank,
                seq: AtomicU64::new(0),
                outboxes,
                inboxes,
            })
            .collect()
    }

    /// Build a purely tensor-parallel group: member `i` has TP rank `i`.
    pub fn tensor_parallel(world_size: usize) -> Vec<LocalGroup> {
        let tp_ranks: Vec<usize> = (0..world_size).collect();
        Self::new_group(&tp_ranks)
    }

    fn receive(&self, src: usize, seq: u64, op: ReduceOp, len: usize) -> Result<Vec<f64>> {
        let rx = self.inboxes[src]
            .as_ref()
            .ok_or_else(|| Error::DistributedError {
                reason: format!("rank {} has no channel from rank {src}", self.rank),
            })?;

        let msg = rx.recv().map_err(|_| Error::DistributedError {
            reason: format!(
                "rank {src} left the group before all_reduce #{seq} (seen from rank {})",
                self.rank
            ),
        })?;

        if msg.seq != seq || msg.op != op || msg.values.len() != len {
            return Err(Error::DistributedError {
                reason: format!(
                    "collective mismatch on rank {}: expected #{seq} {op:?} x{len}, rank {src} sent #{} {:?} x{}",
                    self.rank,
                    msg.seq,
                    msg.op,
                    msg.values.len()
                ),
            });
        }

        Ok(msg.values)
    }
}

impl ModelParallelGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.outboxes.len()
    }

    fn tensor_model_parallel_rank(&self) -> usize {
        self.tp_rank
    }

    fn all_reduce(&self, values: &mut [f64], op: ReduceOp) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        if self.world_size() <= 1 {
            return Ok(());
        }

        for (dst, tx) in self.outboxes.iter().enumerate() {
            let Some(tx) = tx else { continue };
            let msg = Contribution {
                seq,
                op,
                values: values.to_vec(),
            };
            tx.send(msg).map_err(|_| Error::DistributedError {
                reason: format!("rank {dst} hung up before all_reduce #{seq}"),
            })?;
        }

        let len = values.len();
        let mut reduced: Option<Vec<f64>> = None;
        for src in 0..self.world_size() {
            let contribution = if src == self.rank {
                values.to_vec()
            } else {
                self.receive(src, seq, op, len)?
            };
            reduced = Some(match reduced {
                None => contribution,
                Some(mut acc) => {
                    for (a, v) in acc.iter_mut().zip(contribution) {
                        *a = op.combine(*a, v);
                    }
                    acc
                }
            });
        }

        if let Some(reduced) = reduced {
            values.copy_from_slice(&reduced);
        }
        Ok(())
    }
}
