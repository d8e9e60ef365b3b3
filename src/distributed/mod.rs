//! Model-parallel group collaborator
//!
//! The gradient clipper never talks to a communication library directly. It
//! consumes a [`ModelParallelGroup`]: a blocking, rank-synchronous reduction
//! over the tensor + pipeline parallel peers of the calling rank.
//!
//! - [`SingleRankGroup`]: group of one, no communication.
//! - [`LocalGroup`]: in-process group, one member per thread, backed by
//!   crossbeam channels. Used to simulate multi-rank runs in tests and tools.
//!
//! Production deployments implement [`ModelParallelGroup`] on top of their
//! collective library (NCCL, MPI, ...).

pub mod group;
pub mod local;

pub use group::{ModelParallelGroup, ReduceOp, SingleRankGroup, all_reduce_scalar};
pub use local::LocalGroup;
