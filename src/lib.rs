//! # mptools
//!
//! **Model-parallel training utilities built on candle.**
//!
//! mptools collects the pieces of a tensor/pipeline-parallel training stack that
//! sit next to the model itself: gradient clipping across a model-parallel
//! group, offline conversion of dense checkpoints into mixture-of-experts
//! checkpoints, and the directory conventions of a retrieval index workdir.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ optimizer   clip_grad_norm, l2_grad_clipper, GradClipper │
//! ├──────────────────────────────────────────────────────────┤
//! │ distributed ModelParallelGroup (all_reduce over f64)      │
//! ├──────────────────────────────────────────────────────────┤
//! │ checkpoint  partitions, expert layouts, Upcycler          │
//! │ retro       index workdir paths                           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Injected collective**: clipping talks to the group only through
//!   [`ModelParallelGroup`], one collective per call
//! - **Two clip paths**: a per-tensor reference path for any norm, and a batched
//!   multi-tensor path for L2 with identical results
//! - **Safetensors checkpoints**: one flat state dict per partition

pub mod checkpoint;
pub mod distributed;
pub mod error;
pub mod optimizer;
pub mod retro;

pub use checkpoint::{ExpertLayout, Partition, UpcycleConfig, UpcycleReport, Upcycler};
pub use distributed::{LocalGroup, ModelParallelGroup, ReduceOp, SingleRankGroup};
pub use error::{Error, Result};
pub use optimizer::{
    ClipOutcome, ClipStrategy, GradClipConfig, GradClipper, NormType, Parameter, clip_grad_norm,
    l2_grad_clipper,
};
pub use retro::{IndexWorkdir, RetroIndexConfig};

// Re-export candle types that users will commonly need
pub use candle_core::{DType, Device, Tensor};
