//! Gradient clipping for model-parallel training
//!
//! Clip gradients by a global norm that every rank of the model-parallel
//! group agrees on. Each rank contributes the gradients it is responsible
//! for, one collective combines the partial norms, and every contributing
//! gradient is scaled by the same coefficient.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::distributed::{ModelParallelGroup, ReduceOp, all_reduce_scalar};
use crate::error::{Error, Result};

/// Added to the total norm before dividing, so a zero norm never divides by zero.
pub const CLIP_EPS: f64 = 1e-6;

/// A model parameter as seen by the clipper: a gradient slot plus the two
/// flags that decide whether this rank counts it toward the global norm.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    /// Gradient produced by the autodiff engine, `None` if it was never computed.
    pub grad: Option<Tensor>,
    /// Replicated identically on every rank (e.g. tied embeddings).
    pub shared: bool,
    /// Sharded across the tensor-parallel dimension.
    pub tensor_model_parallel: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            grad: None,
            shared: false,
            tensor_model_parallel: false,
        }
    }

    pub fn with_grad(mut self, grad: Tensor) -> Self {
        self.grad = Some(grad);
        self
    }

    /// Mark as replicated across ranks.
    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    /// Mark as sharded across the tensor-parallel dimension.
    pub fn tensor_parallel(mut self) -> Self {
        self.tensor_model_parallel = true;
        self
    }

    /// Whether this rank counts the parameter toward the global norm.
    ///
    /// Replicated (non-sharded) parameters are counted once, by tensor-parallel rank 0.
    pub fn contributes_to_norm(&self, tp_rank: usize) -> bool {
        self.grad.is_some() && !self.shared && (self.tensor_model_parallel || tp_rank == 0)
    }
}

/// Which norm to clip by.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NormType {
    /// Maximum absolute gradient value
    Infinity,
    /// p-norm with finite `p > 0`
    P(f64),
}

impl Default for NormType {
    fn default() -> Self {
        NormType::P(2.0)
    }
}

impl NormType {
    pub fn validate(&self) -> Result<()> {
        match *self {
            NormType::Infinity => Ok(()),
            NormType::P(p) if p.is_finite() && p > 0.0 => Ok(()),
            NormType::P(p) => Err(Error::InvalidArgument {
                arg: "norm_type",
                reason: format!("p-norm order must be finite and positive, got {p}"),
            }),
        }
    }

    pub fn is_l2(&self) -> bool {
        matches!(*self, NormType::P(p) if p == 2.0)
    }
}

impl FromStr for NormType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("inf") || s.eq_ignore_ascii_case("infinity") {
            return Ok(NormType::Infinity);
        }
        let p: f64 = s.parse().map_err(|_| Error::InvalidArgument {
            arg: "norm_type",
            reason: format!("expected 'inf' or a positive number, got '{s}'"),
        })?;
        let norm = if p == f64::INFINITY {
            NormType::Infinity
        } else {
            NormType::P(p)
        };
        norm.validate()?;
        Ok(norm)
    }
}

impl fmt::Display for NormType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormType::Infinity => write!(f, "inf"),
            NormType::P(p) => write!(f, "{p}"),
        }
    }
}

pub(crate) fn validate_max_norm(max_norm: f64) -> Result<()> {
    if !max_norm.is_finite() || max_norm <= 0.0 {
        return Err(Error::InvalidArgument {
            arg: "max_norm",
            reason: format!("max_norm must be positive and finite, got {max_norm}"),
        });
    }
    Ok(())
}

/// Indices of the parameters this rank counts toward the norm, in input order.
pub(crate) fn norm_contributors(parameters: &[Parameter], tp_rank: usize) -> Vec<usize> {
    parameters
        .iter()
        .enumerate()
        .filter(|(_, p)| p.contributes_to_norm(tp_rank))
        .map(|(i, _)| i)
        .collect()
}

/// `max_norm / (total_norm + CLIP_EPS)`. Gradients are scaled only when this is below 1.
pub fn clip_coefficient(max_norm: f64, total_norm: f64) -> f64 {
    max_norm / (total_norm + CLIP_EPS)
}

pub(crate) fn scalar_to_f64(t: &Tensor) -> Result<f64> {
    match t.dtype() {
        DType::F64 => Ok(t.to_scalar::<f64>()?),
        DType::F32 => Ok(t.to_scalar::<f32>()? as f64),
        _ => Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?),
    }
}

/// max |g| in f64, 0 for an empty tensor
fn abs_max(grad: &Tensor) -> Result<f64> {
    if grad.elem_count() == 0 {
        return Ok(0.0);
    }
    scalar_to_f64(&grad.to_dtype(DType::F64)?.abs()?.max_all()?)
}

/// ‖g‖_p in f64, 0 for an empty tensor.
///
/// Entries are divided by max |g| before raising to `p`, so the sum stays
/// finite whenever the norm itself is.
fn tensor_norm(grad: &Tensor, p: f64) -> Result<f64> {
    if grad.elem_count() == 0 {
        return Ok(0.0);
    }
    let g = grad.to_dtype(DType::F64)?.abs()?;
    let max = scalar_to_f64(&g.max_all()?)?;
    if max == 0.0 || !max.is_finite() {
        return Ok(max);
    }

    let scaled = g.affine(1.0 / max, 0.0)?;
    let powered = if p == 2.0 {
        scaled.sqr()?
    } else if p == 1.0 {
        scaled
    } else {
        scaled.powf(p)?
    };
    Ok(max * scalar_to_f64(&powered.sum_all()?)?.powf(1.0 / p))
}

/// Global gradient norm over the model-parallel group, without clipping.
///
/// Issues exactly one collective, even when this rank contributes nothing,
/// so every rank of the group must call it.
pub fn total_grad_norm<G>(group: &G, parameters: &[Parameter], norm_type: NormType) -> Result<f64>
where
    G: ModelParallelGroup + ?Sized,
{
    norm_type.validate()?;
    let kept = norm_contributors(parameters, group.tensor_model_parallel_rank());
    let grads = kept.iter().filter_map(|&i| parameters[i].grad.as_ref());

    match norm_type {
        NormType::Infinity => {
            let mut local = 0.0f64;
            for grad in grads {
                local = ReduceOp::Max.combine(local, abs_max(grad)?);
            }
            all_reduce_scalar(group, local, ReduceOp::Max)
        }
        NormType::P(p) => {
            let mut local = 0.0f64;
            for grad in grads {
                local += tensor_norm(grad, p)?.powf(p);
            }
            // sum of p-th powers; the root is taken after the reduction
            let total = all_reduce_scalar(group, local, ReduceOp::Sum)?;
            Ok(total.powf(1.0 / p))
        }
    }
}

/// Scale the gradients at `indices` by `coef`, replacing each gradient slot.
pub(crate) fn scale_grads(parameters: &mut [Parameter], indices: &[usize], coef: f64) -> Result<()> {
    for &i in indices {
        if let Some(grad) = parameters[i].grad.as_mut() {
            *grad = grad.affine(coef, 0.0)?;
        }
    }
    Ok(())
}

/// Clip gradients by global norm across the model-parallel group.
///
/// Parameters without a gradient, `shared` parameters, and replicated
/// parameters on tensor-parallel ranks other than 0 are left out of the norm
/// and are never scaled. If the global norm exceeds `max_norm`, every
/// remaining gradient is multiplied by `max_norm / (total_norm + 1e-6)`.
///
/// The gradient slots in `parameters` are updated with the scaled tensors.
/// Arguments are validated before any communication, so a rejected call never
/// desynchronizes the group.
///
/// Returns the global norm before clipping.
pub fn clip_grad_norm<G>(
    group: &G,
    parameters: &mut [Parameter],
    max_norm: f64,
    norm_type: NormType,
) -> Result<f64>
where
    G: ModelParallelGroup + ?Sized,
{
    validate_max_norm(max_norm)?;
    norm_type.validate()?;

    let total_norm = total_grad_norm(group, parameters, norm_type)?;
    let clip_coef = clip_coefficient(max_norm, total_norm);

    if clip_coef < 1.0 {
        let kept = norm_contributors(parameters, group.tensor_model_parallel_rank());
        scale_grads(parameters, &kept, clip_coef)?;
    }

    debug!(
        rank = group.rank(),
        %norm_type,
        total_norm,
        clip_coef,
        clipped = clip_coef < 1.0,
        "clip_grad_norm"
    );

    Ok(total_norm)
}
