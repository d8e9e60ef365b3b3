//! Multi-tensor L2 clipping
//!
//! The reference path in [`grad_clip`](super::grad_clip) launches one norm
//! kernel and one scale kernel per parameter. For large models that is
//! hundreds of launches per step. The multi-tensor path batches the whole
//! gradient list into a single norm and a single scale.
//!
//! It only applies to the L2 norm, and only when every gradient lives on the
//! same device with the same dtype. Anything else falls back to the
//! reference path with identical results.

use candle_core::{DType, Tensor};
use tracing::debug;

use super::grad_clip::{
    NormType, Parameter, clip_coefficient, clip_grad_norm, norm_contributors, scalar_to_f64,
    validate_max_norm,
};
use crate::distributed::{ModelParallelGroup, ReduceOp, all_reduce_scalar};
use crate::error::{Error, Result};

/// Batched operations over a list of tensors.
///
/// Each method handles the whole list in one pass instead of one dispatch per tensor.
/// All tensors must share a device and a dtype.
pub trait MultiTensorOps {
    /// L2 norm of the concatenation of all tensors.
    fn multi_tensor_l2norm(&self, tensors: &[&Tensor]) -> Result<f64>;

    /// Multiply every tensor by `scale`.
    ///
    /// Returns the scaled tensors in input order, with their original shapes.
    fn multi_tensor_scale(&self, tensors: &[&Tensor], scale: f64) -> Result<Vec<Tensor>>;
}

/// [`MultiTensorOps`] on candle: flatten and concatenate into one buffer,
/// run a single kernel over it, then split it back.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandleMultiTensor;

impl CandleMultiTensor {
    fn flatten_cat(tensors: &[&Tensor]) -> Result<Tensor> {
        validate_uniform(tensors)?;
        let flat = tensors
            .iter()
            .map(|t| t.flatten_all())
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&flat, 0)?)
    }
}

impl MultiTensorOps for CandleMultiTensor {
    fn multi_tensor_l2norm(&self, tensors: &[&Tensor]) -> Result<f64> {
        let tensors: Vec<&Tensor> = tensors
            .iter()
            .copied()
            .filter(|t| t.elem_count() > 0)
            .collect();
        if tensors.is_empty() {
            return Ok(0.0);
        }

        // accumulate in f64 so f32 gradients above ~1e19 don't overflow
        let buffer = Self::flatten_cat(&tensors)?.to_dtype(DType::F64)?;
        let sum_sq = scalar_to_f64(&buffer.sqr()?.sum_all()?)?;
        Ok(sum_sq.sqrt())
    }

    fn multi_tensor_scale(&self, tensors: &[&Tensor], scale: f64) -> Result<Vec<Tensor>> {
        let total: usize = tensors.iter().map(|t| t.elem_count()).sum();
        if total == 0 {
            return Ok(tensors.iter().map(|t| (*t).clone()).collect());
        }

        let scaled = Self::flatten_cat(tensors)?.affine(scale, 0.0)?;

        let mut out = Vec::with_capacity(tensors.len());
        let mut offset = 0;
        for t in tensors {
            let n = t.elem_count();
            out.push(scaled.narrow(0, offset, n)?.reshape(t.shape())?);
            offset += n;
        }
        Ok(out)
    }
}

fn validate_uniform(tensors: &[&Tensor]) -> Result<()> {
    let Some(first) = tensors.first() else {
        return Ok(());
    };
    for t in &tensors[1..] {
        if t.dtype() != first.dtype() {
            return Err(Error::InvalidArgument {
                arg: "tensors",
                reason: format!(
                    "multi-tensor op needs one dtype, got {:?} and {:?}",
                    first.dtype(),
                    t.dtype()
                ),
            });
        }
        if !t.device().same_device(first.device()) {
            return Err(Error::InvalidArgument {
                arg: "tensors",
                reason: format!(
                    "multi-tensor op needs one device, got {:?} and {:?}",
                    first.device().location(),
                    t.device().location()
                ),
            });
        }
    }
    Ok(())
}

/// How a clip is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipStrategy {
    /// One norm and one scale per parameter, any norm type
    Reference,
    /// Batched L2 norm and scale over all contributing gradients
    MultiTensor,
}

impl ClipStrategy {
    /// Pick the multi-tensor path when it applies to this call.
    ///
    /// Requires the L2 norm and a single device/dtype across all gradients.
    pub fn detect(parameters: &[Parameter], norm_type: NormType) -> Self {
        if !norm_type.is_l2() {
            return ClipStrategy::Reference;
        }
        let mut grads = parameters.iter().filter_map(|p| p.grad.as_ref());
        let Some(first) = grads.next() else {
            return ClipStrategy::MultiTensor;
        };
        let uniform =
            grads.all(|g| g.dtype() == first.dtype() && g.device().same_device(first.device()));
        if uniform {
            ClipStrategy::MultiTensor
        } else {
            ClipStrategy::Reference
        }
    }
}

/// L2 gradient clipping through batched multi-tensor kernels.
///
/// Same contract as [`clip_grad_norm`] with `NormType::P(2.0)`: same filter,
/// same epsilon, one `Sum` reduction of the squared norm. Falls back to the
/// reference path when the gradients cannot be batched.
pub fn l2_grad_clipper<G>(group: &G, parameters: &mut [Parameter], max_norm: f64) -> Result<f64>
where
    G: ModelParallelGroup + ?Sized,
{
    l2_grad_clipper_with(&CandleMultiTensor, group, parameters, max_norm)
}

/// [`l2_grad_clipper`] with caller-provided batched kernels.
pub fn l2_grad_clipper_with<G, O>(
    ops: &O,
    group: &G,
    parameters: &mut [Parameter],
    max_norm: f64,
) -> Result<f64>
where
    G: ModelParallelGroup + ?Sized,
    O: MultiTensorOps + ?Sized,
{
    validate_max_norm(max_norm)?;

    if ClipStrategy::detect(parameters, NormType::P(2.0)) != ClipStrategy::MultiTensor {
        debug!("gradients span several devices or dtypes, using reference clipping");
        return clip_grad_norm(group, parameters, max_norm, NormType::P(2.0));
    }

    let kept = norm_contributors(parameters, group.tensor_model_parallel_rank());

    let local_norm = {
        let grads: Vec<&Tensor> = kept
            .iter()
            .filter_map(|&i| parameters[i].grad.as_ref())
            .collect();
        ops.multi_tensor_l2norm(&grads)?
    };

    let total_norm = all_reduce_scalar(group, local_norm * local_norm, ReduceOp::Sum)?.sqrt();
    let clip_coef = clip_coefficient(max_norm, total_norm);

    if clip_coef < 1.0 {
        let scaled = {
            let grads: Vec<&Tensor> = kept
                .iter()
                .filter_map(|&i| parameters[i].grad.as_ref())
                .collect();
            ops.multi_tensor_scale(&grads, clip_coef)?
        };
        let slots = kept
            .iter()
            .filter_map(|&i| parameters[i].grad.as_ref().map(|_| i))
            .collect::<Vec<_>>();
        for (i, grad) in slots.into_iter().zip(scaled) {
            parameters[i].grad = Some(grad);
        }
    }

    debug!(
        rank = group.rank(),
        total_norm,
        clip_coef,
        clipped = clip_coef < 1.0,
        "l2_grad_clipper"
    );

    Ok(total_norm)
}
