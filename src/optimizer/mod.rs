pub mod clipper;
pub mod grad_clip;
pub mod multi_tensor;

pub use clipper::{ClipOutcome, GradClipConfig, GradClipper};
pub use grad_clip::{
    CLIP_EPS, NormType, Parameter, clip_coefficient, clip_grad_norm, total_grad_norm,
};
pub use multi_tensor::{
    CandleMultiTensor, ClipStrategy, MultiTensorOps, l2_grad_clipper, l2_grad_clipper_with,
};
