//! Config-driven gradient clipping
//!
//! [`GradClipper`] wraps the two clip paths behind one call: it validates the
//! configuration once, picks the multi-tensor path when the gradients allow it,
//! and reports what happened.

use tracing::debug;

use super::grad_clip::{NormType, Parameter, clip_coefficient, clip_grad_norm, validate_max_norm};
use super::multi_tensor::{ClipStrategy, l2_grad_clipper};
use crate::distributed::ModelParallelGroup;
use crate::error::Result;

/// Gradient clipping configuration
#[derive(Debug, Clone, PartialEq)]
pub struct GradClipConfig {
    /// Upper bound on the global gradient norm
    pub max_norm: f64,
    /// Norm used to measure the gradients
    pub norm_type: NormType,
    /// Use batched kernels for L2 when possible
    pub use_multi_tensor: bool,
}

impl Default for GradClipConfig {
    fn default() -> Self {
        Self {
            max_norm: 1.0,
            norm_type: NormType::P(2.0),
            use_multi_tensor: true,
        }
    }
}

impl GradClipConfig {
    pub fn with_max_norm(mut self, max_norm: f64) -> Self {
        self.max_norm = max_norm;
        self
    }

    pub fn with_norm_type(mut self, norm_type: NormType) -> Self {
        self.norm_type = norm_type;
        self
    }

    pub fn with_multi_tensor(mut self, enabled: bool) -> Self {
        self.use_multi_tensor = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_max_norm(self.max_norm)?;
        self.norm_type.validate()
    }
}

/// Result of one clipping call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipOutcome {
    /// Global norm before clipping
    pub total_norm: f64,
    /// `max_norm / (total_norm + eps)`
    pub clip_coef: f64,
    /// Whether gradients were scaled
    pub clipped: bool,
    /// Path that ran
    pub strategy: ClipStrategy,
}

/// Gradient clipper with a validated configuration.
#[derive(Debug, Clone)]
pub struct GradClipper {
    config: GradClipConfig,
}

impl GradClipper {
    pub fn new(config: GradClipConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &GradClipConfig {
        &self.config
    }

    /// Strategy that [`clip`](Self::clip) would use for these parameters.
    pub fn strategy_for(&self, parameters: &[Parameter]) -> ClipStrategy {
        if !self.config.use_multi_tensor {
            return ClipStrategy::Reference;
        }
        ClipStrategy::detect(parameters, self.config.norm_type)
    }

    /// Clip the gradients of `parameters` in place.
    ///
    /// Collective: every rank in `group` must call this with the same config.
    pub fn clip<G>(&self, group: &G, parameters: &mut [Parameter]) -> Result<ClipOutcome>
    where
        G: ModelParallelGroup + ?Sized,
    {
        let strategy = self.strategy_for(parameters);
        let max_norm = self.config.max_norm;

        let total_norm = match strategy {
            ClipStrategy::MultiTensor => l2_grad_clipper(group, parameters, max_norm)?,
            ClipStrategy::Reference => {
                clip_grad_norm(group, parameters, max_norm, self.config.norm_type)?
            }
        };
        let clip_coef = clip_coefficient(max_norm, total_norm);
        let outcome = ClipOutcome {
            total_norm,
            clip_coef,
            clipped: clip_coef < 1.0,
            strategy,
        };

        debug!(?strategy, total_norm, clip_coef, "gradient clip");
        Ok(outcome)
    }
}
