//! Dense-to-MoE checkpoint upcycling
//!
//! Every dense MLP becomes a mixture of `E` experts initialised from the
//! dense weights, plus a freshly initialised router. Routers are shared by
//! all tensor-parallel partitions of the same layer, so each TP shard sees
//! identical routing.
//!
//! Per layer `N`, the state dict is rewritten as:
//!
//! | dense key                                    | MoE key(s)                                   |
//! |----------------------------------------------|----------------------------------------------|
//! | `decoder.layers.N.mlp.linear_fc1.layer_norm_weight` | `decoder.layers.N.pre_mlp_layernorm.weight` |
//! | `decoder.layers.N.mlp.linear_fc1.layer_norm_bias`   | `decoder.layers.N.pre_mlp_layernorm.bias`   |
//! | `decoder.layers.N.mlp.linear_fc1.weight`     | `decoder.layers.N.mlp.router.weight` + expert fc1 |
//! | `decoder.layers.N.mlp.linear_fc2.weight`     | expert fc2                                   |
//! | `decoder.layers.N.mlp.linear_fc{1,2}._extra_state` | removed                                |

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use regex::Regex;
use tracing::{debug, info, warn};

use super::io::{
    StateDict, copy_tracker, iteration_dir, load_state_dict, read_tracker, save_state_dict,
};
use super::layout::{
    ExpertLayout, check_granularity, grouped_gemm_to_scattermoe_weight1,
    grouped_gemm_to_scattermoe_weight2, grouped_gemm_weight1, grouped_gemm_weight2,
    scattermoe_weight1, scattermoe_weight2,
};
use super::partition::{Partition, discover_partitions, parallel_sizes};
use crate::error::{Error, Result};

static DENSE_MLP_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^decoder\.layers\.(\d+)\.mlp\.linear_fc([12])\.(layer_norm_weight|layer_norm_bias|weight|_extra_state)$",
    )
    .expect("valid state dict key regex")
});

/// Upcycling configuration
#[derive(Debug, Clone, PartialEq)]
pub struct UpcycleConfig {
    /// Number of experts per MoE layer
    pub num_experts: usize,
    /// Expert layout of the input, `None` for a dense checkpoint
    pub input_expert_format: Option<ExpertLayout>,
    /// Expert layout to write
    pub transformer_impl: ExpertLayout,
    /// Router init std; 0 keeps the linear-layer default `U(-1/√h, 1/√h)`
    pub router_std: f64,
    /// Gaussian noise std added to local experts
    pub expert_std: f64,
    /// Uniform noise half-width added to local experts, takes precedence over `expert_std`
    pub expert_uniform: f64,
    /// Scale applied to expert fc1 weights
    pub scale_st_w1: f64,
    /// Scale applied to fused expert fc2 weights
    pub scale_st: f64,
    /// Fine-grained experts per dense replica
    pub granularity: usize,
    /// RNG seed for routers and noise
    pub seed: Option<u64>,
}

impl Default for UpcycleConfig {
    fn default() -> Self {
        Self {
            num_experts: 8,
            input_expert_format: None,
            transformer_impl: ExpertLayout::Local,
            router_std: 0.0,
            expert_std: 0.0,
            expert_uniform: 0.0,
            scale_st_w1: 1.0,
            scale_st: 1.0,
            granularity: 1,
            seed: None,
        }
    }
}

impl UpcycleConfig {
    pub fn with_num_experts(mut self, num_experts: usize) -> Self {
        self.num_experts = num_experts;
        self
    }

    pub fn with_input_expert_format(mut self, format: Option<ExpertLayout>) -> Self {
        self.input_expert_format = format;
        self
    }

    pub fn with_transformer_impl(mut self, layout: ExpertLayout) -> Self {
        self.transformer_impl = layout;
        self
    }

    pub fn with_router_std(mut self, std: f64) -> Self {
        self.router_std = std;
        self
    }

    pub fn with_expert_std(mut self, std: f64) -> Self {
        self.expert_std = std;
        self
    }

    pub fn with_expert_uniform(mut self, half_width: f64) -> Self {
        self.expert_uniform = half_width;
        self
    }

    pub fn with_scales(mut self, scale_st_w1: f64, scale_st: f64) -> Self {
        self.scale_st_w1 = scale_st_w1;
        self.scale_st = scale_st;
        self
    }

    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Layout conversion only: relay existing expert weights, no upcycling.
    pub fn is_layout_conversion(&self) -> bool {
        self.input_expert_format.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        check_granularity(self.num_experts, self.granularity)?;

        for (arg, value) in [
            ("router_std", self.router_std),
            ("expert_std", self.expert_std),
            ("expert_uniform", self.expert_uniform),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidArgument {
                    arg,
                    reason: format!("must be finite and >= 0, got {value}"),
                });
            }
        }
        for (arg, value) in [("scale_st_w1", self.scale_st_w1), ("scale_st", self.scale_st)] {
            if !value.is_finite() {
                return Err(Error::InvalidArgument {
                    arg,
                    reason: format!("must be finite, got {value}"),
                });
            }
        }

        if let Some(input) = self.input_expert_format {
            if input != ExpertLayout::GroupedGemm || self.transformer_impl != ExpertLayout::ScatterMoe
            {
                return Err(Error::InvalidArgument {
                    arg: "input_expert_format",
                    reason: format!(
                        "only grouped_gemm -> scattermoe conversion is supported, got {input} -> {}",
                        self.transformer_impl
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Summary of an upcycling run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpcycleReport {
    pub tensor_parallel: usize,
    pub pipeline_parallel: usize,
    pub partitions: usize,
    pub routers_created: usize,
}

#[derive(Debug, Clone, Copy)]
enum Init {
    Uniform(f64),
    Normal(f64),
}

impl Init {
    fn sample(self, rng: &mut StdRng, dims: &[usize], device: &Device) -> Result<Tensor> {
        let n: usize = dims.iter().product();
        let data: Vec<f32> = match self {
            Init::Uniform(bound) => (0..n)
                .map(|_| rng.random_range(-bound..bound) as f32)
                .collect(),
            Init::Normal(std) => {
                let normal = Normal::new(0.0, std).map_err(|e| Error::InvalidArgument {
                    arg: "std",
                    reason: e.to_string(),
                })?;
                (0..n).map(|_| normal.sample(rng) as f32).collect()
            }
        };
        Ok(Tensor::from_vec(data, dims, device)?)
    }
}

/// Routers shared across the partitions of one run, keyed by global layer.
struct RouterBank {
    routers: HashMap<usize, Tensor>,
    rng: StdRng,
}

impl RouterBank {
    fn new(seed: u64) -> Self {
        Self {
            routers: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn get_or_create(
        &mut self,
        layer: usize,
        hidden: usize,
        config: &UpcycleConfig,
    ) -> Result<Tensor> {
        if let Some(router) = self.routers.get(&layer) {
            let (_, h) = router.dims2()?;
            if h != hidden {
                return Err(Error::CheckpointError {
                    reason: format!(
                        "layer {layer}: hidden size {hidden} doesn't match existing router ({h})"
                    ),
                });
            }
            debug!(layer, "using existing router");
            return Ok(router.clone());
        }

        let init = if config.router_std > 0.0 {
            Init::Normal(config.router_std)
        } else {
            Init::Uniform(1.0 / (hidden as f64).sqrt())
        };
        let mut router = init.sample(&mut self.rng, &[config.num_experts, hidden], &Device::Cpu)?;

        // fine-grained experts cut from the same replica share routing rows
        if config.granularity > 1 {
            let base = config.num_experts / config.granularity;
            router = router
                .narrow(0, 0, base)?
                .unsqueeze(1)?
                .repeat((1, config.granularity, 1))?
                .reshape((config.num_experts, hidden))?;
        }

        info!(layer, experts = config.num_experts, hidden, "creating new router");
        self.routers.insert(layer, router.clone());
        Ok(router)
    }
}

/// Offline dense-to-MoE converter.
#[derive(Debug, Clone)]
pub struct Upcycler {
    config: UpcycleConfig,
    device: Device,
}

impl Upcycler {
    pub fn new(config: UpcycleConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device: Device::Cpu,
        })
    }

    /// Device the partitions are loaded onto.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn config(&self) -> &UpcycleConfig {
        &self.config
    }

    /// Convert the latest iteration of the checkpoint in `input` into `output`.
    ///
    /// The tracker file is copied and every partition is written to the same
    /// relative path under `output`.
    pub fn run(&self, input: &Path, output: &Path) -> Result<UpcycleReport> {
        let iteration = read_tracker(input)?;
        let iter_dir = iteration_dir(input, &iteration)?;
        let partitions = discover_partitions(&iter_dir)?;
        info!(count = partitions.len(), iteration = %iteration, "found partitions");

        let (tp, pp) = parallel_sizes(&partitions)?;
        info!(tensor_parallel = tp, pipeline_parallel = pp, "parallel layout");

        copy_tracker(input, output)?;
        let out_iter = match iter_dir.file_name() {
            Some(name) => output.join(name),
            None => output.join(format!("iter_{iteration}")),
        };

        let routers_created = if self.config.is_layout_conversion() {
            self.convert_layouts(&partitions, &out_iter)?;
            0
        } else {
            self.upcycle_partitions(&partitions, &out_iter)?
        };

        Ok(UpcycleReport {
            tensor_parallel: tp,
            pipeline_parallel: pp,
            partitions: partitions.len(),
            routers_created,
        })
    }

    fn convert_layouts(&self, partitions: &[Partition], out_iter: &Path) -> Result<()> {
        info!(
            from = ?self.config.input_expert_format,
            to = %self.config.transformer_impl,
            "converting expert layout"
        );
        partitions.par_iter().try_for_each(|partition| {
            info!(partition = %partition.path.display(), "converting partition");
            let mut state = load_state_dict(&partition.path, &self.device)?;
            convert_expert_layout(&mut state, self.config.num_experts)?;
            save_state_dict(&out_iter.join(partition.dir_name()), &state)
        })
    }

    fn upcycle_partitions(&self, partitions: &[Partition], out_iter: &Path) -> Result<usize> {
        let seed = self.config.seed.unwrap_or_else(rand::random);
        info!(seed, layout = %self.config.transformer_impl, "upcycling to MoE");

        if self.config.transformer_impl == ExpertLayout::Local && self.config.granularity > 1 {
            warn!(
                granularity = self.config.granularity,
                "local experts are full copies, granularity only affects the router"
            );
        }

        let mut bank = RouterBank::new(seed);
        for partition in partitions {
            info!(partition = %partition.path.display(), "converting partition");
            let mut state = load_state_dict(&partition.path, &self.device)?;
            self.upcycle_state_dict(&mut state, partition, &mut bank)?;
            save_state_dict(&out_iter.join(partition.dir_name()), &state)?;
        }
        Ok(bank.routers.len())
    }

    /// Rewrite the dense MLP entries of one partition's state dict in place.
    fn upcycle_state_dict(
        &self,
        state: &mut StateDict,
        partition: &Partition,
        bank: &mut RouterBank,
    ) -> Result<()> {
        let mut keys: Vec<String> = state.keys().cloned().collect();
        keys.sort();

        let mut added: Vec<(String, Tensor)> = Vec::new();
        let mut removed: Vec<String> = Vec::new();

        for key in keys {
            let Some((layer, fc, field)) = DENSE_MLP_KEY
                .captures(&key)
                .map(|caps| (caps[1].to_string(), caps[2].to_string(), caps[3].to_string()))
            else {
                continue;
            };
            let Some(value) = state.get(&key) else {
                continue;
            };

            match (fc.as_str(), field.as_str()) {
                ("1", "layer_norm_weight") => {
                    let new_key = format!("decoder.layers.{layer}.pre_mlp_layernorm.weight");
                    added.push((new_key, value.clone()));
                }
                ("1", "layer_norm_bias") => {
                    let new_key = format!("decoder.layers.{layer}.pre_mlp_layernorm.bias");
                    added.push((new_key, value.clone()));
                }
                ("1", "weight") => {
                    let local: usize = layer.parse().map_err(|_| Error::CheckpointError {
                        reason: format!("bad layer number in {key}"),
                    })?;
                    let (_, hidden) = value.dims2().map_err(|_| Error::CheckpointError {
                        reason: format!("{key} must be 2-D, got {:?}", value.dims()),
                    })?;
                    let global = partition.global_layer(local);
                    let router = bank.get_or_create(global, hidden, &self.config)?;
                    let router = router.to_dtype(value.dtype())?.to_device(value.device())?;
                    added.push((format!("decoder.layers.{layer}.mlp.router.weight"), router));
                    added.extend(self.expert_fc1(&layer, value, &mut bank.rng)?);
                }
                ("2", "weight") => {
                    added.extend(self.expert_fc2(&layer, value, &mut bank.rng)?);
                }
                (_, "_extra_state") => {}
                _ => continue,
            }
            removed.push(key);
        }

        for (key, value) in added {
            debug!(key = %key, shape = ?value.dims(), "add");
            state.insert(key, value);
        }
        for key in removed {
            debug!(key = %key, "remove");
            state.remove(&key);
        }
        Ok(())
    }

    fn expert_fc1(
        &self,
        layer: &str,
        fc1: &Tensor,
        rng: &mut StdRng,
    ) -> Result<Vec<(String, Tensor)>> {
        let cfg = &self.config;
        match cfg.transformer_impl {
            ExpertLayout::Local => (0..cfg.num_experts)
                .map(|i| {
                    let w = self.perturb(fc1, rng)?.affine(cfg.scale_st_w1, 0.0)?;
                    Ok((local_expert_key(layer, i, 1), w))
                })
                .collect(),
            ExpertLayout::ScatterMoe => Ok(vec![(
                fused_expert_key(layer, 1),
                scattermoe_weight1(fc1, cfg.num_experts, cfg.granularity, cfg.scale_st_w1)?,
            )]),
            ExpertLayout::GroupedGemm => Ok(vec![(
                fused_expert_key(layer, 1),
                grouped_gemm_weight1(fc1, cfg.num_experts, cfg.granularity, cfg.scale_st_w1)?,
            )]),
        }
    }

    fn expert_fc2(
        &self,
        layer: &str,
        fc2: &Tensor,
        rng: &mut StdRng,
    ) -> Result<Vec<(String, Tensor)>> {
        let cfg = &self.config;
        match cfg.transformer_impl {
            ExpertLayout::Local => (0..cfg.num_experts)
                .map(|i| Ok((local_expert_key(layer, i, 2), self.perturb(fc2, rng)?)))
                .collect(),
            ExpertLayout::ScatterMoe => Ok(vec![(
                fused_expert_key(layer, 2),
                scattermoe_weight2(fc2, cfg.num_experts, cfg.granularity, cfg.scale_st)?,
            )]),
            ExpertLayout::GroupedGemm => Ok(vec![(
                fused_expert_key(layer, 2),
                grouped_gemm_weight2(fc2, cfg.num_experts, cfg.granularity, cfg.scale_st)?,
            )]),
        }
    }

    /// Copy of `w` with the configured expert noise added.
    fn perturb(&self, w: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
        let init = if self.config.expert_uniform > 0.0 {
            Init::Uniform(self.config.expert_uniform)
        } else if self.config.expert_std > 0.0 {
            Init::Normal(self.config.expert_std)
        } else {
            return Ok(w.copy()?);
        };
        let noise = init
            .sample(rng, w.dims(), w.device())?
            .to_dtype(w.dtype())?;
        Ok(w.add(&noise)?)
    }
}

fn local_expert_key(layer: &str, expert: usize, fc: u8) -> String {
    format!("decoder.layers.{layer}.mlp.experts.local_experts.{expert}.linear_fc{fc}.weight")
}

fn fused_expert_key(layer: &str, fc: u8) -> String {
    format!("decoder.layers.{layer}.mlp.experts.weight{fc}")
}

/// Relayout grouped GEMM expert weights of a state dict as ScatterMoE.
pub fn convert_expert_layout(state: &mut StateDict, num_experts: usize) -> Result<()> {
    for (key, value) in state.iter_mut() {
        if !key.contains(".experts.") {
            continue;
        }
        let converted = if key.ends_with("weight1") {
            grouped_gemm_to_scattermoe_weight1(value, num_experts)?
        } else if key.ends_with("weight2") {
            grouped_gemm_to_scattermoe_weight2(value, num_experts)?
        } else {
            continue;
        };
        debug!(key = %key, from = ?value.dims(), to = ?converted.dims(), "relayout");
        *value = converted;
    }
    Ok(())
}
