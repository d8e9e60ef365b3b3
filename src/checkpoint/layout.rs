//! Expert weight layouts
//!
//! A dense MLP has `fc1: [f, h]` and `fc2: [h, f]`. Upcycling replicates it
//! into `E` experts; with granularity `g` every replica is cut into `g`
//! fine-grained experts of width `f / g`, so `E / g` replicas give `E`
//! experts in total.
//!
//! The fine-grained split is strided: expert chunk `j` of a replica takes
//! the rows `j, j + g, j + 2g, ...` of the hidden dimension.
//!
//! | layout         | weight1          | weight2          |
//! |----------------|------------------|------------------|
//! | `scattermoe`   | `[E, f/g, h]`    | `[E, h, f/g]`    |
//! | `grouped_gemm` | `[h, E * f/g]`   | `[E * f/g, h]`   |
//! | `local`        | `E` × `[f, h]`   | `E` × `[h, f]`   |

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use clap::ValueEnum;

use crate::error::{Error, Result};

/// How expert weights are stored in a MoE checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum ExpertLayout {
    /// One `linear_fc1`/`linear_fc2` pair per expert
    #[value(name = "local")]
    Local,
    /// Two fused 2-D matrices for grouped GEMM kernels
    #[value(name = "grouped_gemm")]
    GroupedGemm,
    /// Two fused 3-D tensors indexed by expert
    #[value(name = "scattermoe")]
    ScatterMoe,
}

impl ExpertLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpertLayout::Local => "local",
            ExpertLayout::GroupedGemm => "grouped_gemm",
            ExpertLayout::ScatterMoe => "scattermoe",
        }
    }

    /// Parse an input format where `none` means a dense checkpoint.
    pub fn parse_input_format(s: &str) -> Result<Option<Self>> {
        if s.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        s.parse().map(Some)
    }
}

impl fmt::Display for ExpertLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExpertLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ExpertLayout::Local),
            "grouped_gemm" => Ok(ExpertLayout::GroupedGemm),
            "scattermoe" => Ok(ExpertLayout::ScatterMoe),
            other => Err(Error::InvalidArgument {
                arg: "expert_layout",
                reason: format!(
                    "unknown layout '{other}', expected local, grouped_gemm or scattermoe"
                ),
            }),
        }
    }
}

fn matrix_dims(name: &'static str, t: &Tensor) -> Result<(usize, usize)> {
    t.dims2().map_err(|_| Error::CheckpointError {
        reason: format!("{name} must be 2-D, got shape {:?}", t.dims()),
    })
}

/// Replicate `w: [f, h]` into `num_experts` fine-grained experts `[E, f/g, h]`.
///
/// Output expert `r * g + j` holds rows `j, j + g, ...` of `w`.
pub fn split_rows_into_experts(
    w: &Tensor,
    num_experts: usize,
    granularity: usize,
) -> Result<Tensor> {
    let (f, h) = matrix_dims("dense weight", w)?;
    check_granularity(num_experts, granularity)?;
    if f % granularity != 0 {
        return Err(Error::CheckpointError {
            reason: format!("hidden size {f} is not divisible by granularity {granularity}"),
        });
    }
    let fine = f / granularity;
    let replicas = num_experts / granularity;

    let chunks = w
        .reshape((fine, granularity, h))?
        .transpose(0, 1)?
        .contiguous()?;
    let experts = chunks
        .unsqueeze(0)?
        .repeat((replicas, 1, 1, 1))?
        .reshape((num_experts, fine, h))?;
    Ok(experts)
}

/// Same split as [`split_rows_into_experts`], along the columns of `w: [h, f]`.
/// Returns `[E, h, f/g]`.
pub fn split_cols_into_experts(
    w: &Tensor,
    num_experts: usize,
    granularity: usize,
) -> Result<Tensor> {
    let experts = split_rows_into_experts(&w.t()?, num_experts, granularity)?;
    Ok(experts.transpose(1, 2)?.contiguous()?)
}

pub(crate) fn check_granularity(num_experts: usize, granularity: usize) -> Result<()> {
    if num_experts == 0 {
        return Err(Error::InvalidArgument {
            arg: "num_experts",
            reason: "must be at least 1".to_string(),
        });
    }
    if granularity == 0 || num_experts % granularity != 0 {
        return Err(Error::InvalidArgument {
            arg: "granularity",
            reason: format!("{granularity} must be positive and divide num_experts {num_experts}"),
        });
    }
    Ok(())
}

/// ScatterMoE `weight1: [E, f/g, h]` from dense `fc1: [f, h]`.
pub fn scattermoe_weight1(
    fc1: &Tensor,
    num_experts: usize,
    granularity: usize,
    scale: f64,
) -> Result<Tensor> {
    Ok(split_rows_into_experts(fc1, num_experts, granularity)?.affine(scale, 0.0)?)
}

/// ScatterMoE `weight2: [E, h, f/g]` from dense `fc2: [h, f]`.
pub fn scattermoe_weight2(
    fc2: &Tensor,
    num_experts: usize,
    granularity: usize,
    scale: f64,
) -> Result<Tensor> {
    Ok(split_cols_into_experts(fc2, num_experts, granularity)?.affine(scale, 0.0)?)
}

/// Grouped GEMM `weight1: [h, E * f/g]` from dense `fc1: [f, h]`.
///
/// The buffer holds `E` contiguous `[h, f/g]` blocks viewed as one matrix.
pub fn grouped_gemm_weight1(
    fc1: &Tensor,
    num_experts: usize,
    granularity: usize,
    scale: f64,
) -> Result<Tensor> {
    let (f, h) = matrix_dims("linear_fc1.weight", fc1)?;
    let blocks = split_cols_into_experts(&fc1.t()?, num_experts, granularity)?;
    let fine = f / granularity;
    Ok(blocks
        .reshape((h, num_experts * fine))?
        .affine(scale, 0.0)?)
}

/// Grouped GEMM `weight2: [E * f/g, h]` from dense `fc2: [h, f]`.
pub fn grouped_gemm_weight2(
    fc2: &Tensor,
    num_experts: usize,
    granularity: usize,
    scale: f64,
) -> Result<Tensor> {
    let (h, f) = matrix_dims("linear_fc2.weight", fc2)?;
    let blocks = split_rows_into_experts(&fc2.t()?, num_experts, granularity)?;
    let fine = f / granularity;
    Ok(blocks
        .reshape((num_experts * fine, h))?
        .affine(scale, 0.0)?)
}

fn expert_width(name: &'static str, fused: usize, num_experts: usize) -> Result<usize> {
    if num_experts == 0 || fused % num_experts != 0 {
        return Err(Error::CheckpointError {
            reason: format!("{name}: fused dim {fused} is not divisible by {num_experts} experts"),
        });
    }
    Ok(fused / num_experts)
}

/// Relayout grouped GEMM `weight1: [h, E * f]` as ScatterMoE `[E, f, h]`.
pub fn grouped_gemm_to_scattermoe_weight1(w: &Tensor, num_experts: usize) -> Result<Tensor> {
    let (h, ef) = matrix_dims("experts.weight1", w)?;
    let f = expert_width("experts.weight1", ef, num_experts)?;
    Ok(w.reshape((num_experts, h, f))?.transpose(1, 2)?.contiguous()?)
}

/// Relayout grouped GEMM `weight2: [E * f, h]` as ScatterMoE `[E, h, f]`.
pub fn grouped_gemm_to_scattermoe_weight2(w: &Tensor, num_experts: usize) -> Result<Tensor> {
    let (ef, h) = matrix_dims("experts.weight2", w)?;
    let f = expert_width("experts.weight2", ef, num_experts)?;
    Ok(w.reshape((num_experts, f, h))?.transpose(1, 2)?.contiguous()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;

    fn arange(rows: usize, cols: usize) -> Tensor {
        let data: Vec<f32> = (0..rows * cols).map(|i| i as f32).collect();
        Tensor::from_vec(data, (rows, cols), &cpu_setup()).unwrap()
    }

    #[test]
    fn test_layout_names() {
        for layout in [ExpertLayout::Local, ExpertLayout::GroupedGemm, ExpertLayout::ScatterMoe] {
            assert_eq!(layout.to_string().parse::<ExpertLayout>().unwrap(), layout);
        }
        assert_eq!(ExpertLayout::parse_input_format("none").unwrap(), None);
        assert_eq!(
            ExpertLayout::parse_input_format("grouped_gemm").unwrap(),
            Some(ExpertLayout::GroupedGemm)
        );
        assert!("megablocks".parse::<ExpertLayout>().is_err());
    }

    #[test]
    fn test_split_rows_plain_replication() {
        let w = arange(2, 3);
        let experts = split_rows_into_experts(&w, 3, 1).unwrap();
        assert_eq!(experts.dims(), &[3, 2, 3]);
        for e in 0..3 {
            let got = experts.get(e).unwrap().to_vec2::<f32>().unwrap();
            assert_eq!(got, w.to_vec2::<f32>().unwrap());
        }
    }

    #[test]
    fn test_split_rows_fine_grained_is_strided() {
        // f = 4, h = 1: rows 0,1,2,3
        let w = arange(4, 1);
        let experts = split_rows_into_experts(&w, 4, 2).unwrap();
        assert_eq!(experts.dims(), &[4, 2, 1]);
        let got = experts.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(got, vec![0.0, 2.0, 1.0, 3.0, 0.0, 2.0, 1.0, 3.0]);
    }

    #[test]
    fn test_split_cols_matches_rows_of_transpose() {
        let w = arange(3, 4);
        let experts = split_cols_into_experts(&w, 2, 2).unwrap();
        assert_eq!(experts.dims(), &[2, 3, 2]);
        // expert 1 takes columns 1 and 3
        let e1 = experts.get(1).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(e1, vec![vec![1.0, 3.0], vec![5.0, 7.0], vec![9.0, 11.0]]);
    }

    #[test]
    fn test_scattermoe_shapes_and_scale() {
        let fc1 = arange(6, 2);
        let fc2 = arange(2, 6);
        let w1 = scattermoe_weight1(&fc1, 4, 2, 2.0).unwrap();
        let w2 = scattermoe_weight2(&fc2, 4, 2, 0.5).unwrap();
        assert_eq!(w1.dims(), &[4, 3, 2]);
        assert_eq!(w2.dims(), &[4, 2, 3]);

        // expert 0 row 1 is fc1 row 2, doubled
        let e0 = w1.get(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(e0[1], vec![8.0, 10.0]);
        // expert 1 of weight2 takes columns 1, 3, 5 of fc2, halved
        let e1 = w2.get(1).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(e1[0], vec![0.5, 1.5, 2.5]);
    }

    #[test]
    fn test_grouped_gemm_shapes() {
        let fc1 = arange(6, 2);
        let fc2 = arange(2, 6);
        let w1 = grouped_gemm_weight1(&fc1, 4, 2, 1.0).unwrap();
        let w2 = grouped_gemm_weight2(&fc2, 4, 2, 1.0).unwrap();
        assert_eq!(w1.dims(), &[2, 12]);
        assert_eq!(w2.dims(), &[12, 2]);
    }

    #[test]
    fn test_grouped_gemm_converts_to_scattermoe() {
        let fc1 = arange(6, 2);
        let fc2 = arange(2, 6);

        let gg1 = grouped_gemm_weight1(&fc1, 4, 2, 1.0).unwrap();
        let gg2 = grouped_gemm_weight2(&fc2, 4, 2, 1.0).unwrap();
        let sm1 = grouped_gemm_to_scattermoe_weight1(&gg1, 4).unwrap();
        let sm2 = grouped_gemm_to_scattermoe_weight2(&gg2, 4).unwrap();

        let direct1 = scattermoe_weight1(&fc1, 4, 2, 1.0).unwrap();
        let direct2 = scattermoe_weight2(&fc2, 4, 2, 1.0).unwrap();
        assert_eq!(sm1.dims(), direct1.dims());
        assert_eq!(sm2.dims(), direct2.dims());
        assert_eq!(
            sm1.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            direct1.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
        assert_eq!(
            sm2.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            direct2.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_invalid_splits() {
        let w = arange(6, 2);
        assert!(split_rows_into_experts(&w, 3, 2).is_err());
        assert!(split_rows_into_experts(&w, 4, 0).is_err());
        assert!(split_rows_into_experts(&w, 0, 1).is_err());
        assert!(split_rows_into_experts(&arange(5, 2), 4, 2).is_err());
        assert!(grouped_gemm_to_scattermoe_weight1(&arange(2, 7), 4).is_err());
    }
}
