//! End-to-end dense-to-MoE upcycling against a checkpoint on disk.

use std::collections::HashMap;
use std::path::Path;

use mptools::checkpoint::{
    ExpertLayout, StateDict, UpcycleConfig, Upcycler, load_state_dict, save_state_dict,
};
use mptools::{Device, Error, Tensor};
use tempfile::TempDir;

const FFN: usize = 8;
const HIDDEN: usize = 4;

fn dense_partition(seed: f32) -> StateDict {
    let device = Device::Cpu;
    let mut state = HashMap::new();
    for layer in 0..2 {
        let fc1: Vec<f32> = (0..FFN * HIDDEN)
            .map(|i| seed + layer as f32 + i as f32 * 0.01)
            .collect();
        let fc2: Vec<f32> = (0..HIDDEN * FFN)
            .map(|i| seed - layer as f32 - i as f32 * 0.01)
            .collect();
        let prefix = format!("decoder.layers.{layer}");
        state.insert(
            format!("{prefix}.mlp.linear_fc1.weight"),
            Tensor::from_vec(fc1, (FFN, HIDDEN), &device).unwrap(),
        );
        state.insert(
            format!("{prefix}.mlp.linear_fc2.weight"),
            Tensor::from_vec(fc2, (HIDDEN, FFN), &device).unwrap(),
        );
        state.insert(
            format!("{prefix}.mlp.linear_fc1.layer_norm_weight"),
            Tensor::ones(HIDDEN, mptools::DType::F32, &device).unwrap(),
        );
        state.insert(
            format!("{prefix}.self_attention.linear_proj.weight"),
            Tensor::zeros((HIDDEN, HIDDEN), mptools::DType::F32, &device).unwrap(),
        );
    }
    state
}

/// Write a dense checkpoint with the given partition directory names.
fn write_checkpoint(root: &Path, iter_dir: &str, tracker: &str, partitions: &[&str]) {
    std::fs::create_dir_all(root).unwrap();
    std::fs::write(root.join("latest_checkpointed_iteration.txt"), tracker).unwrap();
    for (i, name) in partitions.iter().enumerate() {
        let dir = root.join(iter_dir).join(name);
        save_state_dict(&dir, &dense_partition(i as f32)).unwrap();
    }
}

fn load(root: &Path, iter_dir: &str, partition: &str) -> StateDict {
    load_state_dict(&root.join(iter_dir).join(partition), &Device::Cpu).unwrap()
}

fn rows(t: &Tensor) -> Vec<Vec<f32>> {
    t.to_vec2::<f32>().unwrap()
}

#[test]
fn upcycle_tensor_and_pipeline_parallel_checkpoint() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("dense");
    let output = tmp.path().join("moe");
    let partitions = ["mp_rank_00_000", "mp_rank_01_000", "mp_rank_00_001", "mp_rank_01_001"];
    write_checkpoint(&input, "iter_0000010", "10\n", &partitions);

    let config = UpcycleConfig::default()
        .with_num_experts(4)
        .with_granularity(2)
        .with_transformer_impl(ExpertLayout::ScatterMoe)
        .with_router_std(0.02)
        .with_seed(1234);
    let report = Upcycler::new(config).unwrap().run(&input, &output).unwrap();

    assert_eq!(report.tensor_parallel, 2);
    assert_eq!(report.pipeline_parallel, 2);
    assert_eq!(report.partitions, 4);
    // two layers per stage, two stages
    assert_eq!(report.routers_created, 4);

    assert_eq!(
        std::fs::read_to_string(output.join("latest_checkpointed_iteration.txt")).unwrap(),
        "10\n"
    );

    let states: Vec<StateDict> = partitions
        .iter()
        .map(|p| load(&output, "iter_0000010", p))
        .collect();
    for state in &states {
        for layer in 0..2 {
            let prefix = format!("decoder.layers.{layer}");
            assert_eq!(state[&format!("{prefix}.mlp.experts.weight1")].dims(), &[4, 4, 4]);
            assert_eq!(state[&format!("{prefix}.mlp.experts.weight2")].dims(), &[4, 4, 4]);
            assert_eq!(state[&format!("{prefix}.mlp.router.weight")].dims(), &[4, HIDDEN]);
            assert!(state.contains_key(&format!("{prefix}.pre_mlp_layernorm.weight")));
            assert!(state.contains_key(&format!("{prefix}.self_attention.linear_proj.weight")));
            assert!(!state.contains_key(&format!("{prefix}.mlp.linear_fc1.weight")));
            assert!(!state.contains_key(&format!("{prefix}.mlp.linear_fc2.weight")));
        }
    }

    let router = |i: usize, layer: usize| {
        rows(&states[i][&format!("decoder.layers.{layer}.mlp.router.weight")])
    };
    // tensor ranks of one stage share routers
    assert_eq!(router(0, 0), router(1, 0));
    assert_eq!(router(2, 1), router(3, 1));
    // different stages hold different layers
    assert_ne!(router(0, 0), router(2, 0));
    assert_ne!(router(0, 0), router(0, 1));
}

#[test]
fn seeded_upcycle_is_reproducible() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("dense");
    write_checkpoint(&input, "iter_0000003", "3", &["mp_rank_00", "mp_rank_01"]);

    let config = UpcycleConfig::default()
        .with_num_experts(2)
        .with_expert_std(0.05)
        .with_seed(99);
    let upcycler = Upcycler::new(config).unwrap();
    upcycler.run(&input, &tmp.path().join("a")).unwrap();
    let report = upcycler.run(&input, &tmp.path().join("b")).unwrap();
    assert_eq!(report.pipeline_parallel, 1);
    assert_eq!(report.routers_created, 2);

    let a = load(&tmp.path().join("a"), "iter_0000003", "mp_rank_01");
    let b = load(&tmp.path().join("b"), "iter_0000003", "mp_rank_01");
    for key in [
        "decoder.layers.1.mlp.router.weight",
        "decoder.layers.1.mlp.experts.local_experts.1.linear_fc1.weight",
        "decoder.layers.0.mlp.experts.local_experts.0.linear_fc2.weight",
    ] {
        assert_eq!(rows(&a[key]), rows(&b[key]));
    }
}

#[test]
fn grouped_gemm_checkpoint_converts_to_scattermoe() {
    let tmp = TempDir::new().unwrap();
    let dense = tmp.path().join("dense");
    let gg = tmp.path().join("gg");
    let sm_direct = tmp.path().join("sm_direct");
    let sm_converted = tmp.path().join("sm_converted");
    write_checkpoint(&dense, "iter_release", "release", &["mp_rank_00"]);

    let base = UpcycleConfig::default()
        .with_num_experts(4)
        .with_granularity(2)
        .with_scales(0.5, 2.0)
        .with_seed(5);
    Upcycler::new(base.clone().with_transformer_impl(ExpertLayout::GroupedGemm))
        .unwrap()
        .run(&dense, &gg)
        .unwrap();
    Upcycler::new(base.clone().with_transformer_impl(ExpertLayout::ScatterMoe))
        .unwrap()
        .run(&dense, &sm_direct)
        .unwrap();

    let convert = base
        .with_input_expert_format(Some(ExpertLayout::GroupedGemm))
        .with_transformer_impl(ExpertLayout::ScatterMoe);
    let report = Upcycler::new(convert).unwrap().run(&gg, &sm_converted).unwrap();
    assert_eq!(report.routers_created, 0);

    let gg_state = load(&gg, "iter_release", "mp_rank_00");
    let direct = load(&sm_direct, "iter_release", "mp_rank_00");
    let converted = load(&sm_converted, "iter_release", "mp_rank_00");

    assert_eq!(gg_state["decoder.layers.0.mlp.experts.weight1"].dims(), &[HIDDEN, 16]);
    assert_eq!(gg_state["decoder.layers.0.mlp.experts.weight2"].dims(), &[16, HIDDEN]);

    for key in [
        "decoder.layers.0.mlp.experts.weight1",
        "decoder.layers.0.mlp.experts.weight2",
        "decoder.layers.1.mlp.experts.weight1",
    ] {
        let a = direct[key].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = converted[key].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(direct[key].dims(), converted[key].dims());
        assert_eq!(a, b);
    }
    // non-expert tensors pass through conversion unchanged
    assert_eq!(
        rows(&gg_state["decoder.layers.0.mlp.router.weight"]),
        rows(&converted["decoder.layers.0.mlp.router.weight"])
    );
}

#[test]
fn three_digit_tensor_ranks_are_all_upcycled() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("dense");
    let output = tmp.path().join("moe");
    let names: Vec<String> = (0..=100).map(|tp| format!("mp_rank_{tp:02}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    write_checkpoint(&input, "iter_0000002", "2", &names);

    let config = UpcycleConfig::default().with_num_experts(2).with_seed(7);
    let report = Upcycler::new(config).unwrap().run(&input, &output).unwrap();
    assert_eq!(report.tensor_parallel, 101);
    assert_eq!(report.pipeline_parallel, 1);
    assert_eq!(report.partitions, 101);

    let last = load(&output, "iter_0000002", "mp_rank_100");
    assert!(last.contains_key("decoder.layers.0.mlp.router.weight"));
    assert!(!last.contains_key("decoder.layers.0.mlp.linear_fc1.weight"));
}

#[test]
fn unrecognized_partition_name_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("dense");
    write_checkpoint(&input, "iter_0000001", "1", &["mp_rank_00", "mp_rank_01"]);
    std::fs::create_dir(input.join("iter_0000001").join("mp_rank_0a")).unwrap();

    let err = Upcycler::new(UpcycleConfig::default())
        .unwrap()
        .run(&input, &tmp.path().join("out"))
        .unwrap_err();
    assert!(matches!(err, Error::CheckpointError { .. }));
}

#[test]
fn missing_tracker_is_an_io_error() {
    let tmp = TempDir::new().unwrap();
    let upcycler = Upcycler::new(UpcycleConfig::default()).unwrap();
    let err = upcycler
        .run(tmp.path(), &tmp.path().join("out"))
        .unwrap_err();
    assert!(matches!(err, Error::Io { .. }));
}

#[test]
fn incomplete_partition_grid_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("dense");
    write_checkpoint(
        &input,
        "iter_0000001",
        "1",
        &["mp_rank_00_000", "mp_rank_01_000", "mp_rank_00_001"],
    );

    let err = Upcycler::new(UpcycleConfig::default())
        .unwrap()
        .run(&input, &tmp.path().join("out"))
        .unwrap_err();
    assert!(matches!(err, Error::CheckpointError { .. }));
    assert!(!tmp.path().join("out").exists());
}
