mod common;

use std::fs;

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use common::*;
use models::{
    join_key, DownBlock, DualNetwork, NamedParams, NetworkOptions, ParamSource, ScaleSelectable,
    SrNetwork, StateDict, StateDictResult,
};
use training::{
    save_dual_state_dicts, save_state_dict, CheckpointError, CheckpointKind, CheckpointPaths,
    DeviceError, ModelHandle, ModelOptions, ModelWrapper, WrapperError,
};

type Wrapper = ModelWrapper<TestBackend>;

#[test]
fn single_device_model_is_the_stored_module() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let wrapper = Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();

    assert!(!wrapper.is_replicated());
    let ModelHandle::Single(stored) = wrapper.model_handle() else {
        panic!("expected an unreplicated model");
    };
    assert!(std::ptr::eq(wrapper.get_model(), stored));
}

#[test]
fn replicated_model_unwraps_to_the_master_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let opts = ModelOptions {
        n_gpus: 2,
        ..small_options()
    };
    let wrapper = Wrapper::new(opts, &two_device_pool(), &mut log).unwrap();

    assert!(wrapper.is_replicated());
    let ModelHandle::Replicated(proxy) = wrapper.model_handle() else {
        panic!("expected a replicated model");
    };
    assert_eq!(proxy.devices().len(), 2);
    assert!(std::ptr::eq(
        wrapper.get_model(),
        training::Unwrappable::inner(proxy)
    ));
    for idx in 0..wrapper.dual_models_len() {
        assert!(wrapper.dual_handle(idx).unwrap().is_replicated());
    }
}

#[test]
fn cpu_mode_never_replicates() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let opts = ModelOptions {
        n_gpus: 2,
        cpu: true,
        ..small_options()
    };
    let pool = two_device_pool();
    let wrapper = Wrapper::new(opts, &pool, &mut log).unwrap();
    assert!(!wrapper.is_replicated());
    assert_eq!(wrapper.device(), pool.primary());
    for idx in 0..wrapper.dual_models_len() {
        assert!(!wrapper.dual_handle(idx).unwrap().is_replicated());
    }
}

#[test]
fn parameter_count_covers_trainable_parameters_only() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let wrapper = Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();
    let model = wrapper.get_model();
    assert!(model.num_params() > 0);
    assert_eq!(wrapper.count_parameters(model), model.num_params());

    let frozen = model.clone().no_grad();
    assert_eq!(wrapper.count_parameters(&frozen), 0);
    let dual = wrapper.get_dual_model(0).unwrap().clone().no_grad();
    assert_eq!(wrapper.count_parameters(&dual), 0);
}

#[test]
fn loading_into_frozen_model_keeps_it_frozen() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let wrapper = Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();
    let naming = wrapper.checkpoint_naming().unwrap();
    wrapper.save(tmp.path(), &naming, false).unwrap();

    let mut wrapper = wrapper.map_model(|model| model.no_grad());
    wrapper
        .load(&CheckpointPaths {
            pre_train: Some(naming.primary_path(tmp.path(), CheckpointKind::Latest)),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(wrapper.count_parameters(wrapper.get_model()), 0);
}

#[test]
fn one_dual_model_per_scale() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    for scale in [vec![2], vec![2, 4], vec![2, 4, 8]] {
        let mut opts = small_options();
        opts.network.scale = scale.clone();
        let wrapper = Wrapper::new(opts, &cpu_pool(), &mut log).unwrap();
        assert_eq!(wrapper.dual_models_len(), scale.len());
        assert!(wrapper.get_dual_model(scale.len()).is_none());
    }
}

#[test]
fn empty_scale_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let mut opts = small_options();
    opts.network.scale.clear();
    let err = Wrapper::new(opts, &cpu_pool(), &mut log).unwrap_err();
    assert!(matches!(err, WrapperError::NoScales));
}

#[test]
fn replication_beyond_available_devices_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let opts = ModelOptions {
        n_gpus: 3,
        ..small_options()
    };
    let err = Wrapper::new(opts, &two_device_pool(), &mut log).unwrap_err();
    assert!(matches!(
        err,
        WrapperError::Device(DeviceError::NotEnough {
            requested: 3,
            available: 2
        })
    ));
}

#[test]
fn forward_returns_one_output_per_level_and_records_scale() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let mut wrapper = Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();

    let outputs = wrapper.forward(ramp([1, 3, 4, 4]), 1);
    let dims: Vec<[usize; 4]> = outputs.iter().map(|t| t.dims()).collect();
    assert_eq!(dims, vec![[1, 3, 4, 4], [1, 3, 8, 8], [1, 3, 16, 16]]);
    assert_eq!(wrapper.idx_scale(), 1);

    let down = wrapper.dual_forward(0, outputs[2].clone()).unwrap();
    assert_eq!(down.dims(), [1, 3, 8, 8]);
    assert!(matches!(
        wrapper.dual_forward(2, outputs[0].clone()),
        Err(WrapperError::DualIndex { index: 2, len: 2 })
    ));
}

#[test]
fn ensemble_keeps_output_geometry() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let opts = ModelOptions {
        self_ensemble: true,
        test_only: true,
        ..small_options()
    };
    let mut wrapper = Wrapper::new(opts, &cpu_pool(), &mut log).unwrap();

    let input = ramp([1, 3, 4, 6]);
    let plain = wrapper.forward(input.clone(), 0);
    let auto = wrapper.forward_auto(input.clone(), 0);
    let ensemble = wrapper.forward_ensemble(input, 0);
    assert_eq!(auto.len(), plain.len());
    for ((p, a), e) in plain.iter().zip(&auto).zip(ensemble) {
        assert_eq!(p.dims(), a.dims());
        assert!(max_abs_diff(a.clone(), e) < 1e-4);
    }
}

#[test]
fn replicated_forward_matches_single_device() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let single = Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();
    let naming = single.checkpoint_naming().unwrap();
    single.save(tmp.path(), &naming, false).unwrap();

    let mut opts = ModelOptions {
        n_gpus: 2,
        ..small_options()
    };
    opts.pre_train = Some(naming.primary_path(tmp.path(), CheckpointKind::Latest));
    opts.pre_train_dual = Some(naming.dual_path(tmp.path(), CheckpointKind::Latest));
    let mut replicated = Wrapper::new(opts, &two_device_pool(), &mut log).unwrap();
    assert!(replicated.is_replicated());
    assert_eq!(
        single.count_parameters(single.get_model()),
        replicated.count_parameters(replicated.get_model())
    );

    let mut single = single;
    let input = ramp([2, 3, 4, 4]);
    let expected = single.forward(input.clone(), 0);
    let actual = replicated.forward(input.clone(), 0);
    assert_eq!(expected.len(), actual.len());
    for (e, a) in expected.into_iter().zip(actual) {
        assert_eq!(e.dims(), a.dims());
        assert!(max_abs_diff(e, a) < 1e-5);
    }

    for batch in [1, 3, 5] {
        let input = ramp([batch, 3, 4, 4]);
        let expected = single.forward(input.clone(), 0);
        let actual = replicated.forward(input, 0);
        for (e, a) in expected.into_iter().zip(actual) {
            assert_eq!(e.dims()[0], batch);
            assert_eq!(e.dims(), a.dims());
            assert!(max_abs_diff(e, a) < 1e-5, "batch {batch}");
        }
    }

    let e = single.dual_forward(1, ramp([2, 3, 8, 8])).unwrap();
    let a = replicated.dual_forward(1, ramp([2, 3, 8, 8])).unwrap();
    assert!(max_abs_diff(e, a) < 1e-5);
    let e = single.dual_forward(0, ramp([3, 3, 8, 8])).unwrap();
    let a = replicated.dual_forward(0, ramp([3, 3, 8, 8])).unwrap();
    assert_eq!(a.dims(), [3, 3, 4, 4]);
    assert!(max_abs_diff(e, a) < 1e-5);
}

#[test]
fn loading_nothing_leaves_parameters_untouched() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let mut wrapper = Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();
    let before = wrapper.state_dict().unwrap();
    let dual_before = wrapper.get_dual_model(0).unwrap().state_dict().unwrap();

    wrapper.load(&CheckpointPaths::default()).unwrap();

    assert_eq!(wrapper.state_dict().unwrap(), before);
    assert_eq!(
        wrapper.get_dual_model(0).unwrap().state_dict().unwrap(),
        dual_before
    );
}

#[test]
fn save_then_load_restores_identical_parameters() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let original = Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();
    let naming = original.checkpoint_naming().unwrap();
    original.save(tmp.path(), &naming, false).unwrap();

    let mut restored = Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();
    assert_ne!(restored.state_dict().unwrap(), original.state_dict().unwrap());
    restored
        .load(&CheckpointPaths {
            pre_train: Some(naming.primary_path(tmp.path(), CheckpointKind::Latest)),
            pre_train_dual: Some(naming.dual_path(tmp.path(), CheckpointKind::Latest)),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(restored.state_dict().unwrap(), original.state_dict().unwrap());
    for idx in 0..original.dual_models_len() {
        assert_eq!(
            restored.get_dual_model(idx).unwrap().state_dict().unwrap(),
            original.get_dual_model(idx).unwrap().state_dict().unwrap()
        );
    }
}

#[test]
fn best_checkpoints_written_only_when_best() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let wrapper = Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();
    let naming = wrapper.checkpoint_naming().unwrap();
    let dir = tmp.path();

    wrapper.save(dir, &naming, false).unwrap();
    assert!(naming.primary_path(dir, CheckpointKind::Latest).is_file());
    assert!(naming.dual_path(dir, CheckpointKind::Latest).is_file());
    assert!(!naming.primary_path(dir, CheckpointKind::Best).exists());
    assert!(!naming.dual_path(dir, CheckpointKind::Best).exists());

    wrapper.save(dir, &naming, true).unwrap();
    let read = |kind, dual: bool| {
        let path = if dual {
            naming.dual_path(dir, kind)
        } else {
            naming.primary_path(dir, kind)
        };
        fs::read(path).unwrap()
    };
    assert_eq!(read(CheckpointKind::Latest, false), read(CheckpointKind::Best, false));
    assert_eq!(read(CheckpointKind::Latest, true), read(CheckpointKind::Best, true));
    assert!(naming
        .primary_path(dir, CheckpointKind::Latest)
        .ends_with("model/DF2K_latest_x4.safetensors"));
}

#[test]
fn legacy_checkpoint_is_migrated_on_load() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    // 40 blocks put the upsampler at index 40 and the projection at 41.
    let mut opts = small_options();
    opts.network.n_blocks = 40;
    opts.test_only = true;
    let reference = Wrapper::new(opts.clone(), &cpu_pool(), &mut log).unwrap();
    let layout = reference.state_dict().unwrap();

    let legacy_path = tmp.path().join("legacy.safetensors");
    let new_path = tmp.path().join("new.safetensors");
    save_state_dict(&legacy_path, &filled_like(&layout, 0.25)).unwrap();
    save_state_dict(&new_path, &filled_like(&layout, 0.5)).unwrap();

    opts.pre_train = Some(legacy_path);
    opts.new_pre_train = Some(new_path);
    let wrapper = Wrapper::new(opts, &cpu_pool(), &mut log).unwrap();
    let merged = wrapper.state_dict().unwrap();

    assert_eq!(merged.len(), layout.len());
    for (key, tensor) in &merged {
        let expected = if key.starts_with("up_blocks.0.")
            || (key.starts_with("up_blocks.1.") && !key.starts_with("up_blocks.1.41."))
        {
            0.5
        } else {
            0.25
        };
        assert!(all_equal(tensor, expected), "{key} should hold {expected}");
    }
}

#[test]
fn legacy_checkpoint_without_new_format_loads_directly() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let reference = Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();
    let legacy_path = tmp.path().join("legacy.safetensors");
    save_state_dict(&legacy_path, &filled_like(&reference.state_dict().unwrap(), 0.75)).unwrap();

    let mut opts = small_options();
    opts.pre_train = Some(legacy_path);
    let wrapper = Wrapper::new(opts, &cpu_pool(), &mut log).unwrap();
    assert!(wrapper
        .state_dict()
        .unwrap()
        .iter()
        .all(|(_, tensor)| all_equal(tensor, 0.75)));
}

#[test]
fn partial_checkpoint_keeps_missing_parameters() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let mut wrapper = Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();
    let before = wrapper.state_dict().unwrap();

    let mut partial = StateDict::new();
    let head = before.get("head.weight").unwrap();
    partial.insert("head.weight", models::ParamTensor::filled(head.shape.clone(), 1.0));
    partial.insert("not.a.parameter", models::ParamTensor::filled(vec![1], 1.0));
    let path = tmp.path().join("partial.safetensors");
    save_state_dict(&path, &partial).unwrap();

    wrapper
        .load(&CheckpointPaths {
            pre_train: Some(path),
            ..Default::default()
        })
        .unwrap();
    let after = wrapper.state_dict().unwrap();
    assert!(all_equal(after.get("head.weight").unwrap(), 1.0));
    for (key, tensor) in &before {
        if key != "head.weight" {
            assert_eq!(after.get(key), Some(tensor), "{key} changed");
        }
    }
}

#[test]
fn dual_checkpoint_with_too_few_entries_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let wrapper = Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();
    let one = vec![wrapper.get_dual_model(0).unwrap().state_dict().unwrap()];
    let path = tmp.path().join("dual.safetensors");
    save_dual_state_dicts(&path, &one).unwrap();

    let mut opts = small_options();
    opts.pre_train_dual = Some(path);
    let err = Wrapper::new(opts, &cpu_pool(), &mut log).unwrap_err();
    assert!(matches!(
        err,
        WrapperError::Checkpoint(CheckpointError::DualCount {
            expected: 2,
            found: 1,
            ..
        })
    ));
}

#[test]
fn log_records_summary_and_parameter_count() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let mut log = open_log(tmp.path());
        Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();
    }
    let text = fs::read_to_string(tmp.path().join("log.txt")).unwrap();
    assert!(text.contains("head.weight"));
    assert!(text.contains("dual_module.0.0.weight"));
    assert!(text.contains("The number of parameters is"));

    let quiet = tempfile::tempdir().unwrap();
    {
        let mut log = open_log(quiet.path());
        let opts = ModelOptions {
            test_only: true,
            ..small_options()
        };
        Wrapper::new(opts, &cpu_pool(), &mut log).unwrap();
    }
    let text = fs::read_to_string(quiet.path().join("log.txt")).unwrap();
    assert!(!text.contains("head.weight"));
    assert!(text.contains("The number of parameters is"));
}

#[test]
fn map_dual_model_checks_index() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let wrapper = Wrapper::new(small_options(), &cpu_pool(), &mut log).unwrap();
    let wrapper = wrapper.map_dual_model(1, |dual| dual).unwrap();
    let err = wrapper.map_dual_model(2, |dual| dual).unwrap_err();
    assert!(matches!(err, WrapperError::DualIndex { index: 2, len: 2 }));
}

/// Single-level network that records the scale it was asked for.
#[derive(Module, Debug)]
struct SelectingNet<B: Backend> {
    conv: Conv2d<B>,
    selected: usize,
}

impl<B: Backend> NamedParams<B> for SelectingNet<B> {
    fn export_params(&self, prefix: &str, dict: &mut StateDict) -> StateDictResult<()> {
        self.conv.export_params(&join_key(prefix, "conv"), dict)
    }

    fn import_params(mut self, prefix: &str, source: &mut ParamSource<'_>) -> StateDictResult<Self> {
        self.conv = self.conv.import_params(&join_key(prefix, "conv"), source)?;
        Ok(self)
    }
}

impl<B: Backend> ScaleSelectable for SelectingNet<B> {
    fn set_scale(&mut self, idx_scale: usize) {
        self.selected = idx_scale;
    }
}

impl<B: Backend> SrNetwork<B> for SelectingNet<B> {
    fn build(options: &NetworkOptions, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([options.n_colors, options.n_colors], [1, 1]).init(device),
            selected: usize::MAX,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        vec![self.conv.forward(input)]
    }

    fn scale_selector(&mut self) -> Option<&mut dyn ScaleSelectable> {
        Some(self)
    }
}

#[test]
fn forward_selects_scale_on_capable_networks() {
    let tmp = tempfile::tempdir().unwrap();
    let mut log = open_log(tmp.path());
    let mut wrapper = ModelWrapper::<TestBackend, SelectingNet<TestBackend>, DownBlock<TestBackend>>::new(
        small_options(),
        &cpu_pool(),
        &mut log,
    )
    .unwrap();
    assert_eq!(wrapper.get_model().selected, usize::MAX);

    let outputs = wrapper.forward(ramp([1, 3, 4, 4]), 1);
    assert_eq!(outputs.len(), 1);
    assert_eq!(wrapper.get_model().selected, 1);
    assert_eq!(wrapper.idx_scale(), 1);

    let dual = DownBlock::<TestBackend>::build(&small_options().network, 2, wrapper.device());
    assert_eq!(
        dual.state_dict().unwrap().len(),
        wrapper.get_dual_model(0).unwrap().state_dict().unwrap().len()
    );
}
