// Integration tests for the network orchestrator
//
// These tests drive whole networks (wiring, weight init, trainer
// negotiation and the three sweeps) on the CPU backend.

use strata::checkpoint;
use strata::nn::{window, Split};
use strata::prelude::*;
use strata::{CpuVolume, Error, Role};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn conv(filters: usize, filter: &[usize]) -> Convolution<CpuBackend> {
    Convolution::new(ConvConfig::new(filters, filter)).unwrap()
}

fn input(ws: &mut CpuWorkspace, dims: (usize, usize, usize, usize), dtype: DType) -> VolumeId {
    ws.network_input(Shape::from(dims), Format::ChannelFirst, dtype)
        .unwrap()
}

// Shape arithmetic

#[test]
fn test_reverse_extent_inverts_forward_extent() -> strata::Result<()> {
    for i in 1..12 {
        for f in 1..5 {
            for p in 0..3 {
                for d in 1..3 {
                    let Ok(o) = window::output_extent(i, f, p, 1, d) else {
                        continue;
                    };
                    assert_eq!(window::reverse_output_extent(o, f, p, 1, d)?, i);
                }
            }
        }
    }
    Ok(())
}

#[test]
fn test_recommend_padding_even_filter_stack() -> strata::Result<()> {
    for index in 0..=5 {
        let (dilation, padding) = window::recommend_padding(8, index, 1, 1)?;
        assert_eq!(dilation, 2 * (index + 1));
        assert_eq!(padding, (7 * dilation + 2) / 2);
        assert!(matches!(
            window::recommend_padding(8, index, 1, 0),
            Err(Error::Parity { .. })
        ));
    }
    Ok(())
}

// Volumes

#[test]
fn test_volume_destroy_is_idempotent() -> strata::Result<()> {
    let dev = CpuDevice::new();
    let mut v = CpuVolume::create(
        Shape::from((2, 3, 4, 4)),
        Format::ChannelFirst,
        DType::F32,
        true,
        &dev,
    )?;
    assert_eq!(dev.allocated_bytes(), 2 * 96 * 4);
    v.destroy();
    v.destroy();
    assert!(v.is_released());
    assert_eq!(dev.allocated_bytes(), 0);
    Ok(())
}

// Orchestrator

#[test]
fn test_trainer_slots_conv_act_conv() -> strata::Result<()> {
    let mut ws = CpuWorkspace::new(CpuDevice::new());
    let x = input(&mut ws, (1, 2, 5, 5), DType::F32);
    let mut net = Network::<CpuBackend>::default();
    net.push(conv(3, &[3, 3]))?;
    net.push(Activation::relu())?;
    net.push(conv(2, &[3, 3]))?;
    net.build(&mut ws, x)?;
    net.init_weights(&ws)?;

    let slots: Vec<usize> = net.layers().iter().map(|l| l.trainer_slots_needed()).collect();
    assert_eq!(slots, vec![2, 0, 2]);
    assert_eq!(net.trainer_slots_needed(), 4);

    for wrong in [3, 5] {
        let err = net.bind_trainers(Adam::slots(wrong, AdamConfig::default()));
        assert!(matches!(
            err,
            Err(Error::TrainerCountMismatch { expected: 4, got }) if got == wrong
        ));
    }
    net.bind_trainers(Adam::slots(4, AdamConfig::default()))?;
    Ok(())
}

#[test]
fn test_single_conv_4x4() -> strata::Result<()> {
    let mut ws = CpuWorkspace::new(CpuDevice::new());
    let x = input(&mut ws, (1, 1, 4, 4), DType::F32);
    let mut net = Network::<CpuBackend>::default();
    net.push(conv(1, &[2, 2]))?;
    let y = net.build(&mut ws, x)?;
    assert_eq!(ws.get(y)?.dims(), &[1, 1, 3, 3]);
    assert_eq!(ws.get(y)?.role(), Role::NetworkOutput);

    net.init_weights(&ws)?;
    let mut records = net.weight_records()?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tensors[0].shape, vec![1, 1, 2, 2]);
    records[0].tensors[0].values = vec![1.0; 4];
    records[0].tensors[1].values = vec![0.0];
    net.load_weight_records(&records)?;

    let values: Vec<f64> = (1..=16).map(|v| v as f64).collect();
    ws.get_mut(x)?.write_values(&values)?;
    net.forward(&mut ws)?;
    assert_vec_approx(
        &ws.get(y)?.values()?,
        &[14.0, 18.0, 22.0, 30.0, 34.0, 38.0, 46.0, 50.0, 54.0],
        1e-5,
    );

    ws.get_mut(y)?.write_gradient(&[1.0; 9])?;
    net.backward(&mut ws)?;
    // the network input owns no gradient; only weights receive one
    assert!(!ws.get(x)?.has_gradient());
    Ok(())
}

#[test]
fn test_failed_allocation_leaks_nothing() -> strata::Result<()> {
    // x: 64 bytes, relu output: 2 * 64, conv output: 2 * 36
    let dev = CpuDevice::with_limit(64 + 128 + 40);
    let mut ws = CpuWorkspace::new(dev.clone());
    let x = input(&mut ws, (1, 1, 4, 4), DType::F32);
    let mut net = Network::<CpuBackend>::default();
    net.push(Activation::relu())?;
    net.push(conv(1, &[2, 2]))?;

    let err = net.build(&mut ws, x);
    assert!(matches!(err, Err(Error::Allocation { .. })));
    assert_eq!(net.state(), NetworkState::Unbuilt);
    assert_eq!(dev.allocated_bytes(), 64);
    assert_eq!(ws.live_count(), 1);
    assert!(net.owned_volumes().is_empty());
    Ok(())
}

#[test]
fn test_bad_shape_fails_build_cleanly() -> strata::Result<()> {
    let dev = CpuDevice::new();
    let mut ws = CpuWorkspace::new(dev.clone());
    let x = input(&mut ws, (1, 1, 4, 4), DType::F32);
    let before = dev.allocated_bytes();
    let mut net = Network::<CpuBackend>::default();
    net.push(Activation::relu())?;
    net.push(Convolution::new(ConvConfig::new(1, &[3, 3]).stride(&[2, 2]))?)?;

    assert!(matches!(
        net.build(&mut ws, x),
        Err(Error::IncompatibleShape { .. })
    ));
    assert_eq!(dev.allocated_bytes(), before);

    // the same network builds once the input fits the stride
    let x5 = input(&mut ws, (1, 1, 5, 5), DType::F32);
    let y = net.build(&mut ws, x5)?;
    assert_eq!(ws.get(y)?.dims(), &[1, 1, 2, 2]);
    Ok(())
}

#[test]
fn test_failed_build_keeps_caller_bound_outputs() -> strata::Result<()> {
    let dev = CpuDevice::new();
    let mut ws = CpuWorkspace::new(dev.clone());
    let x = input(&mut ws, (1, 1, 4, 4), DType::F32);
    let mine = ws.create(Shape::from((1, 1, 4, 4)), Format::ChannelFirst, DType::F32)?;
    let before = dev.allocated_bytes();

    let mut chain = Chain::<CpuBackend>::new()
        .add(Activation::relu())
        .add(Activation::relu())
        .add(Convolution::new(ConvConfig::new(1, &[1, 1]).stride(&[2, 2]))?);
    chain.layers_mut()[0].ports_mut().output.bind(mine);
    let mut net = Network::<CpuBackend>::from_chain(NetworkConfig::default(), chain);

    assert!(matches!(
        net.build(&mut ws, x),
        Err(Error::IncompatibleShape { .. })
    ));
    assert_eq!(net.state(), NetworkState::Unbuilt);
    assert_eq!(net.layers()[0].ports().output.get(), Some(mine));
    assert_eq!(net.layers()[1].ports().output.get(), None);
    assert!(ws.contains(mine));
    assert_eq!(dev.allocated_bytes(), before);
    Ok(())
}

#[test]
fn test_rejected_restore_leaves_weights_untouched() -> strata::Result<()> {
    let mut ws = CpuWorkspace::new(CpuDevice::new());
    let x = input(&mut ws, (1, 2, 3, 3), DType::F32);
    let pair = |k: usize, seed: u64, ws: &mut CpuWorkspace| -> strata::Result<Network<CpuBackend>> {
        let mut net = Network::<CpuBackend>::new(NetworkConfig::new().seed(seed));
        net.push(conv(3, &[1, 1]))?;
        net.push(conv(k, &[1, 1]))?;
        net.build(ws, x)?;
        net.init_weights(ws)?;
        Ok(net)
    };
    let source = pair(4, 1, &mut ws)?;
    let mut target = pair(2, 2, &mut ws)?;
    let before = target.weight_records()?;
    // the first layer matches, the second does not
    assert_eq!(source.weight_records()?[0].tensors[0].shape, before[0].tensors[0].shape);

    let err = target.load_weight_records(&source.weight_records()?);
    assert!(matches!(err, Err(Error::IncompatibleShape { .. })));
    assert_eq!(target.weight_records()?, before);

    let json = Checkpoint::capture(&source)?.to_json()?;
    assert!(Checkpoint::from_json(&json)?.restore(&mut target).is_err());
    assert_eq!(target.weight_records()?, before);
    Ok(())
}

#[test]
fn test_split_ten_channels_three_ways() -> strata::Result<()> {
    assert_eq!(Split::shares(10, 3)?, vec![3, 3, 4]);

    let mut ws = CpuWorkspace::new(CpuDevice::new());
    let x = input(&mut ws, (2, 10, 2, 2), DType::F64);
    let values: Vec<f64> = (0..80).map(|v| v as f64).collect();
    ws.get_mut(x)?.write_values(&values)?;

    let branch = Branch::new(vec![Chain::new(), Chain::new(), Chain::new()])?;
    let mut net = Network::<CpuBackend>::default();
    net.push(branch)?;
    let y = net.build(&mut ws, x)?;
    net.init_weights(&ws)?;
    net.forward(&mut ws)?;
    assert_eq!(ws.get(y)?.dims(), &[2, 10, 2, 2]);
    assert_eq!(ws.get(y)?.values()?, values);
    Ok(())
}

#[test]
fn test_branch_trains() -> strata::Result<()> {
    let mut ws = CpuWorkspace::new(CpuDevice::new());
    let x = input(&mut ws, (2, 6, 3, 3), DType::F32);
    let branch = Branch::new(vec![
        Chain::new()
            .add(conv(4, &[3, 3]))
            .add(Activation::tanh()),
        Chain::new().add(conv(2, &[3, 3])),
    ])?;
    let mut net = Network::<CpuBackend>::new(NetworkConfig::new().concat_trace(true));
    net.push(conv(6, &[1, 1]))?;
    net.push(branch)?;
    net.push(BatchNorm::new())?;
    let y = net.build(&mut ws, x)?;
    assert_eq!(ws.get(y)?.dims(), &[2, 6, 1, 1]);

    net.init_weights(&ws)?;
    assert_eq!(net.trainer_slots_needed(), 2 + (2 + 2) + 2);
    net.bind_trainers(Adam::slots(8, AdamConfig::default()))?;

    let before = net.weight_records()?;
    net.forward(&mut ws)?;
    let grad = [0.5, -1.0, 0.25, 1.0, -0.5, 2.0, 1.0, 0.0, -1.0, 0.5, 1.5, -2.0];
    ws.get_mut(y)?.write_gradient(&grad)?;
    net.backward(&mut ws)?;
    net.update()?;
    assert_eq!(net.update_count(), 1);
    assert_ne!(net.weight_records()?, before);
    Ok(())
}

#[test]
fn test_shared_input_gradients_accumulate() -> strata::Result<()> {
    let mut ws = CpuWorkspace::new(CpuDevice::new());
    let shared = ws.create(Shape::from((1, 2)), Format::ChannelFirst, DType::F64)?;
    ws.get_mut(shared)?.write_gradient(&[100.0, 100.0])?;

    let mut a = Network::<CpuBackend>::default();
    a.push(Reshape::new(&[2])?)?;
    let mut b = Network::<CpuBackend>::default();
    b.push(Reshape::new(&[2])?)?;
    let ya = a.build(&mut ws, shared)?;
    let yb = b.build(&mut ws, shared)?;
    for net in [&mut a, &mut b] {
        net.init_weights(&ws)?;
        net.forward(&mut ws)?;
    }
    ws.get_mut(ya)?.write_gradient(&[1.0, 2.0])?;
    ws.get_mut(yb)?.write_gradient(&[10.0, 20.0])?;

    backward_shared_input(&mut [&mut a, &mut b], &mut ws)?;
    assert_eq!(ws.get(shared)?.gradient_values()?, vec![11.0, 22.0]);

    // a plain backward overwrites instead
    a.backward(&mut ws)?;
    assert_eq!(ws.get(shared)?.gradient_values()?, vec![1.0, 2.0]);
    Ok(())
}

#[test]
fn test_shared_input_must_match() -> strata::Result<()> {
    let mut ws = CpuWorkspace::new(CpuDevice::new());
    let p = ws.create(Shape::from((1, 2)), Format::ChannelFirst, DType::F64)?;
    let q = ws.create(Shape::from((1, 2)), Format::ChannelFirst, DType::F64)?;
    let mut a = Network::<CpuBackend>::default();
    a.push(Activation::sigmoid())?;
    let mut b = Network::<CpuBackend>::default();
    b.push(Activation::sigmoid())?;
    a.build(&mut ws, p)?;
    b.build(&mut ws, q)?;
    assert!(matches!(
        backward_shared_input(&mut [&mut a, &mut b], &mut ws),
        Err(Error::InvariantViolation(_))
    ));
    Ok(())
}

#[test]
fn test_inference_disables_dropout() -> strata::Result<()> {
    let mut ws = CpuWorkspace::new(CpuDevice::new());
    let x = input(&mut ws, (1, 4, 5, 5), DType::F64);
    ws.get_mut(x)?.fill(1.0)?;
    let mut net = Network::<CpuBackend>::default();
    net.push(Dropout::new(0.5)?)?;
    let y = net.build(&mut ws, x)?;
    net.init_weights(&ws)?;

    net.forward(&mut ws)?;
    assert_eq!(net.state(), NetworkState::Training);
    let trained = ws.get(y)?.values()?;
    assert!(trained.iter().any(|&v| v == 0.0));
    assert!(trained.iter().all(|&v| v == 0.0 || approx_eq(v, 2.0, 1e-12)));

    net.inference(&mut ws)?;
    assert_eq!(net.state(), NetworkState::Inference);
    assert_eq!(ws.get(y)?.values()?, vec![1.0; 100]);
    Ok(())
}

#[test]
fn test_classifier_loss_decreases() -> strata::Result<()> {
    let mut ws = CpuWorkspace::new(CpuDevice::new());
    let x = input(&mut ws, (2, 2, 1, 1), DType::F64);
    ws.get_mut(x)?.write_values(&[1.0, 0.0, 0.0, 1.0])?;

    let history = LossHistory::shared();
    let mut net = Network::<CpuBackend>::new(NetworkConfig::new().seed(11));
    net.push(conv(2, &[1, 1]))?;
    net.set_softmax_classifier()?;
    net.add_observer(history.clone());
    net.build(&mut ws, x)?;
    net.init_weights(&ws)?;
    net.bind_trainers(Adam::slots(2, AdamConfig::new().rate(0.05).batch(2)))?;
    // sample 0 is class 1, sample 1 is class 0
    net.set_targets(&mut ws, &[0.0, 1.0, 1.0, 0.0])?;

    for _ in 0..60 {
        net.forward(&mut ws)?;
        net.backward(&mut ws)?;
        net.update()?;
    }
    let h = history.lock().unwrap();
    assert_eq!(h.len(), 60);
    let first = h.points()[0].1;
    let last = h.last().unwrap();
    assert!(last < first, "loss went from {first} to {last}");
    assert!(net.loss().is_some());
    Ok(())
}

#[test]
fn test_checkpoint_json_restores_weights() -> strata::Result<()> {
    let build = |seed: u64, ws: &mut CpuWorkspace| -> strata::Result<Network<CpuBackend>> {
        let x = input(ws, (1, 2, 4, 4), DType::F32);
        let mut net = Network::new(NetworkConfig::new().seed(seed));
        net.push(conv(3, &[3, 3]))?;
        net.push(BatchNorm::new())?;
        net.push(Activation::prelu(0.25))?;
        net.set_output(TransposedConvolution::new(ConvConfig::new(2, &[3, 3]))?)?;
        net.build(ws, x)?;
        net.init_weights(ws)?;
        Ok(net)
    };
    let mut ws = CpuWorkspace::new(CpuDevice::new());
    let saved = build(1, &mut ws)?;
    let mut restored = build(2, &mut ws)?;
    assert_ne!(saved.weight_records()?, restored.weight_records()?);

    let mut buf = Vec::new();
    checkpoint::write_json(&mut buf, &saved)?;
    checkpoint::read_json(buf.as_slice(), &mut restored)?;

    let want = saved.weight_records()?;
    let got = restored.weight_records()?;
    assert_eq!(got.len(), 4);
    assert_eq!(got.last().map(|r| r.kind), Some(LayerKind::TransposedConvolution));
    for (g, w) in got.iter().zip(&want) {
        assert_eq!(g.kind, w.kind);
        for (gt, wt) in g.tensors.iter().zip(&w.tensors) {
            assert_vec_approx(&gt.values, &wt.values, 1e-6);
        }
    }
    Ok(())
}

#[test]
fn test_checkpoint_rejects_other_architecture() -> strata::Result<()> {
    let mut ws = CpuWorkspace::new(CpuDevice::new());
    let x = input(&mut ws, (1, 2, 4, 4), DType::F32);
    let mut small = Network::<CpuBackend>::default();
    small.push(conv(3, &[3, 3]))?;
    small.build(&mut ws, x)?;
    small.init_weights(&ws)?;

    let mut wide = Network::<CpuBackend>::default();
    wide.push(conv(4, &[3, 3]))?;
    wide.build(&mut ws, x)?;
    wide.init_weights(&ws)?;

    let json = Checkpoint::capture(&small)?.to_json()?;
    let err = Checkpoint::from_json(&json)?.restore(&mut wide);
    assert!(matches!(err, Err(Error::IncompatibleShape { .. })));
    Ok(())
}
