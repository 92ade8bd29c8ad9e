//! End-to-end lowering scenarios: an oversized convolution is tiled, every
//! tile re-checked against the CMX budget, and the concatenated tile
//! outputs must reproduce the untiled reference computation exactly.

use nce_lowering::tiling::{infer_tile_step, tiled_op};
use nce_lowering::types::{AXIS_C, AXIS_H, AXIS_W};
use nce_lowering::{
    check_op, ElemType, EligibilityViolation, HardwareProfile, InvariantChecker, OpDescriptor,
    OpKind, PadInfo, TensorDescriptor, TilingEngine,
};

/// Dense reference convolution, NCHW, i32 accumulation.
fn conv_ref(
    input: &[i32],
    in_shape: [i64; 4],
    weights: &[i32],
    w_shape: [i64; 4],
    stride: (i64, i64),
    pad: PadInfo,
) -> (Vec<i32>, [i64; 4]) {
    let (ic, ih, iw) = (in_shape[1], in_shape[2], in_shape[3]);
    let (oc, ky, kx) = (w_shape[0], w_shape[2], w_shape[3]);
    let oh = (ih - ky + pad.top + pad.bottom) / stride.0 + 1;
    let ow = (iw - kx + pad.left + pad.right) / stride.1 + 1;

    let mut out = vec![0i32; (oc * oh * ow) as usize];
    for o in 0..oc {
        for y in 0..oh {
            for x in 0..ow {
                let mut acc = 0i32;
                for c in 0..ic {
                    for dy in 0..ky {
                        for dx in 0..kx {
                            let sy = y * stride.0 + dy - pad.top;
                            let sx = x * stride.1 + dx - pad.left;
                            if sy < 0 || sy >= ih || sx < 0 || sx >= iw {
                                continue;
                            }
                            let iv = input[((c * ih + sy) * iw + sx) as usize];
                            let wv = weights[(((o * ic + c) * ky + dy) * kx + dx) as usize];
                            acc += iv * wv;
                        }
                    }
                }
                out[((o * oh + y) * ow + x) as usize] = acc;
            }
        }
    }
    (out, [1, oc, oh, ow])
}

fn test_conv(ic: i64, oc: i64, h: i64, w: i64) -> OpDescriptor {
    let input = TensorDescriptor::new([1, ic, h, w], ElemType::U8);
    let weights = TensorDescriptor::new([oc, ic, 3, 3], ElemType::U8);
    let output = TensorDescriptor::new([1, oc, h, w], ElemType::U8);
    OpDescriptor::new(OpKind::Conv, input, output)
        .with_weights(weights)
        .with_kernel(3, 3)
        .with_pad(PadInfo::same(1))
}

#[test]
fn oversized_conv_splits_channels_and_fits() {
    // A 64->128-channel conv, [1,64,32,32] x [128,64,3,3], 8-bit, on a
    // budget that holds only half the operation.
    let mut profile = HardwareProfile::kmb();
    profile.cmx_bytes = 200_000;

    let op = test_conv(64, 128, 32, 32);
    assert!(matches!(
        check_op(&op, &profile),
        Err(EligibilityViolation::CmxBudgetExceeded { .. })
    ));

    let engine = TilingEngine::new(&profile);
    let tiles = engine.generate(&op).unwrap();

    // Channel splits first: two tiles of 64 output channels.
    assert_eq!(tiles.len(), 2);
    assert_eq!(tiles[0].shape[AXIS_C], 64);
    assert_eq!(tiles[1].shape[AXIS_C], 64);
    assert_eq!(tiles[1].offset[AXIS_C], 64);

    // Each tile independently satisfies the budget.
    let checker = InvariantChecker::new(&profile);
    for tile in &tiles {
        let step = infer_tile_step(&op, *tile);
        checker.fits_cmx_budget(&tiled_op(&op, &step)).unwrap();
    }
}

#[test]
fn kernel_13x13_ineligible_regardless_of_memory() {
    let profile = HardwareProfile::kmb();
    let op = test_conv(16, 16, 16, 16).with_kernel(13, 13);
    match check_op(&op, &profile) {
        Err(EligibilityViolation::KernelOutOfBounds { axis, size, max }) => {
            assert_eq!(axis, "height");
            assert_eq!(size, 13);
            assert_eq!(max, 11);
        }
        other => panic!("expected kernel violation, got {other:?}"),
    }
}

#[test]
fn tiled_execution_matches_untiled_reference() {
    // Small enough to compute densely, large enough to force a real split
    // across channels and height.
    let mut profile = HardwareProfile::kmb();
    profile.cmx_bytes = 6_000;

    let op = test_conv(16, 32, 16, 16);
    let engine = TilingEngine::new(&profile);
    let tiles = engine.generate(&op).unwrap();
    assert!(tiles.len() > 1, "budget must force a split");
    let subgraph = engine.materialize(&op, &tiles);

    // Deterministic pseudo-random constants.
    let in_shape = op.input.shape;
    let w_shape = op.weights.as_ref().unwrap().shape;
    let input: Vec<i32> = (0..in_shape.iter().product::<i64>())
        .map(|i| (i * 31 + 7) % 13 - 6)
        .map(|v| v as i32)
        .collect();
    let weights: Vec<i32> = (0..w_shape.iter().product::<i64>())
        .map(|i| (i * 17 + 3) % 7 - 3)
        .map(|v| v as i32)
        .collect();

    let (reference, out_shape) = conv_ref(&input, in_shape, &weights, w_shape, (1, 1), op.pad);
    assert_eq!(out_shape, op.output.shape);

    // Execute every tile on its back-inferred input slice with its own
    // pads, then scatter into the full output.
    let (oc_full, oh_full, ow_full) = (out_shape[1], out_shape[2], out_shape[3]);
    let mut assembled = vec![i32::MIN; reference.len()];
    for step in &subgraph.steps {
        let it = step.input;
        let (ic_t, ih_t, iw_t) = (it.shape[AXIS_C], it.shape[AXIS_H], it.shape[AXIS_W]);
        let mut input_tile = Vec::with_capacity((ic_t * ih_t * iw_t) as usize);
        for c in 0..ic_t {
            for y in 0..ih_t {
                for x in 0..iw_t {
                    let gc = it.offset[AXIS_C] + c;
                    let gy = it.offset[AXIS_H] + y;
                    let gx = it.offset[AXIS_W] + x;
                    input_tile
                        .push(input[((gc * in_shape[2] + gy) * in_shape[3] + gx) as usize]);
                }
            }
        }

        let wt = step.weights.unwrap();
        let mut weights_tile = Vec::new();
        for o in 0..wt.shape[0] {
            let go = wt.offset[0] + o;
            let per_filter = (w_shape[1] * w_shape[2] * w_shape[3]) as usize;
            let base = go as usize * per_filter;
            weights_tile.extend_from_slice(&weights[base..base + per_filter]);
        }

        let (tile_out, tile_out_shape) = conv_ref(
            &input_tile,
            [1, ic_t, ih_t, iw_t],
            &weights_tile,
            [wt.shape[0], w_shape[1], w_shape[2], w_shape[3]],
            (1, 1),
            step.pads,
        );
        assert_eq!(&tile_out_shape[1..], &step.output.shape[1..], "tile output shape");

        let ot = step.output;
        for o in 0..ot.shape[AXIS_C] {
            for y in 0..ot.shape[AXIS_H] {
                for x in 0..ot.shape[AXIS_W] {
                    let go = ot.offset[AXIS_C] + o;
                    let gy = ot.offset[AXIS_H] + y;
                    let gx = ot.offset[AXIS_W] + x;
                    let src =
                        tile_out[((o * ot.shape[AXIS_H] + y) * ot.shape[AXIS_W] + x) as usize];
                    let dst = ((go * oh_full + gy) * ow_full + gx) as usize;
                    assert_eq!(assembled[dst], i32::MIN, "tiles must not overlap");
                    assembled[dst] = src;
                }
            }
        }
    }

    assert_eq!(assembled.len(), (oc_full * oh_full * ow_full) as usize);
    assert_eq!(assembled, reference, "tiled result differs from dense reference");
}
