use briny_conv::algo::AlgorithmDesc;
use briny_conv::config::HandleConfig;
use briny_conv::handle::Handle;
use briny_conv::layout::{DType, TensorLayout};
use briny_conv::opr::{Convolution3dBackwardFilter, ExecutionPolicy};
use briny_conv::param::{Mode, Param};
use briny_conv::tensor::{TensorMut, TensorRef};
use briny_conv::workspace::Workspace;

fn bytes64(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn values64(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(c);
            f64::from_ne_bytes(raw)
        })
        .collect()
}

/// Runs a 1-channel problem laid out along the depth axis only.
fn run_depth(
    opr: &Convolution3dBackwardFilter,
    src: &[f64],
    diff: &[f64],
    taps: usize,
) -> Vec<f64> {
    let ls = TensorLayout::contiguous([1, 1, src.len(), 1, 1], DType::Float64);
    let ld = TensorLayout::contiguous([1, 1, diff.len(), 1, 1], DType::Float64);
    let lg = TensorLayout::contiguous([1, 1, taps, 1, 1], DType::Float64);
    let src_buf = bytes64(src);
    let diff_buf = bytes64(diff);
    let mut grad_buf = vec![0u8; taps * 8];
    let mut ws = Workspace::alloc(opr.get_workspace_in_bytes(&ls, &ld, &lg).unwrap()).unwrap();
    opr.exec(
        TensorRef::new(&src_buf, 0, &ls).unwrap(),
        TensorRef::new(&diff_buf, 0, &ld).unwrap(),
        TensorMut::new(&mut grad_buf, 0, &lg).unwrap(),
        ws.as_mut_slice(),
    )
    .unwrap();
    values64(&grad_buf)
}

fn both_dense(handle: &Handle, param: Param) -> [Convolution3dBackwardFilter; 2] {
    ["ACCUMULATE_F64", "NAIVE"].map(|name| {
        let mut opr = handle.create_operator().unwrap();
        *opr.param_mut() = param;
        *opr.execution_policy_mut() = ExecutionPolicy::forced(AlgorithmDesc { name });
        opr
    })
}

#[test]
fn cross_correlation_known_answer() {
    let handle = Handle::new(HandleConfig::default());
    for opr in both_dense(&handle, Param::default()) {
        // grad[k] = sum_o diff[o] * src[o + k]
        assert_eq!(run_depth(&opr, &[1.0, 2.0, 3.0], &[1.0, 1.0], 2), vec![3.0, 5.0]);
    }
}

#[test]
fn convolution_mode_flips_the_kernel() {
    let handle = Handle::new(HandleConfig::default());
    let param = Param {
        mode: Mode::Convolution,
        ..Param::default()
    };
    for opr in both_dense(&handle, param) {
        assert_eq!(run_depth(&opr, &[1.0, 2.0, 3.0], &[1.0, 1.0], 2), vec![5.0, 3.0]);
    }
}

#[test]
fn padding_skips_out_of_range_taps() {
    let handle = Handle::new(HandleConfig::default());
    let param = Param {
        pad: [1, 0, 0],
        ..Param::default()
    };
    for opr in both_dense(&handle, param) {
        // outputs read src[o - 1] and src[o]; o = 0..4
        let grad = run_depth(&opr, &[1.0, 2.0, 3.0], &[1.0, 10.0, 100.0, 1000.0], 2);
        assert_eq!(grad, vec![10.0 + 200.0 + 3000.0, 1.0 + 20.0 + 300.0]);
    }
}

#[test]
fn stride_and_dilation_select_input_positions() {
    let handle = Handle::new(HandleConfig::default());
    let param = Param {
        stride: [2, 1, 1],
        dilate: [2, 1, 1],
        ..Param::default()
    };
    let src = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
    for opr in both_dense(&handle, param) {
        // reach 3, outputs at 0, 2, 4
        let grad = run_depth(&opr, &src, &[1.0, 1.0, 1.0], 2);
        assert_eq!(grad, vec![1.0 + 3.0 + 5.0, 3.0 + 5.0 + 7.0]);
    }
}

#[test]
fn strided_channel_view_reads_only_its_channels() {
    let handle = Handle::new(HandleConfig::default());
    let opr = handle.create_operator().unwrap();

    // two channels in the buffer, the view covers channel 1 only
    let full = TensorLayout::contiguous([1, 2, 2, 1, 1], DType::Float64);
    let view = TensorLayout::new([1, 1, 2, 1, 1], full.stride.clone(), DType::Float64);
    let ld = TensorLayout::contiguous([1, 1, 1, 1, 1], DType::Float64);
    let lg = TensorLayout::contiguous([1, 1, 2, 1, 1], DType::Float64);

    let src_buf = bytes64(&[100.0, 200.0, 3.0, 4.0]);
    let diff_buf = bytes64(&[2.0]);
    let mut grad_buf = vec![0u8; 16];
    let mut ws = Workspace::alloc(opr.get_workspace_in_bytes(&view, &ld, &lg).unwrap()).unwrap();
    opr.exec(
        TensorRef::new(&src_buf, 16, &view).unwrap(),
        TensorRef::new(&diff_buf, 0, &ld).unwrap(),
        TensorMut::new(&mut grad_buf, 0, &lg).unwrap(),
        ws.as_mut_slice(),
    )
    .unwrap();
    assert_eq!(values64(&grad_buf), vec![6.0, 8.0]);
}
