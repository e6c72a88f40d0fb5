//! Shared models and helpers for the integration tests.

#![allow(dead_code)]

use nncc::graph::Graph;
use nncc::text_ir::parse_model;

/// Padded 1D convolution classifier exercising every optimizer pass.
pub const CONV_CLASSIFIER: &str = "\
; conv classifier
x = input() -> [1, 4, 2]
pad = zeropadding1d(x) padding=1:1 -> [1, 6, 2]
conv = conv1d(pad) filters=2 kernel_size=3 -> [1, 4, 2]
conv.kernel [2, 3, 2] = 0.5 -1 0.25 0.75 -0.5 1 1 0 -1 0.5 0.25 -0.25
conv.bias [2] = 0.1 -0.2
act = activation(conv) activation=relu -> [1, 4, 2]
drop = dropout(act) rate=0.25 -> [1, 4, 2]
flat = flatten(drop) -> [1, 8]
fc = dense(flat) units=3 -> [1, 3]
fc.kernel [3, 8] = 0.1 0.2 0.3 0.4 -0.1 -0.2 -0.3 -0.4 1 0 1 0 1 0 1 0 -0.5 0.5 -0.5 0.5 0.25 0.25 0.25 0.25
fc.bias [3] = 0 0.5 -0.5
sm = activation(fc) activation=softmax -> [1, 3]
";

/// Dense network whose first layer fans out into two activations joined by an add.
pub const RESIDUAL: &str = "\
x = input() -> [1, 4]
fc1 = dense(x) -> [1, 4]
fc1.kernel [4, 4] = 1 0 0 0 0 -2 0 0 0 0 3 0 0 0 0 -8
fc1.bias [4] = 0.5 0.5 -0.5 -0.5
a = activation(fc1) activation=relu -> [1, 4]
b = activation(fc1) activation=relu6 -> [1, 4]
sum = add(a, b) -> [1, 4]
fc2 = dense(sum) -> [1, 2]
fc2.kernel [2, 4] = 1 1 1 1 1 -1 1 -1
";

pub fn model(text: &str) -> Graph {
    parse_model(text).unwrap_or_else(|e| panic!("invalid test model: {e}"))
}

pub fn assert_close(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len(), "{a:?} != {b:?}");
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < 1e-5, "{a:?} != {b:?}");
    }
}
