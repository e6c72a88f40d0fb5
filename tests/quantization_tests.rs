//! Fixed-point compilation driven by calibration tables.

mod common;

use bumpalo::Bump;
use common::model;
use nncc::calibration::CalibrationTable;
use nncc::core::{CompilationSession, CompileError, QuantMode, ValidationRule};
use nncc::graph::{LayerKind, TensorData};
use nncc::pipeline::{Compiler, CompilerOptions};

const SATURATING: &str = "\
x = input() -> [1, 3]
fc = dense(x) -> [1, 1]
fc.kernel [1, 3] = 1.0 -1.0 10.0
";

fn int8() -> CompilerOptions {
    CompilerOptions { mode: QuantMode::Int8 }
}

#[test]
fn test_weights_saturate_at_width() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut g = model(SATURATING);
    let table = CalibrationTable::parse("fc,5,4,6,None,floor,floor,floor\n", "x").unwrap();

    let result = Compiler::new(&session, int8()).compile(&mut g, Some(&table)).unwrap();

    let fc = g.node(g.find("fc").unwrap());
    let LayerKind::Dense(dense) = &fc.spec.kind else {
        panic!("fc should be a dense layer");
    };
    assert_eq!(dense.kernel.data, TensorData::I8(vec![64, -64, 127]));
    assert!(result.bundle.get("weights/fc.c").unwrap().contains("{64, -64, 127}"));
    assert_eq!(session.stats().tensors_quantized, 1);
}

#[test]
fn test_input_entry_is_synthesized() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut g = model(SATURATING);
    let table = CalibrationTable::parse("fc,3,4,6,None,nearest,floor,floor\n", "x").unwrap();
    assert_eq!(table.len(), 2);

    Compiler::new(&session, int8()).compile(&mut g, Some(&table)).unwrap();
    let input = g.node(g.input().unwrap());
    let q = input.q.as_ref().unwrap();
    assert_eq!(q.output_scale_factor, Some(3));
    assert!(q.is_integer());
}

#[test]
fn test_softmax_fused_into_dense_is_rejected() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut g = model(
        "\
x = input() -> [1, 2]
fc = dense(x) activation=softmax -> [1, 2]
fc.kernel [2, 2] = 1 0 0 1
",
    );
    let err = Compiler::new(&session, CompilerOptions::default()).compile(&mut g, None).unwrap_err();
    match err {
        CompileError::Validation { layer, rule, .. } => {
            assert_eq!(layer, "fc");
            assert_eq!(rule, ValidationRule::ActivationLegality);
        }
        other => panic!("unexpected error {other}"),
    }
}
