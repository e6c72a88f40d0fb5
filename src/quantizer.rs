// This module implements fixed-point weight quantization. A Quantizer is built for one integer
// width and converts float tensors by scaling with a power of two, rounding with the layer's
// configured policy, clamping to the representable range and narrowing to the target integer
// type. Tensors that already hold integers pass through untouched, so quantizing twice is a
// no-op. quantize_graph walks the annotated graph, rewrites the weights of every integer layer
// in place (bias with its own scale factor when one is given) and records each layer's numeric
// type in the compilation session for the emitter to declare.

//! Fixed-point weight quantization.

use thiserror::Error;

use crate::core::number::signed_bounds;
use crate::core::{CompilationSession, CompileError, CompileResult, RoundMode};
use crate::graph::{Graph, Tensor, TensorData};

/// Failure of a single conversion, before it is tied to a layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizeError {
    #[error("no integer data type for width {0}, supported: 8, 16, 32")]
    UnsupportedWidth(u32),

    #[error("unsupported round mode {0}, supported: floor, nearest")]
    UnsupportedRoundMode(RoundMode),
}

impl QuantizeError {
    /// Report this failure against `layer`.
    pub fn at_layer(self, layer: &str) -> CompileError {
        CompileError::quantization(layer, self.to_string())
    }
}

/// Converts float tensors to `width`-bit signed integers.
#[derive(Debug, Clone, Copy)]
pub struct Quantizer {
    width: u32,
    number_min: i64,
    number_max: i64,
}

impl Quantizer {
    /// Quantizer for 8, 16 or 32-bit integers.
    pub fn new(width: u32) -> Result<Self, QuantizeError> {
        if !matches!(width, 8 | 16 | 32) {
            return Err(QuantizeError::UnsupportedWidth(width));
        }
        let (number_min, number_max) = signed_bounds(width);
        Ok(Self { width, number_min, number_max })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn number_min(&self) -> i64 {
        self.number_min
    }

    pub fn number_max(&self) -> i64 {
        self.number_max
    }

    /// Quantize one value: scale by `2^scale_factor`, round, clamp.
    pub fn quantize_value(&self, value: f64, scale_factor: i32, round_mode: RoundMode) -> Result<i64, QuantizeError> {
        let scaled = value * 2f64.powi(scale_factor);
        let rounded = match round_mode {
            RoundMode::Floor => scaled.floor(),
            RoundMode::Nearest => (scaled + 0.5).floor(),
            RoundMode::None => return Err(QuantizeError::UnsupportedRoundMode(round_mode)),
        };
        Ok(rounded.clamp(self.number_min as f64, self.number_max as f64) as i64)
    }

    /// Quantize a whole tensor. Integer tensors are returned unchanged.
    pub fn quantize_tensor(&self, tensor: &Tensor, scale_factor: i32, round_mode: RoundMode) -> Result<Tensor, QuantizeError> {
        let Some(values) = tensor.as_f32() else {
            return Ok(tensor.clone());
        };
        let mut quantized = Vec::with_capacity(values.len());
        for &v in values {
            quantized.push(self.quantize_value(f64::from(v), scale_factor, round_mode)?);
        }
        // Values are clamped to the width's range, so the narrowing casts are exact.
        let data = match self.width {
            8 => TensorData::I8(quantized.iter().map(|&v| v as i8).collect()),
            16 => TensorData::I16(quantized.iter().map(|&v| v as i16).collect()),
            _ => TensorData::I32(quantized.iter().map(|&v| v as i32).collect()),
        };
        Ok(Tensor { shape: tensor.shape.clone(), data })
    }
}

/// Quantize the weights of every integer layer in place.
pub fn quantize_graph(graph: &mut Graph, session: &CompilationSession<'_>) -> CompileResult<()> {
    for id in graph.ids().to_vec() {
        let node = graph.node_mut(id);
        let name = node.spec.name.clone();
        let Some(q) = node.q.clone() else {
            return Err(CompileError::quantization(name, "no quantization information"));
        };
        session.record_number_type(q.number_type());

        if !q.is_integer() || !node.spec.has_weights() {
            continue;
        }
        let Some(scale_factor) = q.weights_scale_factor else {
            return Err(CompileError::quantization(name, "no weights scale factor"));
        };
        let Some(round_mode) = q.weights_round_mode else {
            return Err(CompileError::quantization(name, "no weights round mode"));
        };
        let quantizer = Quantizer::new(q.width).map_err(|e| e.at_layer(&name))?;
        log::info!(
            "{} quantization weights={} bias={:?}",
            name,
            scale_factor,
            q.bias_scale_factor
        );

        for (role, tensor) in node.spec.weights_mut() {
            let sf = match role {
                "bias" => q.bias_scale_factor.unwrap_or(scale_factor),
                _ => scale_factor,
            };
            *tensor = quantizer.quantize_tensor(tensor, sf, round_mode).map_err(|e| e.at_layer(&name))?;
            session.record_tensor_quantized(tensor.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NumberKind, Quantization};
    use crate::graph::{Activation, Dense, LayerKind, LayerSpec};
    use bumpalo::Bump;

    #[test]
    fn test_boundaries_width_8() {
        let q = Quantizer::new(8).unwrap();
        assert_eq!((q.number_min(), q.number_max()), (-128, 127));
        let t = Tensor::vector(vec![1.0, -1.0, 10.0, -10.0]);
        let out = q.quantize_tensor(&t, 6, RoundMode::Floor).unwrap();
        assert_eq!(out.data, TensorData::I8(vec![64, -64, 127, -128]));
    }

    #[test]
    fn test_nearest_rounding() {
        let q = Quantizer::new(16).unwrap();
        assert_eq!(q.quantize_value(0.3, 2, RoundMode::Nearest).unwrap(), 1);
        assert_eq!(q.quantize_value(0.3, 2, RoundMode::Floor).unwrap(), 1);
        assert_eq!(q.quantize_value(0.2, 2, RoundMode::Nearest).unwrap(), 1);
        assert_eq!(q.quantize_value(0.2, 2, RoundMode::Floor).unwrap(), 0);
        assert_eq!(q.quantize_value(-0.2, 2, RoundMode::Nearest).unwrap(), -1);
        // Negative scale factors shift right.
        assert_eq!(q.quantize_value(8.0, -2, RoundMode::Floor).unwrap(), 2);
    }

    #[test]
    fn test_round_mode_none_fails() {
        let q = Quantizer::new(8).unwrap();
        assert_eq!(
            q.quantize_tensor(&Tensor::vector(vec![1.0]), 0, RoundMode::None),
            Err(QuantizeError::UnsupportedRoundMode(RoundMode::None))
        );

        // A layer whose weights round mode is none fails with a layer-level error.
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut q = int8_q();
        q.weights_round_mode = Some(RoundMode::None);
        let err = quantize_graph(&mut graph_with_dense(q), &session).unwrap_err();
        assert!(matches!(err, CompileError::Quantization { .. }));
        assert_eq!(err.layer(), Some("fc"));
        assert!(err.to_string().contains("round mode"));
    }

    #[test]
    fn test_unsupported_width() {
        assert_eq!(Quantizer::new(12).unwrap_err(), QuantizeError::UnsupportedWidth(12));
        assert!(Quantizer::new(32).is_ok());
    }

    #[test]
    fn test_integer_tensor_passes_through() {
        let q = Quantizer::new(8).unwrap();
        let t = Tensor { shape: vec![2], data: TensorData::I16(vec![1000, -1000]) };
        assert_eq!(q.quantize_tensor(&t, 6, RoundMode::Floor).unwrap(), t);
    }

    fn graph_with_dense(q: Quantization) -> Graph {
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 2])).unwrap();
        let fc = g
            .insert(
                LayerSpec::new(
                    "fc",
                    LayerKind::Dense(Dense {
                        units: 1,
                        activation: Activation::Linear,
                        kernel: Tensor::from_f32(vec![1, 2], vec![0.5, -0.25]),
                        bias: Some(Tensor::vector(vec![1.0])),
                    }),
                    vec![vec![1, 2]],
                    vec![vec![1, 1]],
                ),
                &[x],
                &[],
            )
            .unwrap();
        g.node_mut(x).q = Some(q.clone());
        g.node_mut(fc).q = Some(q);
        g
    }

    fn int8_q() -> Quantization {
        Quantization {
            kind: NumberKind::Integer,
            width: 8,
            long_width: 16,
            weights_scale_factor: Some(4),
            bias_scale_factor: Some(2),
            output_scale_factor: Some(4),
            weights_round_mode: Some(RoundMode::Floor),
            output_round_mode: Some(RoundMode::Floor),
        }
    }

    #[test]
    fn test_quantize_graph_uses_bias_scale_factor() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = graph_with_dense(int8_q());
        quantize_graph(&mut g, &session).unwrap();

        let fc = g.node(g.find("fc").unwrap());
        let weights = fc.spec.weights();
        assert_eq!(weights[0].1.data, TensorData::I8(vec![8, -4]));
        assert_eq!(weights[1].1.data, TensorData::I8(vec![4]));
        assert_eq!(session.stats().tensors_quantized, 2);
        assert_eq!(session.number_types().len(), 2);
    }

    #[test]
    fn test_quantize_graph_requires_metadata() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut q = int8_q();
        q.weights_round_mode = None;
        let mut g = graph_with_dense(q);
        let err = quantize_graph(&mut g, &session).unwrap_err();
        assert_eq!(err.layer(), Some("fc"));

        let mut g = graph_with_dense(int8_q());
        let fc = g.find("fc").unwrap();
        g.node_mut(fc).q = None;
        assert!(quantize_graph(&mut g, &session).is_err());
    }

    #[test]
    fn test_float_layers_are_untouched() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = graph_with_dense(Quantization::float(32, 32));
        quantize_graph(&mut g, &session).unwrap();
        let fc = g.node(g.find("fc").unwrap());
        assert!(!fc.spec.weights()[0].1.is_integer());
    }
}
