// This module defines the layer vocabulary of the IR. A LayerSpec is a shared header (name,
// input shapes, output shapes, output element type) plus a closed LayerKind enum with one
// variant per supported layer. Every capability question the passes ask ("does this layer
// carry an activation?", "can it absorb padding?", "does it overwrite its input buffer?",
// "which weight tensors does it own?") is answered by an exhaustive match here, so adding a
// variant forces every query to be revisited. Batch-norm parameters are folded into a
// per-channel kernel and bias when the layer is built.

//! Layer specifications.

use std::fmt;
use std::str::FromStr;

use super::tensor::Tensor;

/// Ordered tuple of dimensions, batch dimension first.
pub type Shape = Vec<usize>;

/// Element type of a layer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Float32,
    Int8,
    Int16,
    Int32,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::Float32 => "float32",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
        };
        f.write_str(s)
    }
}

/// Activation function applied to a layer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Linear,
    Relu,
    Relu6,
    Softmax,
    /// Spiking integrate-and-fire activation. Parsed, never compiled.
    If,
}

impl Activation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Relu6 => "relu6",
            Activation::Softmax => "softmax",
            Activation::If => "if",
        }
    }

    /// Activation equivalent to applying `self` then `outer`.
    ///
    /// Only the clipping activations compose; anything involving softmax or
    /// a spiking activation yields `None`.
    pub fn compose(self, outer: Activation) -> Option<Activation> {
        use Activation::*;
        match (self, outer) {
            (Linear, f) | (f, Linear) => Some(f),
            (Relu, Relu) => Some(Relu),
            (Relu6, Relu6) | (Relu, Relu6) | (Relu6, Relu) => Some(Relu6),
            _ => None,
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "relu6" => Ok(Activation::Relu6),
            "softmax" => Ok(Activation::Softmax),
            "if" => Ok(Activation::If),
            other => Err(format!("unknown activation '{other}'")),
        }
    }
}

/// Sample normalization flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleNormMode {
    MinMax,
    ZScore,
}

/// One `start:stop:step` range of a slice layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    pub start: usize,
    pub stop: usize,
    pub step: usize,
}

/// Convolution parameters shared by the 1D and 2D variants.
///
/// Kernel layout is `[filters, kernel dims..., in_channels / groups]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv {
    pub filters: usize,
    pub kernel_size: Vec<usize>,
    pub strides: Vec<usize>,
    pub groups: usize,
    /// `(before, after)` zero padding per spatial dimension.
    pub padding: Vec<(usize, usize)>,
    pub activation: Activation,
    pub kernel: Tensor,
    pub bias: Option<Tensor>,
}

/// Fully connected layer. Kernel layout is `[units, inputs]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    pub units: usize,
    pub activation: Activation,
    pub kernel: Tensor,
    pub bias: Option<Tensor>,
}

/// Pooling window parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Pool {
    pub pool_size: Vec<usize>,
    pub strides: Vec<usize>,
    pub activation: Activation,
}

/// Batch normalization folded to a per-channel affine transform.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNorm {
    pub activation: Activation,
    pub kernel: Tensor,
    pub bias: Tensor,
}

impl BatchNorm {
    /// Fold the running statistics into `kernel * x + bias`.
    ///
    /// Returns `None` when the four statistics do not have the same length.
    pub fn from_statistics(
        gamma: &[f32],
        beta: &[f32],
        mean: &[f32],
        variance: &[f32],
        epsilon: f32,
        activation: Activation,
    ) -> Option<Self> {
        let channels = gamma.len();
        if beta.len() != channels || mean.len() != channels || variance.len() != channels {
            return None;
        }
        let (kernel, bias): (Vec<f32>, Vec<f32>) = gamma
            .iter()
            .zip(beta)
            .zip(mean.iter().zip(variance))
            .map(|((&g, &b), (&m, &v))| {
                let stdev = (v + epsilon).sqrt();
                (g / stdev, b - g * m / stdev)
            })
            .unzip();
        Some(Self { activation, kernel: Tensor::vector(kernel), bias: Tensor::vector(bias) })
    }
}

/// The closed set of layer kinds understood by the compiler.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    Input,
    Conv1D(Conv),
    Conv2D(Conv),
    Dense(Dense),
    MaxPool1D(Pool),
    MaxPool2D(Pool),
    AvgPool1D(Pool),
    AvgPool2D(Pool),
    BatchNorm1D(BatchNorm),
    BatchNorm2D(BatchNorm),
    Activation(Activation),
    Add { activation: Activation },
    Flatten,
    Dropout { rate: f32 },
    Identity,
    ZeroPadding1D { padding: Vec<(usize, usize)> },
    ZeroPadding2D { padding: Vec<(usize, usize)> },
    Concatenate { axis: isize },
    Slice { slices: Vec<SliceRange> },
    Sum { dims: Vec<isize> },
    SampleNorm { mode: SampleNormMode },
    Permute { dims: Vec<usize> },
    Upsample { scale_factor: Vec<usize> },
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Input => "Input",
            LayerKind::Conv1D(_) => "Conv1D",
            LayerKind::Conv2D(_) => "Conv2D",
            LayerKind::Dense(_) => "Dense",
            LayerKind::MaxPool1D(_) => "MaxPool1D",
            LayerKind::MaxPool2D(_) => "MaxPool2D",
            LayerKind::AvgPool1D(_) => "AvgPool1D",
            LayerKind::AvgPool2D(_) => "AvgPool2D",
            LayerKind::BatchNorm1D(_) => "BatchNorm1D",
            LayerKind::BatchNorm2D(_) => "BatchNorm2D",
            LayerKind::Activation(_) => "Activation",
            LayerKind::Add { .. } => "Add",
            LayerKind::Flatten => "Flatten",
            LayerKind::Dropout { .. } => "Dropout",
            LayerKind::Identity => "Identity",
            LayerKind::ZeroPadding1D { .. } => "ZeroPadding1D",
            LayerKind::ZeroPadding2D { .. } => "ZeroPadding2D",
            LayerKind::Concatenate { .. } => "Concatenate",
            LayerKind::Slice { .. } => "Slice",
            LayerKind::Sum { .. } => "Sum",
            LayerKind::SampleNorm { .. } => "SampleNorm",
            LayerKind::Permute { .. } => "Permute",
            LayerKind::Upsample { .. } => "Upsample",
        }
    }
}

/// A layer: shared header plus kind-specific parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub name: String,
    pub input_shapes: Vec<Shape>,
    pub output_shapes: Vec<Shape>,
    pub output_dtype: DType,
    pub kind: LayerKind,
}

impl LayerSpec {
    /// New float32 layer.
    pub fn new(
        name: impl Into<String>,
        kind: LayerKind,
        input_shapes: Vec<Shape>,
        output_shapes: Vec<Shape>,
    ) -> Self {
        Self {
            name: name.into(),
            input_shapes,
            output_shapes,
            output_dtype: DType::Float32,
            kind,
        }
    }

    /// Graph input producing `shape`.
    pub fn input(name: impl Into<String>, shape: Shape) -> Self {
        Self::new(name, LayerKind::Input, vec![shape.clone()], vec![shape])
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, LayerKind::Input)
    }

    /// First output shape, or an empty shape for malformed layers.
    pub fn output_shape(&self) -> &[usize] {
        self.output_shapes.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of elements in the first output, batch dimension excluded.
    pub fn output_elements(&self) -> usize {
        self.output_shape().iter().skip(1).product()
    }

    /// Weight tensors by role, kernel first.
    pub fn weights(&self) -> Vec<(&'static str, &Tensor)> {
        let mut w = Vec::new();
        match &self.kind {
            LayerKind::Conv1D(c) | LayerKind::Conv2D(c) => {
                w.push(("kernel", &c.kernel));
                if let Some(b) = &c.bias {
                    w.push(("bias", b));
                }
            }
            LayerKind::Dense(d) => {
                w.push(("kernel", &d.kernel));
                if let Some(b) = &d.bias {
                    w.push(("bias", b));
                }
            }
            LayerKind::BatchNorm1D(bn) | LayerKind::BatchNorm2D(bn) => {
                w.push(("kernel", &bn.kernel));
                w.push(("bias", &bn.bias));
            }
            _ => {}
        }
        w
    }

    pub fn weights_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        let mut w = Vec::new();
        match &mut self.kind {
            LayerKind::Conv1D(c) | LayerKind::Conv2D(c) => {
                w.push(("kernel", &mut c.kernel));
                if let Some(b) = &mut c.bias {
                    w.push(("bias", b));
                }
            }
            LayerKind::Dense(d) => {
                w.push(("kernel", &mut d.kernel));
                if let Some(b) = &mut d.bias {
                    w.push(("bias", b));
                }
            }
            LayerKind::BatchNorm1D(bn) | LayerKind::BatchNorm2D(bn) => {
                w.push(("kernel", &mut bn.kernel));
                w.push(("bias", &mut bn.bias));
            }
            _ => {}
        }
        w
    }

    pub fn has_weights(&self) -> bool {
        self.weights().iter().any(|(_, t)| !t.is_empty())
    }

    /// Declared activation, for kinds that carry one.
    pub fn activation(&self) -> Option<Activation> {
        match &self.kind {
            LayerKind::Conv1D(c) | LayerKind::Conv2D(c) => Some(c.activation),
            LayerKind::Dense(d) => Some(d.activation),
            LayerKind::MaxPool1D(p)
            | LayerKind::MaxPool2D(p)
            | LayerKind::AvgPool1D(p)
            | LayerKind::AvgPool2D(p) => Some(p.activation),
            LayerKind::BatchNorm1D(bn) | LayerKind::BatchNorm2D(bn) => Some(bn.activation),
            LayerKind::Add { activation } => Some(*activation),
            LayerKind::Activation(a) => Some(*a),
            LayerKind::Input
            | LayerKind::Flatten
            | LayerKind::Dropout { .. }
            | LayerKind::Identity
            | LayerKind::ZeroPadding1D { .. }
            | LayerKind::ZeroPadding2D { .. }
            | LayerKind::Concatenate { .. }
            | LayerKind::Slice { .. }
            | LayerKind::Sum { .. }
            | LayerKind::SampleNorm { .. }
            | LayerKind::Permute { .. }
            | LayerKind::Upsample { .. } => None,
        }
    }

    /// Activation field a following standalone activation can be merged into.
    pub fn fusable_activation_mut(&mut self) -> Option<&mut Activation> {
        match &mut self.kind {
            LayerKind::Conv1D(c) | LayerKind::Conv2D(c) => Some(&mut c.activation),
            LayerKind::Dense(d) => Some(&mut d.activation),
            LayerKind::MaxPool1D(p)
            | LayerKind::MaxPool2D(p)
            | LayerKind::AvgPool1D(p)
            | LayerKind::AvgPool2D(p) => Some(&mut p.activation),
            LayerKind::BatchNorm1D(bn) | LayerKind::BatchNorm2D(bn) => Some(&mut bn.activation),
            LayerKind::Add { activation } => Some(activation),
            LayerKind::Activation(_)
            | LayerKind::Input
            | LayerKind::Flatten
            | LayerKind::Dropout { .. }
            | LayerKind::Identity
            | LayerKind::ZeroPadding1D { .. }
            | LayerKind::ZeroPadding2D { .. }
            | LayerKind::Concatenate { .. }
            | LayerKind::Slice { .. }
            | LayerKind::Sum { .. }
            | LayerKind::SampleNorm { .. }
            | LayerKind::Permute { .. }
            | LayerKind::Upsample { .. } => None,
        }
    }

    /// Padding field and its spatial rank, for kinds that can absorb padding.
    pub fn padding_mut(&mut self) -> Option<(usize, &mut Vec<(usize, usize)>)> {
        match &mut self.kind {
            LayerKind::Conv1D(c) => Some((1, &mut c.padding)),
            LayerKind::Conv2D(c) => Some((2, &mut c.padding)),
            _ => None,
        }
    }

    /// Explicit zero padding carried by a padding layer, with its rank.
    pub fn zero_padding(&self) -> Option<(usize, &[(usize, usize)])> {
        match &self.kind {
            LayerKind::ZeroPadding1D { padding } => Some((1, padding)),
            LayerKind::ZeroPadding2D { padding } => Some((2, padding)),
            _ => None,
        }
    }

    /// True for layers that write their output over their input buffer.
    pub fn overwrites_input(&self) -> bool {
        matches!(self.kind, LayerKind::Flatten)
    }
}
