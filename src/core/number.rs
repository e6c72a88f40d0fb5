//! Numeric representation metadata.
//!
//! A layer computes either in floating point or in fixed point on signed
//! integers of a given width, accumulating intermediate results in a wider
//! "long" type. Scale factors are power-of-two exponents: a fixed-point value
//! `q` with scale factor `s` stands for `q / 2^s`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Arithmetic used by a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NumberKind {
    Integer,
    Float,
}

/// Rounding policy applied when a value is rescaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundMode {
    /// Sentinel meaning "no rounding configured".
    None,
    Floor,
    Nearest,
}

impl RoundMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundMode::None => "none",
            RoundMode::Floor => "floor",
            RoundMode::Nearest => "nearest",
        }
    }
}

impl fmt::Display for RoundMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoundMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(RoundMode::None),
            "floor" => Ok(RoundMode::Floor),
            "nearest" => Ok(RoundMode::Nearest),
            other => Err(format!("unknown round mode '{other}', expected none, floor or nearest")),
        }
    }
}

/// Per-node quantization record.
///
/// Populated wholesale by [`crate::calibration::annotate`]; afterwards only
/// the optimizer's activation fusion touches the output fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quantization {
    pub kind: NumberKind,
    pub width: u32,
    pub long_width: u32,
    pub weights_scale_factor: Option<i32>,
    pub bias_scale_factor: Option<i32>,
    pub output_scale_factor: Option<i32>,
    pub weights_round_mode: Option<RoundMode>,
    pub output_round_mode: Option<RoundMode>,
}

impl Quantization {
    /// Float record used when no fixed-point quantization is requested.
    pub fn float(width: u32, long_width: u32) -> Self {
        Self {
            kind: NumberKind::Float,
            width,
            long_width,
            weights_scale_factor: Some(0),
            bias_scale_factor: None,
            output_scale_factor: Some(0),
            weights_round_mode: None,
            output_round_mode: None,
        }
    }

    pub fn is_integer(&self) -> bool {
        self.kind == NumberKind::Integer
    }

    /// Concrete numeric type described by this record.
    pub fn number_type(&self) -> NumberType {
        NumberType::new(self.kind, self.width, self.long_width)
    }

    /// Scale factor used for the bias tensor.
    pub fn effective_bias_scale_factor(&self) -> Option<i32> {
        self.bias_scale_factor.or(self.weights_scale_factor)
    }
}

/// A concrete numeric type the generated code must declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NumberType {
    pub kind: NumberKind,
    pub width: u32,
    pub long_width: u32,
    pub min: i64,
    pub max: i64,
}

impl NumberType {
    pub fn new(kind: NumberKind, width: u32, long_width: u32) -> Self {
        let (min, max) = signed_bounds(width);
        Self { kind, width, long_width, min, max }
    }

    /// C type for values of this number type.
    pub fn ctype(&self) -> String {
        ctype(self.kind, self.width)
    }

    /// C type for accumulators of this number type.
    pub fn long_ctype(&self) -> String {
        ctype(self.kind, self.long_width)
    }
}

/// Bounds of a two's complement integer of `width` bits.
pub fn signed_bounds(width: u32) -> (i64, i64) {
    let width = width.clamp(1, 64);
    if width == 64 {
        return (i64::MIN, i64::MAX);
    }
    (-(1i64 << (width - 1)), (1i64 << (width - 1)) - 1)
}

/// C spelling of a numeric kind and width (`int16_t`, `float`, ...).
pub fn ctype(kind: NumberKind, width: u32) -> String {
    match kind {
        NumberKind::Integer => format!("int{width}_t"),
        NumberKind::Float if width > 32 => "double".to_string(),
        NumberKind::Float => "float".to_string(),
    }
}

/// Ordered set of distinct numeric types seen during one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberTypes {
    types: BTreeSet<NumberType>,
}

impl NumberTypes {
    /// New accumulator, seeded with the 32-bit integer type the runtime
    /// conversion helpers rely on.
    pub fn new() -> Self {
        let mut types = BTreeSet::new();
        types.insert(NumberType::new(NumberKind::Integer, 32, 64));
        Self { types }
    }

    /// Record a type. Returns true if it was not present yet.
    pub fn insert(&mut self, ty: NumberType) -> bool {
        self.types.insert(ty)
    }

    pub fn contains(&self, ty: &NumberType) -> bool {
        self.types.contains(ty)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NumberType> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for NumberTypes {
    fn default() -> Self {
        Self::new()
    }
}

/// Quantization mode requested for a whole model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantMode {
    Float32,
    Int16,
    Int8,
}

impl QuantMode {
    pub fn kind(&self) -> NumberKind {
        match self {
            QuantMode::Float32 => NumberKind::Float,
            QuantMode::Int16 | QuantMode::Int8 => NumberKind::Integer,
        }
    }

    pub fn width(&self) -> u32 {
        match self {
            QuantMode::Float32 => 32,
            QuantMode::Int16 => 16,
            QuantMode::Int8 => 8,
        }
    }

    /// Accumulator width. int8 accumulates on 16 bits.
    pub fn long_width(&self) -> u32 {
        match self {
            QuantMode::Float32 => 32,
            QuantMode::Int16 => 32,
            QuantMode::Int8 => 16,
        }
    }
}

impl fmt::Display for QuantMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuantMode::Float32 => "float32",
            QuantMode::Int16 => "int16",
            QuantMode::Int8 => "int8",
        };
        f.write_str(s)
    }
}

impl FromStr for QuantMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float32" => Ok(QuantMode::Float32),
            "int16" => Ok(QuantMode::Int16),
            "int8" => Ok(QuantMode::Int8),
            other => Err(format!(
                "only float32, int8 or int16 quantization is supported, got '{other}'"
            )),
        }
    }
}
