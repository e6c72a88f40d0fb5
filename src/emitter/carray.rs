// Conversion of parameter tensors to C array definitions. Float values are written in C99
// hexadecimal floating point notation so the generated weights are bit-exact with the values
// held by the compiler; integer values are written verbatim. Initializers are nested one brace
// level per tensor dimension, matching the multi-dimensional array types the layer functions
// declare for their parameters.

//! Tensors as C array initializers.

use crate::core::number::ctype;
use crate::core::NumberKind;
use crate::graph::{Tensor, TensorData};

/// A named constant array ready to be written into a weights file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CArray {
    /// Full C identifier, `<layer>_<role>`.
    pub name: String,
    pub role: &'static str,
    pub ctype: String,
    pub dims: Vec<usize>,
    pub initializer: String,
}

impl CArray {
    pub fn from_tensor(layer: &str, role: &'static str, tensor: &Tensor) -> Self {
        Self {
            name: format!("{layer}_{role}"),
            role,
            ctype: tensor_ctype(tensor),
            dims: tensor.shape.clone(),
            initializer: initializer(tensor),
        }
    }

    /// `[d0][d1]...` suffix of the declaration.
    pub fn dims_suffix(&self) -> String {
        self.dims.iter().map(|d| format!("[{d}]")).collect()
    }

    /// Full `const` definition, terminated by a semicolon.
    pub fn definition(&self) -> String {
        format!("const {} {}{} = {};", self.ctype, self.name, self.dims_suffix(), self.initializer)
    }
}

fn tensor_ctype(tensor: &Tensor) -> String {
    match tensor.data {
        TensorData::F32(_) => ctype(NumberKind::Float, 32),
        TensorData::I8(_) => ctype(NumberKind::Integer, 8),
        TensorData::I16(_) => ctype(NumberKind::Integer, 16),
        TensorData::I32(_) => ctype(NumberKind::Integer, 32),
    }
}

/// Nested brace initializer for `tensor`.
pub fn initializer(tensor: &Tensor) -> String {
    let values: Vec<String> = match &tensor.data {
        TensorData::F32(v) => v.iter().map(|&x| hex_float(x)).collect(),
        TensorData::I8(v) => v.iter().map(ToString::to_string).collect(),
        TensorData::I16(v) => v.iter().map(ToString::to_string).collect(),
        TensorData::I32(v) => v.iter().map(ToString::to_string).collect(),
    };
    let mut out = String::new();
    nest(&tensor.shape, &values, 0, &mut out);
    out
}

fn nest(shape: &[usize], values: &[String], depth: usize, out: &mut String) {
    let Some((&outer, inner)) = shape.split_first() else {
        out.push_str(values.first().map_or("0", String::as_str));
        return;
    };
    if inner.is_empty() {
        out.push('{');
        out.push_str(&values.join(", "));
        out.push('}');
        return;
    }
    let stride: usize = inner.iter().product();
    let indent = "  ".repeat(depth + 1);
    out.push_str("{\n");
    for i in 0..outer {
        out.push_str(&indent);
        nest(inner, &values[i * stride..(i + 1) * stride], depth + 1, out);
        if i + 1 < outer {
            out.push(',');
        }
        out.push('\n');
    }
    out.push_str(&"  ".repeat(depth));
    out.push('}');
}

/// C99 hexadecimal spelling of an f32, e.g. `0x1.8p+0` for 1.5.
pub fn hex_float(value: f32) -> String {
    if value.is_nan() {
        return "NAN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "INFINITY" } else { "-INFINITY" }.to_string();
    }
    let bits = value.to_bits();
    let sign = if bits >> 31 == 1 { "-" } else { "" };
    let biased = ((bits >> 23) & 0xff) as i32;
    let mut mantissa = bits & 0x7f_ffff;
    if biased == 0 && mantissa == 0 {
        return format!("{sign}0x0p+0");
    }

    let mut exponent = biased - 127;
    if biased == 0 {
        // Subnormal: normalize so the leading one is implicit again.
        exponent = -126;
        while mantissa & 0x80_0000 == 0 {
            mantissa <<= 1;
            exponent -= 1;
        }
        mantissa &= 0x7f_ffff;
    }

    let digits = format!("{:06x}", mantissa << 1);
    let digits = digits.trim_end_matches('0');
    if digits.is_empty() {
        format!("{sign}0x1p{exponent:+}")
    } else {
        format!("{sign}0x1.{digits}p{exponent:+}")
    }
}
