// This file implements CTemplates, the template engine shipped with the compiler. It renders
// freestanding C99 for every template the emitter asks for. Layer implementations are
// `static inline` functions whose constants are passed through `#define`s that are undefined
// again at the end of the file, so that all layers can be concatenated into one translation
// unit. Fixed-point arithmetic goes through the `scale`, `clamp_to` and `scale_and_clamp_to`
// macros of the numeric types header; for float layers those helpers are identities, so the
// same loop nests serve both number kinds.

//! Built-in C templates.

use std::fmt;

use super::{render_error, Bindings, TemplateEngine, TemplateId};
use crate::core::{CompileError, CompileResult, NumberKind, NumberType, NumberTypes, Quantization, RoundMode};
use crate::graph::{Activation, BatchNorm, Conv, Dense, Graph, LayerKind, Node, Pool, SampleNormMode, SliceRange};

/// Renders plain C for every template.
#[derive(Debug, Clone, Copy, Default)]
pub struct CTemplates;

impl TemplateEngine for CTemplates {
    fn render(&self, template: &TemplateId, bindings: &Bindings<'_>) -> CompileResult<String> {
        match template {
            TemplateId::LayerHeader(_) => layer_header(&Layer::bind(template, bindings)?),
            TemplateId::LayerSource(_) => layer_source(&Layer::bind(template, bindings)?),
            TemplateId::LayerWeights(_) => {
                let layer = Layer::bind(template, bindings)?;
                Ok(layer_weights(&layer, bindings))
            }
            TemplateId::Defines => Ok(defines(bindings)),
            TemplateId::NumericTypes => Ok(numeric_types(bindings.number_types)),
            TemplateId::ModelHeader => model_header(template, bindings),
            TemplateId::Model => model(template, bindings),
        }
    }
}

/// Line-oriented writer with indentation.
struct Code {
    out: String,
    depth: usize,
}

impl Code {
    fn new() -> Self {
        Self { out: String::new(), depth: 0 }
    }

    fn line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if !text.is_empty() {
            for _ in 0..self.depth {
                self.out.push_str("  ");
            }
            self.out.push_str(text);
        }
        self.out.push('\n');
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }

    fn open(&mut self, text: impl AsRef<str>) {
        self.line(text);
        self.depth += 1;
    }

    fn close(&mut self, text: impl AsRef<str>) {
        self.depth = self.depth.saturating_sub(1);
        self.line(text);
    }

    fn finish(self) -> String {
        self.out
    }
}

/// Macros defined at the top of a layer file and undefined at its end.
#[derive(Default)]
struct Macros(Vec<(String, String)>);

impl Macros {
    fn define(&mut self, name: &str, value: impl fmt::Display) {
        self.0.push((name.to_string(), value.to_string()));
    }

    fn write_defines(&self, code: &mut Code) {
        for (name, value) in &self.0 {
            code.line(format!("#define {name} {value}"));
        }
    }

    fn write_undefs(&self, code: &mut Code) {
        for (name, _) in self.0.iter().rev() {
            code.line(format!("#undef {name}"));
        }
    }
}

/// `[d1][d2]...` for a shape, batch dimension excluded.
fn dims(shape: &[usize]) -> String {
    shape.iter().skip(1).map(|d| format!("[{d}]")).collect()
}

/// Element count of a shape, batch dimension excluded.
fn elements(shape: &[usize]) -> usize {
    shape.iter().skip(1).product()
}

fn round_mode_macro(mode: Option<RoundMode>) -> String {
    format!("ROUND_MODE_{}", mode.unwrap_or(RoundMode::None).as_str().to_uppercase())
}

fn guard(name: &str) -> String {
    format!("_{}_H_", name.to_uppercase())
}

/// A layer bound to a per-layer template.
struct Layer<'a> {
    template: TemplateId,
    node: &'a Node,
    q: &'a Quantization,
    preds: Vec<&'a Node>,
}

impl<'a> Layer<'a> {
    fn bind(template: &TemplateId, bindings: &Bindings<'a>) -> CompileResult<Self> {
        let node = bindings.node(template)?;
        let q = node
            .q
            .as_ref()
            .ok_or_else(|| render_error(template, format!("{}: no quantization information", node.name())))?;
        let preds = node.preds().iter().map(|&p| bindings.graph.node(p)).collect();
        Ok(Self { template: *template, node, q, preds })
    }

    fn name(&self) -> &'a str {
        self.node.name()
    }

    fn error(&self, reason: impl fmt::Display) -> CompileError {
        render_error(&self.template, format!("{}: {reason}", self.name()))
    }

    fn input_shape(&self, i: usize) -> CompileResult<&'a [usize]> {
        self.node
            .spec
            .input_shapes
            .get(i)
            .map(Vec::as_slice)
            .ok_or_else(|| self.error(format!("no shape for input {i}")))
    }

    /// Input shape `i`, which must have `rank` dimensions including batch.
    fn input_of_rank(&self, i: usize, rank: usize) -> CompileResult<&'a [usize]> {
        let shape = self.input_shape(i)?;
        if shape.len() != rank {
            return Err(self.error(format!("expected a rank {rank} input, got {shape:?}")));
        }
        Ok(shape)
    }

    fn output_of_rank(&self, rank: usize) -> CompileResult<&'a [usize]> {
        let shape = self.node.spec.output_shape();
        if shape.len() != rank {
            return Err(self.error(format!("expected a rank {rank} output, got {shape:?}")));
        }
        Ok(shape)
    }

    fn input_scale_factor(&self, i: usize) -> i32 {
        self.preds
            .get(i)
            .and_then(|p| p.q.as_ref())
            .and_then(|q| q.output_scale_factor)
            .unwrap_or(0)
    }

    fn number_macros(&self, macros: &mut Macros) {
        let ty = self.q.number_type();
        macros.define("INPUT_SCALE_FACTOR", self.input_scale_factor(0));
        macros.define("OUTPUT_SCALE_FACTOR", self.q.output_scale_factor.unwrap_or(0));
        macros.define("OUTPUT_ROUND_MODE", round_mode_macro(self.q.output_round_mode));
        macros.define("NUMBER_T", ty.ctype());
        macros.define("LONG_NUMBER_T", ty.long_ctype());
    }

    fn weights_macros(&self, macros: &mut Macros) {
        let weights = self.q.weights_scale_factor.unwrap_or(0);
        let tmp = match self.q.bias_scale_factor {
            Some(bias) => weights.max(bias),
            None => weights,
        };
        macros.define("WEIGHTS_SCALE_FACTOR", weights);
        macros.define("BIASES_SCALE_FACTOR", self.q.effective_bias_scale_factor().unwrap_or(0));
        macros.define("TMP_SCALE_FACTOR", tmp);
    }

    fn open_function(&self, code: &mut Code, params: &[String]) {
        code.open(format!("static inline void {}(", self.name()));
        for param in params {
            code.line(format!("{param},"));
        }
        code.line(format!("{}_output_type output) {{", self.name()));
        code.depth = 1;
    }

    /// Assemble the layer file around a function body.
    fn source(&self, macros: &Macros, body: Code) -> String {
        let mut code = Code::new();
        code.line(format!("/* {} layer {} */", self.node.spec.kind.name(), self.name()));
        code.blank();
        code.line("#ifndef SINGLE_FILE");
        code.line("#include \"number.h\"");
        code.line(format!("#include \"{}.h\"", self.name()));
        code.line("#endif");
        code.blank();
        macros.write_defines(&mut code);
        code.blank();
        code.out.push_str(&body.finish());
        code.blank();
        macros.write_undefs(&mut code);
        code.finish()
    }
}

/// Store `output_acc`, held with scale factor `acc_scale`, into `dst`.
fn store(code: &mut Code, layer: &Layer<'_>, activation: Activation, dst: &str, acc_scale: &str) -> CompileResult<()> {
    let stored = format!(
        "{dst} = scale_and_clamp_to(NUMBER_T, output_acc, {acc_scale} - OUTPUT_SCALE_FACTOR, OUTPUT_ROUND_MODE);"
    );
    match activation {
        Activation::Linear => code.line(stored),
        Activation::Relu | Activation::Relu6 => {
            code.open("if (output_acc < 0) {");
            code.line(format!("{dst} = 0;"));
            code.close("} else {");
            code.depth += 1;
            if activation == Activation::Relu6 {
                let six = format!("scale(NUMBER_T, 6, -({acc_scale}), OUTPUT_ROUND_MODE)");
                code.open(format!("if (output_acc > {six}) {{"));
                code.line(format!("output_acc = {six};"));
                code.close("}");
            }
            code.line(stored);
            code.close("}");
        }
        other => return Err(layer.error(format!("activation {other} cannot be generated inline"))),
    }
    Ok(())
}

/// Rescale a kernel product with its bias and store it.
fn store_weighted(
    code: &mut Code,
    layer: &Layer<'_>,
    activation: Activation,
    has_bias: bool,
    bias_index: &str,
    dst: &str,
) -> CompileResult<()> {
    code.line("output_acc = scale(NUMBER_T, output_acc, WEIGHTS_SCALE_FACTOR - TMP_SCALE_FACTOR, OUTPUT_ROUND_MODE);");
    if has_bias {
        code.line(format!(
            "output_acc += scale(NUMBER_T, (LONG_NUMBER_T)bias[{bias_index}], \
             BIASES_SCALE_FACTOR - TMP_SCALE_FACTOR - INPUT_SCALE_FACTOR, OUTPUT_ROUND_MODE);"
        ));
    }
    store(code, layer, activation, dst, "INPUT_SCALE_FACTOR + TMP_SCALE_FACTOR")
}

/// Store a real value computed in double precision.
fn store_real(code: &mut Code, q: &Quantization, dst: &str, value: &str) {
    if q.is_integer() {
        code.line(format!(
            "{dst} = clamp_to(NUMBER_T, (LONG_NUMBER_T)floor(ldexp({value}, OUTPUT_SCALE_FACTOR)));"
        ));
    } else {
        code.line(format!("{dst} = (NUMBER_T)({value});"));
    }
}

fn layer_header(layer: &Layer<'_>) -> CompileResult<String> {
    let name = layer.name();
    let mut code = Code::new();
    code.line(format!("#ifndef {}", guard(name)));
    code.line(format!("#define {}", guard(name)));
    code.blank();
    code.line("#ifndef SINGLE_FILE");
    code.line("#include \"number.h\"");
    code.line("#endif");
    code.blank();
    code.line(format!(
        "typedef {} {name}_output_type{};",
        layer.q.number_type().ctype(),
        dims(layer.node.spec.output_shape())
    ));
    code.blank();
    code.line(format!("#endif // {}", guard(name)));
    Ok(code.finish())
}

fn layer_weights(layer: &Layer<'_>, bindings: &Bindings<'_>) -> String {
    let mut code = Code::new();
    code.line(format!("/* {} weights */", layer.name()));
    code.blank();
    code.line("#ifndef SINGLE_FILE");
    code.line("#include \"number.h\"");
    code.line("#endif");
    for array in &bindings.weights {
        code.blank();
        code.line(array.definition());
    }
    code.finish()
}

fn layer_source(layer: &Layer<'_>) -> CompileResult<String> {
    match &layer.node.spec.kind {
        LayerKind::Dense(dense) => fc(layer, dense),
        LayerKind::Conv1D(conv) => conv1d(layer, conv),
        LayerKind::Conv2D(conv) => conv2d(layer, conv),
        LayerKind::MaxPool1D(pool) => pool1d(layer, pool, true),
        LayerKind::AvgPool1D(pool) => pool1d(layer, pool, false),
        LayerKind::MaxPool2D(pool) => pool2d(layer, pool, true),
        LayerKind::AvgPool2D(pool) => pool2d(layer, pool, false),
        LayerKind::BatchNorm1D(bn) | LayerKind::BatchNorm2D(bn) => batchnorm(layer, bn),
        LayerKind::Activation(Activation::Softmax) => softmax(layer),
        LayerKind::Activation(activation) => activation_layer(layer, *activation),
        LayerKind::Add { activation } => add(layer, *activation),
        LayerKind::Flatten => flatten(layer),
        LayerKind::Sum { .. } => sum(layer),
        LayerKind::Concatenate { axis } => concatenate(layer, *axis),
        LayerKind::Slice { slices } => slice(layer, slices),
        LayerKind::SampleNorm { mode } => samplenorm(layer, *mode),
        LayerKind::Permute { dims } => permute(layer, dims),
        LayerKind::Upsample { .. } => upsample(layer),
        other => Err(layer.error(format!("no implementation template for {}", other.name()))),
    }
}

fn fc(layer: &Layer<'_>, dense: &Dense) -> CompileResult<String> {
    let input = layer.input_of_rank(0, 2)?;
    let mut m = Macros::default();
    m.define("INPUT_SAMPLES", input[1]);
    m.define("FC_UNITS", dense.units);
    layer.weights_macros(&mut m);
    layer.number_macros(&mut m);

    let mut params = vec![
        "const NUMBER_T input[INPUT_SAMPLES]".to_string(),
        "const NUMBER_T kernel[FC_UNITS][INPUT_SAMPLES]".to_string(),
    ];
    if dense.bias.is_some() {
        params.push("const NUMBER_T bias[FC_UNITS]".to_string());
    }

    let mut code = Code::new();
    layer.open_function(&mut code, &params);
    code.line("int k, z;");
    code.line("LONG_NUMBER_T output_acc;");
    code.blank();
    code.open("for (k = 0; k < FC_UNITS; k++) {");
    code.line("output_acc = 0;");
    code.open("for (z = 0; z < INPUT_SAMPLES; z++) {");
    code.line("output_acc += (LONG_NUMBER_T)kernel[k][z] * (LONG_NUMBER_T)input[z];");
    code.close("}");
    code.blank();
    store_weighted(&mut code, layer, dense.activation, dense.bias.is_some(), "k", "output[k]")?;
    code.close("}");
    code.close("}");
    Ok(layer.source(&m, code))
}

fn conv1d(layer: &Layer<'_>, conv: &Conv) -> CompileResult<String> {
    let input = layer.input_of_rank(0, 3)?;
    let output = layer.output_of_rank(3)?;
    let groups = conv.groups.max(1);
    let (left, right) = conv.padding.first().copied().unwrap_or((0, 0));

    let mut m = Macros::default();
    m.define("INPUT_CHANNELS", input[2]);
    m.define("INPUT_SAMPLES", input[1]);
    m.define("CONV_FILTERS", conv.filters);
    m.define("CONV_KERNEL_SIZE", conv.kernel_size.first().copied().unwrap_or(1));
    m.define("CONV_STRIDE", conv.strides.first().copied().unwrap_or(1));
    m.define("CONV_GROUPS", groups);
    m.define("CHANNELS_PER_GROUP", "(INPUT_CHANNELS / CONV_GROUPS)");
    m.define("FILTERS_PER_GROUP", "(CONV_FILTERS / CONV_GROUPS)");
    m.define("ZEROPADDING_LEFT", left);
    m.define("ZEROPADDING_RIGHT", right);
    m.define("CONV_OUTSAMPLES", output[1]);
    layer.weights_macros(&mut m);
    layer.number_macros(&mut m);

    let mut params = vec![
        "const NUMBER_T input[INPUT_SAMPLES][INPUT_CHANNELS]".to_string(),
        "const NUMBER_T kernel[CONV_FILTERS][CONV_KERNEL_SIZE][CHANNELS_PER_GROUP]".to_string(),
    ];
    if conv.bias.is_some() {
        params.push("const NUMBER_T bias[CONV_FILTERS]".to_string());
    }

    let mut code = Code::new();
    layer.open_function(&mut code, &params);
    code.line("int pos_x, k, x, z;");
    code.line("LONG_NUMBER_T output_acc;");
    code.blank();
    code.open("for (pos_x = 0; pos_x < CONV_OUTSAMPLES; pos_x++) {");
    code.open("for (k = 0; k < CONV_FILTERS; k++) {");
    code.line("output_acc = 0;");
    code.open("for (x = 0; x < CONV_KERNEL_SIZE; x++) {");
    code.line("int input_x = pos_x * CONV_STRIDE - ZEROPADDING_LEFT + x;");
    code.open("if (input_x < 0 || input_x >= INPUT_SAMPLES) {");
    code.line("continue;");
    code.close("}");
    code.open("for (z = 0; z < CHANNELS_PER_GROUP; z++) {");
    code.line(
        "output_acc += (LONG_NUMBER_T)kernel[k][x][z] \
         * (LONG_NUMBER_T)input[input_x][z + (k / FILTERS_PER_GROUP) * CHANNELS_PER_GROUP];",
    );
    code.close("}");
    code.close("}");
    code.blank();
    store_weighted(&mut code, layer, conv.activation, conv.bias.is_some(), "k", "output[pos_x][k]")?;
    code.close("}");
    code.close("}");
    code.close("}");
    Ok(layer.source(&m, code))
}

fn conv2d(layer: &Layer<'_>, conv: &Conv) -> CompileResult<String> {
    let input = layer.input_of_rank(0, 4)?;
    let output = layer.output_of_rank(4)?;
    let size = |i: usize| conv.kernel_size.get(i).copied().unwrap_or(1);
    let stride = |i: usize| conv.strides.get(i).copied().unwrap_or(1);
    let padding = |i: usize| conv.padding.get(i).copied().unwrap_or((0, 0)).0;

    let mut m = Macros::default();
    m.define("INPUT_CHANNELS", input[3]);
    m.define("INPUT_HEIGHT", input[1]);
    m.define("INPUT_WIDTH", input[2]);
    m.define("CONV_FILTERS", conv.filters);
    m.define("CONV_KERNEL_SIZE_Y", size(0));
    m.define("CONV_KERNEL_SIZE_X", size(1));
    m.define("CONV_STRIDE_Y", stride(0));
    m.define("CONV_STRIDE_X", stride(1));
    m.define("CONV_GROUPS", conv.groups.max(1));
    m.define("CHANNELS_PER_GROUP", "(INPUT_CHANNELS / CONV_GROUPS)");
    m.define("FILTERS_PER_GROUP", "(CONV_FILTERS / CONV_GROUPS)");
    m.define("ZEROPADDING_TOP", padding(0));
    m.define("ZEROPADDING_LEFT", padding(1));
    m.define("CONV_OUTHEIGHT", output[1]);
    m.define("CONV_OUTWIDTH", output[2]);
    layer.weights_macros(&mut m);
    layer.number_macros(&mut m);

    let mut params = vec![
        "const NUMBER_T input[INPUT_HEIGHT][INPUT_WIDTH][INPUT_CHANNELS]".to_string(),
        "const NUMBER_T kernel[CONV_FILTERS][CONV_KERNEL_SIZE_Y][CONV_KERNEL_SIZE_X][CHANNELS_PER_GROUP]".to_string(),
    ];
    if conv.bias.is_some() {
        params.push("const NUMBER_T bias[CONV_FILTERS]".to_string());
    }

    let mut code = Code::new();
    layer.open_function(&mut code, &params);
    code.line("int pos_y, pos_x, k, y, x, z;");
    code.line("LONG_NUMBER_T output_acc;");
    code.blank();
    code.open("for (pos_y = 0; pos_y < CONV_OUTHEIGHT; pos_y++) {");
    code.open("for (pos_x = 0; pos_x < CONV_OUTWIDTH; pos_x++) {");
    code.open("for (k = 0; k < CONV_FILTERS; k++) {");
    code.line("output_acc = 0;");
    code.open("for (y = 0; y < CONV_KERNEL_SIZE_Y; y++) {");
    code.line("int input_y = pos_y * CONV_STRIDE_Y - ZEROPADDING_TOP + y;");
    code.open("if (input_y < 0 || input_y >= INPUT_HEIGHT) {");
    code.line("continue;");
    code.close("}");
    code.open("for (x = 0; x < CONV_KERNEL_SIZE_X; x++) {");
    code.line("int input_x = pos_x * CONV_STRIDE_X - ZEROPADDING_LEFT + x;");
    code.open("if (input_x < 0 || input_x >= INPUT_WIDTH) {");
    code.line("continue;");
    code.close("}");
    code.open("for (z = 0; z < CHANNELS_PER_GROUP; z++) {");
    code.line(
        "output_acc += (LONG_NUMBER_T)kernel[k][y][x][z] \
         * (LONG_NUMBER_T)input[input_y][input_x][z + (k / FILTERS_PER_GROUP) * CHANNELS_PER_GROUP];",
    );
    code.close("}");
    code.close("}");
    code.close("}");
    code.blank();
    store_weighted(&mut code, layer, conv.activation, conv.bias.is_some(), "k", "output[pos_y][pos_x][k]")?;
    code.close("}");
    code.close("}");
    code.close("}");
    code.close("}");
    Ok(layer.source(&m, code))
}

fn pool1d(layer: &Layer<'_>, pool: &Pool, max: bool) -> CompileResult<String> {
    let input = layer.input_of_rank(0, 3)?;
    let output = layer.output_of_rank(3)?;
    let mut m = Macros::default();
    m.define("INPUT_CHANNELS", input[2]);
    m.define("INPUT_SAMPLES", input[1]);
    m.define("POOL_SIZE", pool.pool_size.first().copied().unwrap_or(1));
    m.define("POOL_STRIDE", pool.strides.first().copied().unwrap_or(1));
    m.define("POOL_LENGTH", output[1]);
    layer.number_macros(&mut m);

    let mut code = Code::new();
    layer.open_function(&mut code, &["const NUMBER_T input[INPUT_SAMPLES][INPUT_CHANNELS]".to_string()]);
    code.line("int pos_x, k, x;");
    code.line("LONG_NUMBER_T output_acc;");
    code.blank();
    code.open("for (k = 0; k < INPUT_CHANNELS; k++) {");
    code.open("for (pos_x = 0; pos_x < POOL_LENGTH; pos_x++) {");
    if max {
        code.line("output_acc = input[pos_x * POOL_STRIDE][k];");
        code.open("for (x = 1; x < POOL_SIZE; x++) {");
        code.open("if (input[pos_x * POOL_STRIDE + x][k] > output_acc) {");
        code.line("output_acc = input[pos_x * POOL_STRIDE + x][k];");
        code.close("}");
        code.close("}");
    } else {
        code.line("output_acc = 0;");
        code.open("for (x = 0; x < POOL_SIZE; x++) {");
        code.line("output_acc += input[pos_x * POOL_STRIDE + x][k];");
        code.close("}");
        code.line("output_acc = output_acc / POOL_SIZE;");
    }
    store(&mut code, layer, pool.activation, "output[pos_x][k]", "INPUT_SCALE_FACTOR")?;
    code.close("}");
    code.close("}");
    code.close("}");
    Ok(layer.source(&m, code))
}

fn pool2d(layer: &Layer<'_>, pool: &Pool, max: bool) -> CompileResult<String> {
    let input = layer.input_of_rank(0, 4)?;
    let output = layer.output_of_rank(4)?;
    let size = |i: usize| pool.pool_size.get(i).copied().unwrap_or(1);
    let stride = |i: usize| pool.strides.get(i).copied().unwrap_or(1);
    let mut m = Macros::default();
    m.define("INPUT_CHANNELS", input[3]);
    m.define("INPUT_HEIGHT", input[1]);
    m.define("INPUT_WIDTH", input[2]);
    m.define("POOL_SIZE_Y", size(0));
    m.define("POOL_SIZE_X", size(1));
    m.define("POOL_STRIDE_Y", stride(0));
    m.define("POOL_STRIDE_X", stride(1));
    m.define("POOL_HEIGHT", output[1]);
    m.define("POOL_WIDTH", output[2]);
    layer.number_macros(&mut m);

    let window = "input[pos_y * POOL_STRIDE_Y + y][pos_x * POOL_STRIDE_X + x][k]";
    let mut code = Code::new();
    layer.open_function(&mut code, &["const NUMBER_T input[INPUT_HEIGHT][INPUT_WIDTH][INPUT_CHANNELS]".to_string()]);
    code.line("int pos_y, pos_x, k, y, x;");
    code.line("LONG_NUMBER_T output_acc;");
    code.blank();
    code.open("for (k = 0; k < INPUT_CHANNELS; k++) {");
    code.open("for (pos_y = 0; pos_y < POOL_HEIGHT; pos_y++) {");
    code.open("for (pos_x = 0; pos_x < POOL_WIDTH; pos_x++) {");
    if max {
        code.line("output_acc = input[pos_y * POOL_STRIDE_Y][pos_x * POOL_STRIDE_X][k];");
    } else {
        code.line("output_acc = 0;");
    }
    code.open("for (y = 0; y < POOL_SIZE_Y; y++) {");
    code.open("for (x = 0; x < POOL_SIZE_X; x++) {");
    if max {
        code.open(format!("if ({window} > output_acc) {{"));
        code.line(format!("output_acc = {window};"));
        code.close("}");
    } else {
        code.line(format!("output_acc += {window};"));
    }
    code.close("}");
    code.close("}");
    if !max {
        code.line("output_acc = output_acc / (POOL_SIZE_Y * POOL_SIZE_X);");
    }
    store(&mut code, layer, pool.activation, "output[pos_y][pos_x][k]", "INPUT_SCALE_FACTOR")?;
    code.close("}");
    code.close("}");
    code.close("}");
    code.close("}");
    Ok(layer.source(&m, code))
}

fn batchnorm(layer: &Layer<'_>, bn: &BatchNorm) -> CompileResult<String> {
    let input = layer.input_shape(0)?;
    let channels = input.last().copied().unwrap_or(0);
    let mut m = Macros::default();
    m.define("INPUT_CHANNELS", channels);
    m.define("INPUT_SIZE", elements(input));
    layer.weights_macros(&mut m);
    layer.number_macros(&mut m);

    let params = [
        format!("const NUMBER_T input{}", dims(input)),
        "const NUMBER_T kernel[INPUT_CHANNELS]".to_string(),
        "const NUMBER_T bias[INPUT_CHANNELS]".to_string(),
    ];
    let mut code = Code::new();
    layer.open_function(&mut code, &params);
    code.line("const NUMBER_T *i = (const NUMBER_T *)input;");
    code.line("NUMBER_T *o = (NUMBER_T *)output;");
    code.line("size_t x, k;");
    code.line("LONG_NUMBER_T output_acc;");
    code.blank();
    code.open("for (x = 0; x < INPUT_SIZE; x += INPUT_CHANNELS) {");
    code.open("for (k = 0; k < INPUT_CHANNELS; k++) {");
    code.line("output_acc = (LONG_NUMBER_T)i[x + k] * (LONG_NUMBER_T)kernel[k];");
    store_weighted(&mut code, layer, bn.activation, true, "k", "o[x + k]")?;
    code.close("}");
    code.close("}");
    code.close("}");
    Ok(layer.source(&m, code))
}

fn activation_layer(layer: &Layer<'_>, activation: Activation) -> CompileResult<String> {
    let input = layer.input_shape(0)?;
    let mut m = Macros::default();
    m.define("INPUT_SIZE", elements(input));
    layer.number_macros(&mut m);

    let mut code = Code::new();
    layer.open_function(&mut code, &[format!("const NUMBER_T input{}", dims(input))]);
    code.line("const NUMBER_T *i = (const NUMBER_T *)input;");
    code.line("NUMBER_T *o = (NUMBER_T *)output;");
    code.line("size_t x;");
    code.line("LONG_NUMBER_T output_acc;");
    code.blank();
    code.open("for (x = 0; x < INPUT_SIZE; x++) {");
    code.line("output_acc = i[x];");
    store(&mut code, layer, activation, "o[x]", "INPUT_SCALE_FACTOR")?;
    code.close("}");
    code.close("}");
    Ok(layer.source(&m, code))
}

fn softmax(layer: &Layer<'_>) -> CompileResult<String> {
    let input = layer.input_shape(0)?;
    let mut m = Macros::default();
    m.define("INPUT_CHANNELS", input.last().copied().unwrap_or(1));
    m.define("INPUT_SIZE", elements(input));
    layer.number_macros(&mut m);

    let mut code = Code::new();
    layer.open_function(&mut code, &[format!("const NUMBER_T input{}", dims(input))]);
    code.line("const NUMBER_T *i = (const NUMBER_T *)input;");
    code.line("NUMBER_T *o = (NUMBER_T *)output;");
    code.line("static double exp_values[INPUT_CHANNELS];");
    code.line("double max_value, sum;");
    code.line("size_t x, k;");
    code.blank();
    code.open("for (x = 0; x < INPUT_SIZE; x += INPUT_CHANNELS) {");
    code.line("max_value = ldexp((double)i[x], -INPUT_SCALE_FACTOR);");
    code.open("for (k = 1; k < INPUT_CHANNELS; k++) {");
    code.open("if (ldexp((double)i[x + k], -INPUT_SCALE_FACTOR) > max_value) {");
    code.line("max_value = ldexp((double)i[x + k], -INPUT_SCALE_FACTOR);");
    code.close("}");
    code.close("}");
    code.line("sum = 0;");
    code.open("for (k = 0; k < INPUT_CHANNELS; k++) {");
    code.line("exp_values[k] = exp(ldexp((double)i[x + k], -INPUT_SCALE_FACTOR) - max_value);");
    code.line("sum += exp_values[k];");
    code.close("}");
    code.open("for (k = 0; k < INPUT_CHANNELS; k++) {");
    store_real(&mut code, layer.q, "o[x + k]", "exp_values[k] / sum");
    code.close("}");
    code.close("}");
    code.close("}");
    Ok(layer.source(&m, code))
}

fn add(layer: &Layer<'_>, activation: Activation) -> CompileResult<String> {
    let output = layer.node.spec.output_shape();
    let acc_scale = (0..layer.preds.len()).map(|i| layer.input_scale_factor(i)).max().unwrap_or(0);
    let mut m = Macros::default();
    m.define("OUTPUT_SIZE", elements(output));
    m.define("ACC_SCALE_FACTOR", acc_scale);
    layer.number_macros(&mut m);

    let mut params = Vec::new();
    for i in 0..layer.preds.len() {
        params.push(format!("const NUMBER_T input_{}{}", i + 1, dims(layer.input_shape(i)?)));
    }
    let mut code = Code::new();
    layer.open_function(&mut code, &params);
    for i in 1..=layer.preds.len() {
        code.line(format!("const NUMBER_T *i_{i} = (const NUMBER_T *)input_{i};"));
    }
    code.line("NUMBER_T *o = (NUMBER_T *)output;");
    code.line("size_t x;");
    code.line("LONG_NUMBER_T output_acc;");
    code.blank();
    code.open("for (x = 0; x < OUTPUT_SIZE; x++) {");
    code.line("output_acc = 0;");
    for i in 0..layer.preds.len() {
        code.line(format!(
            "output_acc += scale(NUMBER_T, (LONG_NUMBER_T)i_{}[x], {} - ACC_SCALE_FACTOR, OUTPUT_ROUND_MODE);",
            i + 1,
            layer.input_scale_factor(i)
        ));
    }
    store(&mut code, layer, activation, "o[x]", "ACC_SCALE_FACTOR")?;
    code.close("}");
    code.close("}");
    Ok(layer.source(&m, code))
}

fn flatten(layer: &Layer<'_>) -> CompileResult<String> {
    let input = layer.input_shape(0)?;
    let mut m = Macros::default();
    m.define("OUTPUT_SIZE", elements(layer.node.spec.output_shape()));
    m.define("NUMBER_T", layer.q.number_type().ctype());

    let mut code = Code::new();
    layer.open_function(&mut code, &[format!("const NUMBER_T input{}", dims(input))]);
    code.line("const NUMBER_T *i = (const NUMBER_T *)input;");
    code.line("NUMBER_T *o = (NUMBER_T *)output;");
    code.line("size_t x;");
    code.blank();
    // The output usually overwrites the input buffer, making the copy a no-op.
    code.open("if ((const void *)i == (const void *)o) {");
    code.line("return;");
    code.close("}");
    code.open("for (x = 0; x < OUTPUT_SIZE; x++) {");
    code.line("o[x] = i[x];");
    code.close("}");
    code.close("}");
    Ok(layer.source(&m, code))
}

fn sum(layer: &Layer<'_>) -> CompileResult<String> {
    let input = layer.input_shape(0)?;
    if !matches!(input.len(), 3 | 4) {
        return Err(layer.error(format!("global sum pooling over a rank {} input", input.len())));
    }
    let channels = input.last().copied().unwrap_or(1);
    let mut m = Macros::default();
    m.define("INPUT_CHANNELS", channels);
    m.define("INPUT_SIZE", elements(input));
    layer.number_macros(&mut m);

    let mut code = Code::new();
    layer.open_function(&mut code, &[format!("const NUMBER_T input{}", dims(input))]);
    code.line("const NUMBER_T *i = (const NUMBER_T *)input;");
    code.line("NUMBER_T *o = (NUMBER_T *)output;");
    code.line("static LONG_NUMBER_T output_acc[INPUT_CHANNELS];");
    code.line("size_t x, k;");
    code.blank();
    code.open("for (k = 0; k < INPUT_CHANNELS; k++) {");
    code.line("output_acc[k] = 0;");
    code.close("}");
    code.open("for (x = 0; x < INPUT_SIZE; x += INPUT_CHANNELS) {");
    code.open("for (k = 0; k < INPUT_CHANNELS; k++) {");
    code.line("output_acc[k] += i[x + k];");
    code.close("}");
    code.close("}");
    code.open("for (k = 0; k < INPUT_CHANNELS; k++) {");
    code.line(
        "o[k] = scale_and_clamp_to(NUMBER_T, output_acc[k], INPUT_SCALE_FACTOR - OUTPUT_SCALE_FACTOR, OUTPUT_ROUND_MODE);",
    );
    code.close("}");
    code.close("}");
    Ok(layer.source(&m, code))
}

fn concatenate(layer: &Layer<'_>, axis: isize) -> CompileResult<String> {
    let output = layer.node.spec.output_shape();
    let rank = output.len() as isize;
    let axis = if axis < 0 { axis + rank } else { axis };
    if axis < 1 || axis >= rank {
        return Err(layer.error(format!("cannot concatenate along axis {axis} of a rank {rank} output")));
    }
    let axis = axis as usize;
    let outer: usize = output[1..axis].iter().product();

    let mut m = Macros::default();
    m.define("OUTER_SIZE", outer);
    layer.number_macros(&mut m);

    let mut params = Vec::new();
    let mut inner = Vec::new();
    for i in 0..layer.preds.len() {
        let shape = layer.input_shape(i)?;
        if shape.len() != output.len() {
            return Err(layer.error(format!("input {i} has rank {}, output has rank {rank}", shape.len())));
        }
        params.push(format!("const NUMBER_T input_{}{}", i + 1, dims(shape)));
        inner.push(shape[axis..].iter().product::<usize>());
    }

    let mut code = Code::new();
    layer.open_function(&mut code, &params);
    for i in 1..=layer.preds.len() {
        code.line(format!("const NUMBER_T *i_{i} = (const NUMBER_T *)input_{i};"));
    }
    code.line("NUMBER_T *o = (NUMBER_T *)output;");
    code.line("size_t x, y, output_x = 0;");
    code.line("LONG_NUMBER_T output_acc;");
    code.blank();
    code.open("for (x = 0; x < OUTER_SIZE; x++) {");
    for (i, size) in inner.iter().enumerate() {
        code.open(format!("for (y = 0; y < {size}; y++, output_x++) {{"));
        code.line(format!("output_acc = i_{}[x * {size} + y];", i + 1));
        code.line(format!(
            "o[output_x] = scale_and_clamp_to(NUMBER_T, output_acc, {} - OUTPUT_SCALE_FACTOR, OUTPUT_ROUND_MODE);",
            layer.input_scale_factor(i)
        ));
        code.close("}");
    }
    code.close("}");
    code.close("}");
    Ok(layer.source(&m, code))
}

fn slice(layer: &Layer<'_>, slices: &[SliceRange]) -> CompileResult<String> {
    let input = layer.input_shape(0)?;
    let mut m = Macros::default();
    m.define("NUMBER_T", layer.q.number_type().ctype());

    let mut code = Code::new();
    layer.open_function(&mut code, &[format!("const NUMBER_T input{}", dims(input))]);
    let counters: Vec<String> = (1..input.len()).map(|d| format!("i_{d}, o_{d}")).collect();
    if !counters.is_empty() {
        code.line(format!("size_t {};", counters.join(", ")));
        code.blank();
    }
    for (d, &dim) in input.iter().enumerate().skip(1) {
        let range = slices.get(d).copied().unwrap_or(SliceRange { start: 0, stop: dim, step: 1 });
        code.open(format!(
            "for (i_{d} = {}, o_{d} = 0; i_{d} < {}; i_{d} += {}, o_{d}++) {{",
            range.start,
            range.stop.min(dim),
            range.step.max(1)
        ));
    }
    let out_index: String = (1..input.len()).map(|d| format!("[o_{d}]")).collect();
    let in_index: String = (1..input.len()).map(|d| format!("[i_{d}]")).collect();
    code.line(format!("output{out_index} = input{in_index};"));
    for _ in 1..input.len() {
        code.close("}");
    }
    code.close("}");
    Ok(layer.source(&m, code))
}

fn samplenorm(layer: &Layer<'_>, mode: SampleNormMode) -> CompileResult<String> {
    let input = layer.input_shape(0)?;
    let mut m = Macros::default();
    m.define("INPUT_CHANNELS", input.last().copied().unwrap_or(1));
    m.define("INPUT_SIZE", elements(input));
    layer.number_macros(&mut m);

    let value = "ldexp((double)i[x + k], -INPUT_SCALE_FACTOR)";
    let mut code = Code::new();
    layer.open_function(&mut code, &[format!("const NUMBER_T input{}", dims(input))]);
    code.line("const NUMBER_T *i = (const NUMBER_T *)input;");
    code.line("NUMBER_T *o = (NUMBER_T *)output;");
    code.line("size_t x, k;");
    code.line("double a, b, v;");
    code.blank();
    code.open("for (k = 0; k < INPUT_CHANNELS; k++) {");
    match mode {
        SampleNormMode::MinMax => {
            code.line("a = ldexp((double)i[k], -INPUT_SCALE_FACTOR);");
            code.line("b = a;");
            code.open("for (x = 0; x < INPUT_SIZE; x += INPUT_CHANNELS) {");
            code.line(format!("v = {value};"));
            code.line("a = v < a ? v : a;");
            code.line("b = v > b ? v : b;");
            code.close("}");
            code.line("b = b > a ? b - a : 1;");
        }
        SampleNormMode::ZScore => {
            code.line("a = 0;");
            code.line("b = 0;");
            code.open("for (x = 0; x < INPUT_SIZE; x += INPUT_CHANNELS) {");
            code.line(format!("a += {value};"));
            code.close("}");
            code.line("a /= INPUT_SIZE / INPUT_CHANNELS;");
            code.open("for (x = 0; x < INPUT_SIZE; x += INPUT_CHANNELS) {");
            code.line(format!("v = {value} - a;"));
            code.line("b += v * v;");
            code.close("}");
            code.line("b = sqrt(b / (INPUT_SIZE / INPUT_CHANNELS));");
            code.line("b = b > 0 ? b : 1;");
        }
    }
    code.open("for (x = 0; x < INPUT_SIZE; x += INPUT_CHANNELS) {");
    store_real(&mut code, layer.q, "o[x + k]", &format!("({value} - a) / b"));
    code.close("}");
    code.close("}");
    code.close("}");
    Ok(layer.source(&m, code))
}

fn permute(layer: &Layer<'_>, order: &[usize]) -> CompileResult<String> {
    let input = layer.input_shape(0)?;
    if order.len() != input.len() || order.first() != Some(&0) {
        return Err(layer.error(format!("permutation {order:?} does not fit input shape {input:?}")));
    }
    let mut m = Macros::default();
    m.define("NUMBER_T", layer.q.number_type().ctype());

    let mut code = Code::new();
    layer.open_function(&mut code, &[format!("const NUMBER_T input{}", dims(input))]);
    let counters: Vec<String> = (1..input.len()).map(|d| format!("i_{d}")).collect();
    if !counters.is_empty() {
        code.line(format!("size_t {};", counters.join(", ")));
        code.blank();
    }
    for (d, dim) in input.iter().enumerate().skip(1) {
        code.open(format!("for (i_{d} = 0; i_{d} < {dim}; i_{d}++) {{"));
    }
    let out_index: String = order.iter().skip(1).map(|d| format!("[i_{d}]")).collect();
    let in_index: String = (1..input.len()).map(|d| format!("[i_{d}]")).collect();
    code.line(format!("output{out_index} = input{in_index};"));
    for _ in 1..input.len() {
        code.close("}");
    }
    code.close("}");
    Ok(layer.source(&m, code))
}

fn upsample(layer: &Layer<'_>) -> CompileResult<String> {
    let input = layer.input_shape(0)?;
    let output = layer.node.spec.output_shape();
    if !matches!(input.len(), 3 | 4) || input.len() != output.len() {
        return Err(layer.error(format!("cannot upsample {input:?} to {output:?}")));
    }
    let mut m = Macros::default();
    m.define("NUMBER_T", layer.q.number_type().ctype());

    let spatial = input.len() - 2;
    let mut code = Code::new();
    layer.open_function(&mut code, &[format!("const NUMBER_T input{}", dims(input))]);
    let counters: Vec<String> = (1..input.len()).map(|d| format!("o_{d}")).collect();
    code.line(format!("size_t {};", counters.join(", ")));
    code.blank();
    for (d, dim) in output.iter().enumerate().skip(1) {
        code.open(format!("for (o_{d} = 0; o_{d} < {dim}; o_{d}++) {{"));
    }
    let out_index: String = (1..output.len()).map(|d| format!("[o_{d}]")).collect();
    let in_index: String = (1..output.len())
        .map(|d| {
            if d <= spatial {
                format!("[o_{d} / {}]", (output[d] / input[d].max(1)).max(1))
            } else {
                format!("[o_{d}]")
            }
        })
        .collect();
    code.line(format!("output{out_index} = input{in_index};"));
    for _ in 1..output.len() {
        code.close("}");
    }
    code.close("}");
    Ok(layer.source(&m, code))
}

/// Computed layers of the graph, in order.
fn computed(graph: &Graph) -> impl Iterator<Item = &Node> {
    graph.nodes().filter(|n| !n.spec.is_input())
}

fn defines(bindings: &Bindings<'_>) -> String {
    let graph = bindings.graph;
    let mut code = Code::new();
    code.line("#ifndef _DEFINES_H_");
    code.line("#define _DEFINES_H_");
    code.blank();
    code.line(format!("#define MODEL_ACTIVATION_POOLS {}", bindings.plan.pool_count()));
    for node in computed(graph) {
        code.line(format!("#define {}_OUTPUT_SIZE {}", node.name().to_uppercase(), node.spec.output_elements()));
    }
    code.blank();

    let round_modes: Vec<(&str, Option<RoundMode>, Option<RoundMode>)> = graph
        .nodes()
        .map(|n| {
            let q = n.q.as_ref();
            (n.name(), q.and_then(|q| q.output_round_mode), q.and_then(|q| q.weights_round_mode))
        })
        .collect();
    let (first_name, first_mode) = round_modes.first().map_or(("", None), |&(name, mode, _)| (name, mode));
    let first = first_mode.map_or("none", |m| m.as_str());

    code.line("/* CMSIS-NN round mode definition */");
    code.line("#if defined(WITH_CMSIS_NN) || defined(WITH_NMSIS_NN)");
    for &(name, output, weights) in &round_modes {
        if output != first_mode {
            code.line(format!(
                "#error \"CMSIS-NN requires all round modes to be identical, got output_round_mode {first} \
                 for {first_name} and {} for {name}\"",
                output.map_or("none", |m| m.as_str())
            ));
        }
        if let Some(weights) = weights.filter(|&w| Some(w) != first_mode) {
            code.line(format!(
                "#error \"CMSIS-NN requires all round modes to be identical, got output_round_mode {first} \
                 for {first_name} and weights_round_mode {weights} for {name}\""
            ));
        }
    }
    match first_mode {
        Some(RoundMode::Floor) => {
            code.line("#define ARM_NN_TRUNCATE 1");
            code.line("#define RISCV_NN_TRUNCATE 1");
        }
        Some(RoundMode::Nearest) => {
            code.line("#undef ARM_NN_TRUNCATE");
            code.line("#undef RISCV_NN_TRUNCATE");
        }
        _ => code.line("#error \"Unrecognized round mode, only floor and nearest are supported by CMSIS-NN\""),
    }
    code.line("#endif // defined(WITH_CMSIS_NN) || defined(WITH_NMSIS_NN)");
    code.blank();
    code.line("#endif // _DEFINES_H_");
    code.finish()
}

/// One entry per distinct C spelling.
fn distinct_types(types: &NumberTypes) -> Vec<NumberType> {
    let mut seen: Vec<NumberType> = Vec::new();
    for ty in types.iter() {
        if !seen.iter().any(|s| s.ctype() == ty.ctype()) {
            seen.push(*ty);
        }
    }
    seen
}

fn numeric_types(types: &NumberTypes) -> String {
    let mut code = Code::new();
    code.line("#ifndef _NUMBER_H_");
    code.line("#define _NUMBER_H_");
    code.blank();
    code.line("#include <stdint.h>");
    code.line("#include <stddef.h>");
    code.line("#include <math.h>");
    code.blank();
    code.line("#ifndef SINGLE_FILE");
    code.line("#include \"defines.h\"");
    code.line("#endif");
    code.blank();
    code.line("#define ROUND_MODE_NONE 0");
    code.line("#define ROUND_MODE_FLOOR 1");
    code.line("#define ROUND_MODE_NEAREST 2");
    code.blank();
    code.line("#define _clamp_to(type, number) clamp_to_number_t_ ## type (number)");
    code.line("#define clamp_to(type, number) _clamp_to(type, number)");
    code.line("#define _scale(type, number, scale_factor, round_mode) scale_number_t_ ## type (number, scale_factor, round_mode)");
    code.line("#define scale(type, number, scale_factor, round_mode) _scale(type, number, scale_factor, round_mode)");
    code.line(
        "#define _scale_and_clamp_to(type, number, scale_factor, round_mode) \
         scale_and_clamp_to_number_t_ ## type (number, scale_factor, round_mode)",
    );
    code.line(
        "#define scale_and_clamp_to(type, number, scale_factor, round_mode) \
         _scale_and_clamp_to(type, number, scale_factor, round_mode)",
    );

    let types = distinct_types(types);
    for ty in &types {
        code.blank();
        number_type_helpers(&mut code, ty);
    }
    for from in &types {
        for to in &types {
            if from.ctype() != to.ctype() {
                code.blank();
                conversion(&mut code, from, to);
            }
        }
    }
    code.blank();
    code.line("#endif // _NUMBER_H_");
    code.finish()
}

fn number_type_helpers(code: &mut Code, ty: &NumberType) {
    let t = ty.ctype();
    let long = ty.long_ctype();
    let upper = t.to_uppercase();
    match ty.kind {
        NumberKind::Integer => {
            code.line(format!("#define NUMBER_MIN_{upper} ({} - 1)", ty.min + 1));
            code.line(format!("#define NUMBER_MAX_{upper} {}", ty.max));
        }
        NumberKind::Float => {
            code.line(format!("#define NUMBER_MIN_{upper} -INFINITY"));
            code.line(format!("#define NUMBER_MAX_{upper} INFINITY"));
        }
    }
    code.blank();
    code.open(format!("static inline {t} min_{t}({t} a, {t} b) {{"));
    code.line("return a <= b ? a : b;");
    code.close("}");
    code.blank();
    code.open(format!("static inline {t} max_{t}({t} a, {t} b) {{"));
    code.line("return a >= b ? a : b;");
    code.close("}");
    code.blank();
    code.open(format!("static inline {long} scale_number_t_{t}({long} number, int scale_factor, int round_mode) {{"));
    match ty.kind {
        NumberKind::Integer => {
            code.open("if (scale_factor <= 0) {");
            code.line("// Negative scale factor is a left shift");
            code.line(format!("return number * (({long})1 << -scale_factor);"));
            code.close("}");
            code.open("if (round_mode == ROUND_MODE_NEAREST) {");
            code.line(format!("number += ({long})1 << (scale_factor - 1);"));
            code.close("}");
            code.line("return number >> scale_factor;");
        }
        NumberKind::Float => {
            code.line("(void)scale_factor;");
            code.line("(void)round_mode;");
            code.line("return number;");
        }
    }
    code.close("}");
    code.blank();
    code.open(format!("static inline {t} clamp_to_number_t_{t}({long} number) {{"));
    match ty.kind {
        NumberKind::Integer => {
            code.open(format!("if (number < NUMBER_MIN_{upper}) {{"));
            code.line(format!("return NUMBER_MIN_{upper};"));
            code.close("}");
            code.open(format!("if (number > NUMBER_MAX_{upper}) {{"));
            code.line(format!("return NUMBER_MAX_{upper};"));
            code.close("}");
            code.line(format!("return ({t})number;"));
        }
        NumberKind::Float => code.line(format!("return ({t})number;")),
    }
    code.close("}");
    code.blank();
    code.open(format!(
        "static inline {t} scale_and_clamp_to_number_t_{t}({long} number, int scale_factor, int round_mode) {{"
    ));
    code.line(format!("return clamp_to_number_t_{t}(scale_number_t_{t}(number, scale_factor, round_mode));"));
    code.close("}");
}

/// `<from>_to_<to>`. The scale factor is the one of the fixed-point side.
fn conversion(code: &mut Code, from: &NumberType, to: &NumberType) {
    let (f, t) = (from.ctype(), to.ctype());
    let value = match (from.kind, to.kind) {
        (NumberKind::Integer, NumberKind::Float) => format!("({t})ldexp((double)input[x], -scale_factor)"),
        (NumberKind::Float, NumberKind::Integer) => format!(
            "clamp_to_number_t_{t}(({})floor(ldexp((double)input[x], scale_factor)))",
            to.long_ctype()
        ),
        (NumberKind::Integer, NumberKind::Integer) => format!("clamp_to_number_t_{t}(({})input[x])", to.long_ctype()),
        (NumberKind::Float, NumberKind::Float) => format!("({t})input[x]"),
    };
    code.open(format!(
        "static inline void {f}_to_{t}(const {f} *input, {t} *output, size_t size, int scale_factor) {{"
    ));
    code.line("size_t x;");
    if from.kind == to.kind {
        code.line("(void)scale_factor;");
    }
    code.open("for (x = 0; x < size; x++) {");
    code.line(format!("output[x] = {value};"));
    code.close("}");
    code.close("}");
}

/// Input and last layer of the graph, with their quantization.
fn endpoints<'a>(template: &TemplateId, graph: &'a Graph) -> CompileResult<(&'a Node, &'a Quantization, &'a Node)> {
    let (Some(input), Some(last)) = (graph.input(), graph.output()) else {
        return Err(render_error(template, "empty graph"));
    };
    let (input, last) = (graph.node(input), graph.node(last));
    if last.spec.is_input() {
        return Err(render_error(template, "the model has no computed layer"));
    }
    let q = input
        .q
        .as_ref()
        .ok_or_else(|| render_error(template, format!("{}: no quantization information", input.name())))?;
    Ok((input, q, last))
}

fn model_header(template: &TemplateId, bindings: &Bindings<'_>) -> CompileResult<String> {
    let graph = bindings.graph;
    let (input, q, last) = endpoints(template, graph)?;
    let ty = q.number_type();
    let input_shape = input.spec.output_shape();

    let mut code = Code::new();
    code.line("#ifndef _MODEL_H_");
    code.line("#define _MODEL_H_");
    code.blank();
    code.line("#ifdef __cplusplus");
    code.line("extern \"C\" {");
    code.line("#endif");
    code.blank();
    code.line("#ifndef SINGLE_FILE");
    code.line("#include \"number.h\"");
    for node in computed(graph) {
        code.line(format!("#include \"{}.h\"", node.name()));
    }
    code.line("#endif");
    code.blank();
    for (i, dim) in input_shape.iter().skip(1).enumerate() {
        code.line(format!("#define MODEL_INPUT_DIM_{i} {dim}"));
    }
    let input_dims: Vec<String> = input_shape.iter().skip(1).map(ToString::to_string).collect();
    code.line(format!("#define MODEL_INPUT_DIMS ({})", input_dims.join(" * ")));
    code.blank();
    code.line(format!(
        "#define MODEL_OUTPUT_SAMPLES {}",
        last.spec.output_shape().last().copied().unwrap_or(0)
    ));
    code.blank();
    code.line(format!("#define MODEL_INPUT_SCALE_FACTOR {}", q.output_scale_factor.unwrap_or(0)));
    code.line(format!("#define MODEL_INPUT_ROUND_MODE {}", round_mode_macro(q.output_round_mode)));
    code.line(format!("#define MODEL_INPUT_NUMBER_T {}", ty.ctype()));
    code.line(format!("#define MODEL_INPUT_LONG_NUMBER_T {}", ty.long_ctype()));
    code.blank();
    code.line(format!("typedef MODEL_INPUT_NUMBER_T input_t{};", dims(input_shape)));
    code.line(format!("typedef {}_output_type output_t;", last.name()));
    code.blank();
    code.line("void cnn(");
    code.line("  const input_t input,");
    code.line("  output_t output);");
    code.blank();
    code.line("void reset(void);");
    code.blank();
    code.line("#ifdef __cplusplus");
    code.line("} // extern \"C\"");
    code.line("#endif");
    code.blank();
    code.line("#endif // _MODEL_H_");
    Ok(code.finish())
}

fn model(template: &TemplateId, bindings: &Bindings<'_>) -> CompileResult<String> {
    let graph = bindings.graph;
    let plan = bindings.plan;
    let (_, _, last) = endpoints(template, graph)?;
    let last_id = graph.output();

    let mut code = Code::new();
    code.line("#ifdef __cplusplus");
    code.line("extern \"C\" {");
    code.line("#endif");
    code.blank();
    code.line("#ifndef SINGLE_FILE");
    code.line("#include \"number.h\"");
    code.line("#include \"model.h\"");
    for node in computed(graph) {
        code.line(format!("#include \"{}.c\"", node.name()));
        if node.spec.has_weights() {
            code.line(format!("#include \"weights/{}.c\"", node.name()));
        }
    }
    code.line("#endif");
    code.blank();
    code.line("void cnn(");
    code.line("  const input_t input,");
    code.open(format!("{0}_output_type {0}_output) {{", last.name()));
    code.blank();
    code.line("// Output array allocation");
    for (i, pool) in plan.pools().iter().enumerate() {
        code.open("static union {");
        for &tenant in &pool.tenants {
            code.line(format!("{0}_output_type {0}_output;", graph.node(tenant).name()));
        }
        code.close(format!("}} activations{};", i + 1));
    }
    code.blank();
    code.line("// Model layers call chain");

    for &id in graph.ids() {
        let node = graph.node(id);
        if node.spec.is_input() {
            continue;
        }
        let q = node
            .q
            .as_ref()
            .ok_or_else(|| render_error(template, format!("{}: no quantization information", node.name())))?;
        let mut args = Vec::new();
        for (i, &pred_id) in node.preds().iter().enumerate() {
            let pred = graph.node(pred_id);
            let source = if pred.spec.is_input() {
                "input".to_string()
            } else {
                format!("activations{}.{}_output", plan.pool_index(pred_id), pred.name())
            };
            let pred_q = pred
                .q
                .as_ref()
                .ok_or_else(|| render_error(template, format!("{}: no quantization information", pred.name())))?;
            let (from, to) = (pred_q.number_type().ctype(), q.number_type().ctype());
            if from == to {
                args.push(source);
                continue;
            }
            // Adjacent layers disagree on the number type: convert into a scratch buffer.
            let shape = node.spec.input_shapes.get(i).map_or(&[][..], Vec::as_slice);
            let buffer = format!("{}_input_{}", node.name(), i + 1);
            let scale_factor = if pred_q.is_integer() { pred_q.output_scale_factor } else { q.output_scale_factor };
            code.line(format!("static {to} {buffer}{};", dims(shape)));
            code.line(format!(
                "{from}_to_{to}((const {from} *){source}, ({to} *){buffer}, {}, {});",
                elements(shape),
                scale_factor.unwrap_or(0)
            ));
            args.push(buffer);
        }
        for (role, _) in node.spec.weights() {
            args.push(format!("{}_{role}", node.name()));
        }
        if Some(id) == last_id {
            args.push(format!("{}_output", node.name()));
        } else {
            args.push(format!("activations{}.{}_output", plan.pool_index(id), node.name()));
        }

        code.open(format!("{}(", node.name()));
        let count = args.len();
        for (i, arg) in args.iter().enumerate() {
            code.line(if i + 1 < count { format!("{arg},") } else { arg.clone() });
        }
        code.close(");");
    }
    code.close("}");
    code.blank();
    code.open("void reset(void) {");
    code.close("}");
    code.blank();
    code.line("#ifdef __cplusplus");
    code.line("} // extern \"C\"");
    code.line("#endif");
    Ok(code.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;
    use crate::calibration::annotate;
    use crate::core::{CompilationSession, QuantMode};
    use crate::emitter::{Emitter, SourceBundle};
    use crate::graph::{LayerSpec, Tensor};
    use crate::quantizer::quantize_graph;
    use bumpalo::Bump;

    fn classifier() -> Graph {
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 3])).unwrap();
        let fc = g
            .insert(
                LayerSpec::new(
                    "fc",
                    LayerKind::Dense(Dense {
                        units: 2,
                        activation: Activation::Relu,
                        kernel: Tensor::from_f32(vec![2, 3], vec![0.5, -0.5, 0.25, 1.0, 0.0, -1.0]),
                        bias: Some(Tensor::vector(vec![0.125, 0.0])),
                    }),
                    vec![vec![1, 3]],
                    vec![vec![1, 2]],
                ),
                &[x],
                &[],
            )
            .unwrap();
        g.insert(
            LayerSpec::new("probs", LayerKind::Activation(Activation::Softmax), vec![vec![1, 2]], vec![vec![1, 2]]),
            &[fc],
            &[],
        )
        .unwrap();
        g
    }

    fn render(graph: &mut Graph) -> SourceBundle {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        quantize_graph(graph, &session).unwrap();
        let plan = Allocator::allocate(graph, &session).unwrap();
        Emitter::default().emit(graph, &plan, &session.number_types(), &session).unwrap()
    }

    #[test]
    fn test_float_classifier() {
        let mut g = classifier();
        annotate(&mut g, None, QuantMode::Float32).unwrap();
        let bundle = render(&mut g);

        let fc = bundle.get("fc.c").unwrap();
        assert!(fc.contains("static inline void fc("));
        assert!(fc.contains("#define FC_UNITS 2"));
        assert!(fc.contains("#undef FC_UNITS"));
        assert!(fc.contains("#define NUMBER_T float"));
        assert!(fc.contains("if (output_acc < 0) {"));

        let weights = bundle.get("weights/fc.c").unwrap();
        assert!(weights.contains("const float fc_kernel[2][3] = {"));
        assert!(weights.contains("const float fc_bias[2] = {0x1p-3, 0x0p+0};"));
        assert!(bundle.get("weights/probs.c").is_none());

        let header = bundle.get("include/fc.h").unwrap();
        assert!(header.contains("typedef float fc_output_type[2];"));

        let model = bundle.get("model.c").unwrap();
        assert!(model.contains("fc_output_type fc_output;"));
        assert!(model.contains("} activations1;"));
        assert!(model.contains("fc(\n    input,\n    fc_kernel,\n    fc_bias,\n    activations1.fc_output\n  );"));
        assert!(model.contains("probs(\n    activations1.fc_output,\n    probs_output\n  );"));

        let model_header = bundle.get("include/model.h").unwrap();
        assert!(model_header.contains("#define MODEL_INPUT_DIM_0 3"));
        assert!(model_header.contains("#define MODEL_OUTPUT_SAMPLES 2"));
        assert!(model_header.contains("typedef probs_output_type output_t;"));

        let number = bundle.get("include/number.h").unwrap();
        assert!(number.contains("static inline float scale_number_t_float(float number"));
        assert!(number.contains("static inline void int32_t_to_float("));
    }

    #[test]
    fn test_fixed_point_dense() {
        let mut g = classifier();
        let q = Quantization {
            kind: NumberKind::Integer,
            width: 8,
            long_width: 16,
            weights_scale_factor: Some(6),
            bias_scale_factor: None,
            output_scale_factor: Some(5),
            weights_round_mode: Some(RoundMode::Floor),
            output_round_mode: Some(RoundMode::Nearest),
        };
        for id in g.ids().to_vec() {
            g.node_mut(id).q = Some(q.clone());
        }
        let bundle = render(&mut g);

        let fc = bundle.get("fc.c").unwrap();
        assert!(fc.contains("#define NUMBER_T int8_t"));
        assert!(fc.contains("#define LONG_NUMBER_T int16_t"));
        assert!(fc.contains("#define TMP_SCALE_FACTOR 6"));
        assert!(fc.contains("#define INPUT_SCALE_FACTOR 5"));
        assert!(fc.contains("#define OUTPUT_ROUND_MODE ROUND_MODE_NEAREST"));
        assert!(bundle.get("weights/fc.c").unwrap().contains("const int8_t fc_kernel[2][3] = {\n  {32, -32, 16},"));

        let number = bundle.get("include/number.h").unwrap();
        assert!(number.contains("#define NUMBER_MIN_INT8_T (-127 - 1)"));
        assert!(number.contains("#define NUMBER_MAX_INT8_T 127"));
        assert!(number.contains("static inline void int8_t_to_int32_t("));

        let softmax = bundle.get("probs.c").unwrap();
        assert!(softmax.contains("clamp_to(NUMBER_T, (LONG_NUMBER_T)floor(ldexp(exp_values[k] / sum, OUTPUT_SCALE_FACTOR)));"));

        let defines = bundle.get("include/defines.h").unwrap();
        assert!(defines.contains("#define MODEL_ACTIVATION_POOLS 1"));
        assert!(defines.contains("weights_round_mode floor for fc"));
        assert!(defines.contains("#undef ARM_NN_TRUNCATE"));
    }

    #[test]
    fn test_type_conversion_between_layers() {
        let mut g = classifier();
        let mut int = Quantization {
            kind: NumberKind::Integer,
            width: 16,
            long_width: 32,
            weights_scale_factor: Some(8),
            bias_scale_factor: Some(8),
            output_scale_factor: Some(7),
            weights_round_mode: Some(RoundMode::Floor),
            output_round_mode: Some(RoundMode::Floor),
        };
        let ids = g.ids().to_vec();
        g.node_mut(ids[0]).q = Some(int.clone());
        int.output_scale_factor = Some(6);
        g.node_mut(ids[1]).q = Some(int);
        g.node_mut(ids[2]).q = Some(Quantization::float(32, 32));
        let bundle = render(&mut g);

        let model = bundle.get("model.c").unwrap();
        assert!(model.contains("static float probs_input_1[2];"));
        assert!(model.contains("int16_t_to_float((const int16_t *)activations1.fc_output, (float *)probs_input_1, 2, 6);"));
        assert!(model.contains("probs(\n    probs_input_1,\n    probs_output\n  );"));
    }

    #[test]
    fn test_conv1d_padding_and_groups() {
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 8, 4])).unwrap();
        g.insert(
            LayerSpec::new(
                "conv",
                LayerKind::Conv1D(Conv {
                    filters: 4,
                    kernel_size: vec![3],
                    strides: vec![1],
                    groups: 2,
                    padding: vec![(1, 1)],
                    activation: Activation::Relu6,
                    kernel: Tensor::from_f32(vec![4, 3, 2], vec![0.0; 24]),
                    bias: None,
                }),
                vec![vec![1, 8, 4]],
                vec![vec![1, 8, 4]],
            ),
            &[x],
            &[],
        )
        .unwrap();
        annotate(&mut g, None, QuantMode::Float32).unwrap();
        let bundle = render(&mut g);

        let conv = bundle.get("conv.c").unwrap();
        assert!(conv.contains("#define ZEROPADDING_LEFT 1"));
        assert!(conv.contains("#define CONV_GROUPS 2"));
        assert!(conv.contains("const NUMBER_T kernel[CONV_FILTERS][CONV_KERNEL_SIZE][CHANNELS_PER_GROUP],"));
        assert!(!conv.contains("bias["));
        assert!(conv.contains("if (output_acc > scale(NUMBER_T, 6, -(INPUT_SCALE_FACTOR + TMP_SCALE_FACTOR), OUTPUT_ROUND_MODE)) {"));
        // No pools: the only layer writes the caller's output buffer.
        let model = bundle.get("model.c").unwrap();
        assert!(!model.contains("static union"));
        assert!(model.contains("conv(\n    input,\n    conv_kernel,\n    conv_output\n  );"));
    }
}
