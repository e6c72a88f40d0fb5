//! Line parser for the `.nnir` text format.

use hashbrown::HashMap;

use crate::core::{CompileError, CompileResult, Stage};
use crate::graph::{
    Activation, BatchNorm, Conv, Dense, Graph, LayerKind, LayerSpec, NodeId, Pool, SampleNormMode, Shape,
    SliceRange, Tensor,
};

/// Parse a whole model.
pub fn parse_model(text: &str) -> CompileResult<Graph> {
    let decls = Parser::new(text).parse()?;
    build(decls)
}

fn error(line: usize, reason: impl Into<String>) -> CompileError {
    CompileError::Parse { line, reason: reason.into() }
}

#[derive(Debug)]
struct LayerDecl<'a> {
    line: usize,
    name: &'a str,
    kind: &'a str,
    inputs: Vec<&'a str>,
    params: Vec<(&'a str, &'a str)>,
    output: Shape,
}

#[derive(Debug, Default)]
struct Decls<'a> {
    layers: Vec<LayerDecl<'a>>,
    /// `(layer, role)` to the declaring line and the tensor.
    weights: HashMap<(&'a str, &'a str), (usize, Tensor)>,
}

struct Parser<'a> {
    text: &'a str,
    decls: Decls<'a>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, decls: Decls::default() }
    }

    fn parse(mut self) -> CompileResult<Decls<'a>> {
        let text = self.text;
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.split(';').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let mut cursor = Cursor { text: content, pos: 0, line };
            let head = cursor.read_token()?;
            cursor.skip_whitespace();
            match cursor.peek() {
                Some('=') => {
                    let decl = self.parse_layer(&mut cursor, head)?;
                    self.decls.layers.push(decl);
                }
                Some('[') => self.parse_weights(&mut cursor, head)?,
                other => {
                    return Err(error(line, format!("expected '=' or '[' after '{head}', found {other:?}")));
                }
            }
        }
        Ok(self.decls)
    }

    /// `name = kind(input, ...) key=value ... -> [d0, d1, ...]`
    fn parse_layer(&self, cursor: &mut Cursor<'a>, name: &'a str) -> CompileResult<LayerDecl<'a>> {
        cursor.expect('=')?;
        let kind = cursor.read_token()?;
        cursor.expect('(')?;
        let mut inputs = Vec::new();
        if !cursor.try_read(')') {
            loop {
                inputs.push(cursor.read_token()?);
                if cursor.try_read(')') {
                    break;
                }
                cursor.expect(',')?;
            }
        }

        let mut params = Vec::new();
        loop {
            cursor.skip_whitespace();
            if cursor.rest().starts_with("->") {
                cursor.pos += 2;
                break;
            }
            if cursor.is_eof() {
                return Err(error(cursor.line, format!("missing output shape of '{name}'")));
            }
            let key = cursor.read_token()?;
            cursor.expect('=')?;
            let value = cursor.read_value()?;
            params.push((key, value));
        }
        let output = cursor.read_shape()?;
        cursor.expect_eof()?;
        Ok(LayerDecl { line: cursor.line, name, kind, inputs, params, output })
    }

    /// `name.role [d0, ...] = v0 v1 ...`
    fn parse_weights(&mut self, cursor: &mut Cursor<'a>, target: &'a str) -> CompileResult<()> {
        let line = cursor.line;
        let Some((layer, role)) = target.rsplit_once('.') else {
            return Err(error(line, format!("weights target '{target}' should be <layer>.<role>")));
        };
        let shape = cursor.read_shape()?;
        cursor.expect('=')?;
        let mut values = Vec::new();
        for token in cursor.rest().split_whitespace() {
            let value = token.parse::<f32>().map_err(|_| error(line, format!("invalid value '{token}'")))?;
            values.push(value);
        }
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(error(line, format!("shape {shape:?} needs {expected} values, found {}", values.len())));
        }
        if self.decls.weights.insert((layer, role), (line, Tensor::from_f32(shape, values))).is_some() {
            return Err(error(line, format!("duplicate weights for {target}")));
        }
        Ok(())
    }
}

/// Cursor over one line.
struct Cursor<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace();
        if self.peek() == Some(ch) {
            self.pos += ch.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> CompileResult<()> {
        if !self.try_read(ch) {
            return Err(error(self.line, format!("expected '{ch}' but found {:?}", self.peek())));
        }
        Ok(())
    }

    fn expect_eof(&mut self) -> CompileResult<()> {
        self.skip_whitespace();
        if !self.is_eof() {
            return Err(error(self.line, format!("unexpected trailing text '{}'", self.rest())));
        }
        Ok(())
    }

    fn read_while(&mut self, keep: impl Fn(char) -> bool) -> &'a str {
        self.skip_whitespace();
        let rest = self.rest();
        let len = rest.find(|c: char| !keep(c)).unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    /// A layer name, kind or key.
    fn read_token(&mut self) -> CompileResult<&'a str> {
        let token = self.read_while(|c| !c.is_whitespace() && !"=(),[]".contains(c));
        if token.is_empty() {
            return Err(error(self.line, format!("expected identifier but found {:?}", self.peek())));
        }
        Ok(token)
    }

    /// A parameter value, up to the next whitespace.
    fn read_value(&mut self) -> CompileResult<&'a str> {
        let value = self.read_while(|c| !c.is_whitespace());
        if value.is_empty() {
            return Err(error(self.line, "expected a value"));
        }
        Ok(value)
    }

    /// `[d0, d1, ...]`
    fn read_shape(&mut self) -> CompileResult<Shape> {
        self.expect('[')?;
        let mut shape = Vec::new();
        if self.try_read(']') {
            return Ok(shape);
        }
        loop {
            let token = self.read_token()?;
            shape.push(token.parse().map_err(|_| error(self.line, format!("invalid dimension '{token}'")))?);
            if self.try_read(']') {
                return Ok(shape);
            }
            self.expect(',')?;
        }
    }
}

/// Parameters of one layer declaration.
struct Params<'d, 'a> {
    decl: &'d LayerDecl<'a>,
}

impl<'d, 'a> Params<'d, 'a> {
    fn allow(&self, keys: &[&str]) -> CompileResult<()> {
        for (key, _) in &self.decl.params {
            if !keys.contains(key) {
                return Err(error(self.decl.line, format!("unknown parameter '{key}' for {}", self.decl.kind)));
            }
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.decl.params.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, value: &str) -> CompileResult<T> {
        value
            .parse()
            .map_err(|_| error(self.decl.line, format!("invalid value '{value}' for {key}")))
    }

    fn number<T: std::str::FromStr>(&self, key: &str, default: T) -> CompileResult<T> {
        match self.get(key) {
            Some(value) => self.parse(key, value),
            None => Ok(default),
        }
    }

    fn list<T: std::str::FromStr>(&self, key: &str, default: Vec<T>) -> CompileResult<Vec<T>> {
        match self.get(key) {
            Some(value) => value.split(',').map(|v| self.parse(key, v)).collect(),
            None => Ok(default),
        }
    }

    fn activation(&self) -> CompileResult<Activation> {
        match self.get("activation") {
            Some(value) => value.parse().map_err(|reason: String| error(self.decl.line, reason)),
            None => Ok(Activation::Linear),
        }
    }

    /// `before:after` pairs, one per spatial dimension.
    fn padding(&self, rank: usize) -> CompileResult<Vec<(usize, usize)>> {
        let Some(value) = self.get("padding") else {
            return Ok(vec![(0, 0); rank]);
        };
        value
            .split(',')
            .map(|pair| -> CompileResult<(usize, usize)> {
                let (before, after) = pair.split_once(':').unwrap_or((pair, pair));
                Ok((self.parse("padding", before)?, self.parse("padding", after)?))
            })
            .collect()
    }

    /// `start:stop:step` ranges, one per dimension including batch.
    fn slices(&self) -> CompileResult<Vec<SliceRange>> {
        let Some(value) = self.get("slices") else {
            return Err(error(self.decl.line, "slice needs a slices parameter"));
        };
        value
            .split(',')
            .map(|range| -> CompileResult<SliceRange> {
                let parts: Vec<&str> = range.split(':').collect();
                let [start, stop, step] = parts.as_slice() else {
                    return Err(error(self.decl.line, format!("slice range '{range}' should be start:stop:step")));
                };
                Ok(SliceRange {
                    start: self.parse("slices", start)?,
                    stop: self.parse("slices", stop)?,
                    step: self.parse("slices", step)?,
                })
            })
            .collect()
    }
}

/// Kernel dimensions between the filter and channel axes.
fn spatial_dims(kernel: &Tensor) -> Vec<usize> {
    match kernel.shape.len() {
        0..=2 => vec![1],
        n => kernel.shape[1..n - 1].to_vec(),
    }
}

fn as_values(decl: &LayerDecl<'_>, role: &str, tensor: Tensor) -> CompileResult<Vec<f32>> {
    tensor
        .as_f32()
        .map(<[f32]>::to_vec)
        .ok_or_else(|| error(decl.line, format!("{}.{role} must hold float values", decl.name)))
}

struct Builder<'a> {
    weights: HashMap<(&'a str, &'a str), (usize, Tensor)>,
}

impl<'a> Builder<'a> {
    fn take(&mut self, decl: &LayerDecl<'a>, role: &'a str) -> Option<Tensor> {
        self.weights.remove(&(decl.name, role)).map(|(_, tensor)| tensor)
    }

    fn require(&mut self, decl: &LayerDecl<'a>, role: &'a str) -> CompileResult<Tensor> {
        self.take(decl, role)
            .ok_or_else(|| error(decl.line, format!("missing weights {}.{role}", decl.name)))
    }

    fn conv(&mut self, decl: &LayerDecl<'a>, rank: usize) -> CompileResult<Conv> {
        let p = Params { decl };
        p.allow(&["filters", "kernel_size", "strides", "groups", "padding", "activation"])?;
        let kernel = self.require(decl, "kernel")?;
        Ok(Conv {
            filters: p.number("filters", decl.output.last().copied().unwrap_or(0))?,
            kernel_size: p.list("kernel_size", spatial_dims(&kernel))?,
            strides: p.list("strides", vec![1; rank])?,
            groups: p.number("groups", 1)?,
            padding: p.padding(rank)?,
            activation: p.activation()?,
            bias: self.take(decl, "bias"),
            kernel,
        })
    }

    fn pool(&self, decl: &LayerDecl<'a>, rank: usize) -> CompileResult<Pool> {
        let p = Params { decl };
        p.allow(&["pool_size", "strides", "activation"])?;
        let pool_size: Vec<usize> = p.list("pool_size", vec![2; rank])?;
        Ok(Pool {
            strides: p.list("strides", pool_size.clone())?,
            pool_size,
            activation: p.activation()?,
        })
    }

    /// Either a folded `kernel`/`bias` pair or the running statistics
    /// (`moving_mean`, `moving_variance`, optional `gamma` and `beta`) with `epsilon`.
    fn batchnorm(&mut self, decl: &LayerDecl<'a>) -> CompileResult<BatchNorm> {
        let p = Params { decl };
        p.allow(&["activation", "epsilon"])?;
        let activation = p.activation()?;

        if let Some(kernel) = self.take(decl, "kernel") {
            if p.get("epsilon").is_some() {
                return Err(error(decl.line, "epsilon only applies to batchnorm statistics"));
            }
            return Ok(BatchNorm { activation, kernel, bias: self.require(decl, "bias")? });
        }

        let mean = self.statistic(decl, "moving_mean")?;
        let variance = self.statistic(decl, "moving_variance")?;
        let gamma = match self.take(decl, "gamma") {
            Some(tensor) => as_values(decl, "gamma", tensor)?,
            None => vec![1.0; mean.len()],
        };
        let beta = match self.take(decl, "beta") {
            Some(tensor) => as_values(decl, "beta", tensor)?,
            None => vec![0.0; mean.len()],
        };
        let epsilon = p.number("epsilon", 1e-3)?;
        BatchNorm::from_statistics(&gamma, &beta, &mean, &variance, epsilon, activation).ok_or_else(|| {
            error(
                decl.line,
                format!(
                    "batchnorm statistics of '{}' differ in length (gamma {}, beta {}, mean {}, variance {})",
                    decl.name,
                    gamma.len(),
                    beta.len(),
                    mean.len(),
                    variance.len()
                ),
            )
        })
    }

    fn statistic(&mut self, decl: &LayerDecl<'a>, role: &'a str) -> CompileResult<Vec<f32>> {
        let tensor = self.require(decl, role)?;
        as_values(decl, role, tensor)
    }

    fn kind(&mut self, decl: &LayerDecl<'a>) -> CompileResult<LayerKind> {
        let p = Params { decl };
        let kind = match decl.kind {
            "conv1d" => LayerKind::Conv1D(self.conv(decl, 1)?),
            "conv2d" => LayerKind::Conv2D(self.conv(decl, 2)?),
            "dense" => {
                p.allow(&["units", "activation"])?;
                LayerKind::Dense(Dense {
                    units: p.number("units", decl.output.last().copied().unwrap_or(0))?,
                    activation: p.activation()?,
                    kernel: self.require(decl, "kernel")?,
                    bias: self.take(decl, "bias"),
                })
            }
            "maxpool1d" => LayerKind::MaxPool1D(self.pool(decl, 1)?),
            "maxpool2d" => LayerKind::MaxPool2D(self.pool(decl, 2)?),
            "avgpool1d" => LayerKind::AvgPool1D(self.pool(decl, 1)?),
            "avgpool2d" => LayerKind::AvgPool2D(self.pool(decl, 2)?),
            "batchnorm1d" => LayerKind::BatchNorm1D(self.batchnorm(decl)?),
            "batchnorm2d" => LayerKind::BatchNorm2D(self.batchnorm(decl)?),
            "activation" => {
                p.allow(&["activation"])?;
                LayerKind::Activation(p.activation()?)
            }
            "add" => {
                p.allow(&["activation"])?;
                LayerKind::Add { activation: p.activation()? }
            }
            "flatten" | "identity" => {
                p.allow(&[])?;
                if decl.kind == "flatten" { LayerKind::Flatten } else { LayerKind::Identity }
            }
            "dropout" => {
                p.allow(&["rate"])?;
                LayerKind::Dropout { rate: p.number("rate", 0.5)? }
            }
            "zeropadding1d" => {
                p.allow(&["padding"])?;
                LayerKind::ZeroPadding1D { padding: p.padding(1)? }
            }
            "zeropadding2d" => {
                p.allow(&["padding"])?;
                LayerKind::ZeroPadding2D { padding: p.padding(2)? }
            }
            "concatenate" => {
                p.allow(&["axis"])?;
                LayerKind::Concatenate { axis: p.number("axis", -1)? }
            }
            "slice" => {
                p.allow(&["slices"])?;
                LayerKind::Slice { slices: p.slices()? }
            }
            "sum" => {
                p.allow(&["dims"])?;
                LayerKind::Sum { dims: p.list("dims", vec![-1])? }
            }
            "samplenorm" => {
                p.allow(&["mode"])?;
                let mode = match p.get("mode").unwrap_or("minmax") {
                    "minmax" => SampleNormMode::MinMax,
                    "zscore" => SampleNormMode::ZScore,
                    other => return Err(error(decl.line, format!("unknown samplenorm mode '{other}'"))),
                };
                LayerKind::SampleNorm { mode }
            }
            "permute" => {
                p.allow(&["dims"])?;
                LayerKind::Permute { dims: p.list("dims", Vec::new())? }
            }
            "upsample" => {
                p.allow(&["scale_factor"])?;
                LayerKind::Upsample { scale_factor: p.list("scale_factor", vec![2])? }
            }
            other => return Err(error(decl.line, format!("unknown layer kind '{other}'"))),
        };
        Ok(kind)
    }
}

fn build(decls: Decls<'_>) -> CompileResult<Graph> {
    let mut graph = Graph::new();
    let mut ids: HashMap<&str, NodeId> = HashMap::new();
    let mut builder = Builder { weights: decls.weights };

    let Some((first, rest)) = decls.layers.split_first() else {
        return Err(error(0, "model declares no layer"));
    };
    if first.kind != "input" || !first.inputs.is_empty() {
        return Err(error(first.line, "the first layer must be `input()`"));
    }
    let input = graph
        .add_input(LayerSpec::input(first.name, first.output.clone()))
        .map_err(|e| e.in_stage(Stage::Import))?;
    ids.insert(first.name, input);

    for decl in rest {
        if ids.contains_key(decl.name) {
            return Err(error(decl.line, format!("layer '{}' is declared twice", decl.name)));
        }
        let mut preds = Vec::with_capacity(decl.inputs.len());
        let mut input_shapes = Vec::with_capacity(decl.inputs.len());
        for name in &decl.inputs {
            let Some(&id) = ids.get(name) else {
                return Err(error(decl.line, format!("unknown input layer '{name}'")));
            };
            preds.push(id);
            input_shapes.push(graph.node(id).spec.output_shape().to_vec());
        }
        if preds.is_empty() {
            return Err(error(decl.line, format!("layer '{}' has no input", decl.name)));
        }
        let kind = builder.kind(decl)?;
        let spec = LayerSpec::new(decl.name, kind, input_shapes, vec![decl.output.clone()]);
        let id = graph.insert(spec, &preds, &[]).map_err(|e| e.in_stage(Stage::Import))?;
        ids.insert(decl.name, id);
    }

    if let Some(((layer, role), (line, _))) = builder.weights.iter().next() {
        return Err(error(*line, format!("weights {layer}.{role} do not belong to any layer parameter")));
    }
    log::debug!("Parsed model with {} layers", graph.len());
    Ok(graph)
}
