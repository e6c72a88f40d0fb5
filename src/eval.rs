// This module implements a floating point reference interpreter over the layer graph. It runs
// one sample through the graph in topological order, keeping every layer output as a flat
// channels-last buffer, and is used to check that graph rewrites preserve the function computed
// by the model. It covers the layer kinds the optimizer rewrites and their usual neighbours;
// other kinds are reported as unsupported rather than approximated.

//! Reference float evaluation of a layer graph.

use hashbrown::HashMap;

use crate::core::{CompileError, CompileResult};
use crate::graph::{Activation, BatchNorm, Conv, Dense, Graph, LayerKind, Node, NodeId, Pool, Tensor};

/// Evaluate `graph` on one input sample, returning the flattened output of
/// the last layer.
pub fn evaluate(graph: &Graph, input: &[f32]) -> CompileResult<Vec<f32>> {
    let mut values: HashMap<NodeId, Vec<f32>> = HashMap::new();
    for &id in graph.ids() {
        let node = graph.node(id);
        let inputs: Vec<&[f32]> = node
            .preds()
            .iter()
            .map(|p| values.get(p).map(Vec::as_slice).unwrap_or(&[]))
            .collect();
        let output = match &node.spec.kind {
            LayerKind::Input => {
                if input.len() != node.spec.output_elements() {
                    return Err(CompileError::structural(
                        node.name(),
                        format!("expected {} input values, got {}", node.spec.output_elements(), input.len()),
                    ));
                }
                input.to_vec()
            }
            LayerKind::Dense(dense) => eval_dense(node, dense, first(&inputs))?,
            LayerKind::Conv1D(conv) => eval_conv1d(node, conv, first(&inputs))?,
            LayerKind::MaxPool1D(pool) => eval_pool1d(node, pool, first(&inputs), true)?,
            LayerKind::AvgPool1D(pool) => eval_pool1d(node, pool, first(&inputs), false)?,
            LayerKind::BatchNorm1D(bn) | LayerKind::BatchNorm2D(bn) => eval_batchnorm(node, bn, first(&inputs))?,
            LayerKind::ZeroPadding1D { padding } => eval_zero_padding1d(node, padding, first(&inputs))?,
            LayerKind::Activation(Activation::Softmax) => softmax(first(&inputs), channels(node)),
            LayerKind::Activation(activation) => activate(node, *activation, first(&inputs).to_vec())?,
            LayerKind::Add { activation } => {
                let mut sum = vec![0.0; node.spec.output_elements()];
                for operand in &inputs {
                    for (acc, v) in sum.iter_mut().zip(operand.iter()) {
                        *acc += v;
                    }
                }
                activate(node, *activation, sum)?
            }
            LayerKind::Flatten | LayerKind::Identity | LayerKind::Dropout { .. } => first(&inputs).to_vec(),
            other => {
                return Err(CompileError::structural(
                    node.name(),
                    format!("{} is not supported by the reference evaluator", other.name()),
                ))
            }
        };
        values.insert(id, output);
    }
    let last = graph
        .output()
        .ok_or_else(|| CompileError::structural("", "cannot evaluate an empty graph"))?;
    Ok(values.remove(&last).unwrap_or_default())
}

fn first<'a>(inputs: &[&'a [f32]]) -> &'a [f32] {
    inputs.first().copied().unwrap_or(&[])
}

fn channels(node: &Node) -> usize {
    node.spec.output_shape().last().copied().unwrap_or(1).max(1)
}

fn weight(tensor: &Tensor, i: usize) -> f32 {
    tensor.get(i) as f32
}

fn activate(node: &Node, activation: Activation, mut values: Vec<f32>) -> CompileResult<Vec<f32>> {
    match activation {
        Activation::Linear => {}
        Activation::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
        Activation::Relu6 => values.iter_mut().for_each(|v| *v = v.clamp(0.0, 6.0)),
        Activation::Softmax => return Ok(softmax(&values, channels(node))),
        other => {
            return Err(CompileError::structural(node.name(), format!("cannot evaluate activation {other}")))
        }
    }
    Ok(values)
}

fn softmax(values: &[f32], channels: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(values.len());
    for row in values.chunks(channels) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
        let sum: f32 = exp.iter().sum();
        out.extend(exp.iter().map(|e| e / sum));
    }
    out
}

/// `(samples, channels)` of a rank 3 shape.
fn samples_channels(node: &Node, shape: &[usize]) -> CompileResult<(usize, usize)> {
    match shape {
        [_, samples, channels] => Ok((*samples, *channels)),
        _ => Err(CompileError::structural(node.name(), format!("expected a rank 3 shape, got {shape:?}"))),
    }
}

fn input_shape(node: &Node) -> &[usize] {
    node.spec.input_shapes.first().map_or(&[][..], Vec::as_slice)
}

fn eval_dense(node: &Node, dense: &Dense, input: &[f32]) -> CompileResult<Vec<f32>> {
    let n = input.len();
    let mut out = Vec::with_capacity(dense.units);
    for k in 0..dense.units {
        let mut acc: f32 = (0..n).map(|z| weight(&dense.kernel, k * n + z) * input[z]).sum();
        if let Some(bias) = &dense.bias {
            acc += weight(bias, k);
        }
        out.push(acc);
    }
    activate(node, dense.activation, out)
}

fn eval_conv1d(node: &Node, conv: &Conv, input: &[f32]) -> CompileResult<Vec<f32>> {
    let (samples, in_channels) = samples_channels(node, input_shape(node))?;
    let (out_samples, filters) = samples_channels(node, node.spec.output_shape())?;
    let kernel_size = conv.kernel_size.first().copied().unwrap_or(1);
    let stride = conv.strides.first().copied().unwrap_or(1);
    let groups = conv.groups.max(1);
    let (left, _) = conv.padding.first().copied().unwrap_or((0, 0));
    let per_group = in_channels / groups;
    let filters_per_group = (filters / groups).max(1);

    let mut out = Vec::with_capacity(out_samples * filters);
    for pos in 0..out_samples {
        for k in 0..filters {
            let mut acc = 0.0;
            for x in 0..kernel_size {
                let Some(sample) = (pos * stride + x).checked_sub(left).filter(|&s| s < samples) else {
                    continue;
                };
                for z in 0..per_group {
                    let channel = z + (k / filters_per_group) * per_group;
                    let w = weight(&conv.kernel, (k * kernel_size + x) * per_group + z);
                    acc += w * input[sample * in_channels + channel];
                }
            }
            if let Some(bias) = &conv.bias {
                acc += weight(bias, k);
            }
            out.push(acc);
        }
    }
    activate(node, conv.activation, out)
}

fn eval_pool1d(node: &Node, pool: &Pool, input: &[f32], max: bool) -> CompileResult<Vec<f32>> {
    let (_, channels) = samples_channels(node, input_shape(node))?;
    let (out_samples, _) = samples_channels(node, node.spec.output_shape())?;
    let size = pool.pool_size.first().copied().unwrap_or(1);
    let stride = pool.strides.first().copied().unwrap_or(1);

    let mut out = vec![0.0; out_samples * channels];
    for pos in 0..out_samples {
        for k in 0..channels {
            let window = (0..size).map(|x| input[(pos * stride + x) * channels + k]);
            out[pos * channels + k] = if max {
                window.fold(f32::NEG_INFINITY, f32::max)
            } else {
                window.sum::<f32>() / size as f32
            };
        }
    }
    activate(node, pool.activation, out)
}

fn eval_batchnorm(node: &Node, bn: &BatchNorm, input: &[f32]) -> CompileResult<Vec<f32>> {
    let channels = bn.kernel.len().max(1);
    let out = input
        .iter()
        .enumerate()
        .map(|(i, v)| v * weight(&bn.kernel, i % channels) + weight(&bn.bias, i % channels))
        .collect();
    activate(node, bn.activation, out)
}

fn eval_zero_padding1d(node: &Node, padding: &[(usize, usize)], input: &[f32]) -> CompileResult<Vec<f32>> {
    let (samples, channels) = samples_channels(node, input_shape(node))?;
    let (left, right) = padding.first().copied().unwrap_or((0, 0));
    let mut out = vec![0.0; (left + samples + right) * channels];
    out[left * channels..(left + samples) * channels].copy_from_slice(&input[..samples * channels]);
    Ok(out)
}
