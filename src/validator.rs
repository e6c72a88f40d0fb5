// This module implements the validator: read-only checks run over every layer of the
// optimized graph before quantization. Each rule inspects one node and either accepts it or
// reports a Validation error naming the layer and the rule that rejected it. The rules are
// independent of each other; the first failure aborts validation of the whole model.

//! Structural validation rules.

use crate::core::{CompileError, CompileResult, RoundMode, ValidationRule};
use crate::graph::{Activation, Graph, LayerKind, Node};

type RuleFn = fn(&Graph, &Node) -> Result<(), String>;

const RULES: [(ValidationRule, RuleFn); 5] = [
    (ValidationRule::ActivationLegality, check_activation),
    (ValidationRule::BatchNormShape, check_batchnorm),
    (ValidationRule::FlattenArity, check_flatten),
    (ValidationRule::GlobalSumPooling, check_global_sum_pooling),
    (ValidationRule::RoundModePresence, check_round_mode),
];

/// Checks a graph against every validation rule.
pub struct Validator;

impl Validator {
    pub fn run(graph: &Graph) -> CompileResult<()> {
        for node in graph.nodes() {
            Self::validate_node(graph, node)?;
        }
        log::debug!("Validated {} layers", graph.len());
        Ok(())
    }

    pub fn validate_node(graph: &Graph, node: &Node) -> CompileResult<()> {
        for (rule, check) in RULES {
            check(graph, node).map_err(|reason| CompileError::validation(node.name(), rule, reason))?;
        }
        Ok(())
    }
}

fn check_activation(_graph: &Graph, node: &Node) -> Result<(), String> {
    let Some(activation) = node.spec.activation() else {
        return Ok(());
    };
    match activation {
        Activation::Linear | Activation::Relu | Activation::Relu6 => Ok(()),
        Activation::Softmax if matches!(node.spec.kind, LayerKind::Activation(_)) => Ok(()),
        Activation::Softmax => Err(format!(
            "softmax must be a standalone layer, not combined with {}",
            node.spec.kind.name()
        )),
        other => Err(format!("activation function {other} is not supported")),
    }
}

fn check_batchnorm(_graph: &Graph, node: &Node) -> Result<(), String> {
    let (LayerKind::BatchNorm1D(bn) | LayerKind::BatchNorm2D(bn)) = &node.spec.kind else {
        return Ok(());
    };
    let channels = node.spec.input_shapes.first().and_then(|s| s.last()).copied();
    for (role, tensor) in [("kernel", &bn.kernel), ("bias", &bn.bias)] {
        if Some(tensor.len()) != channels || tensor.shape.len() != 1 {
            return Err(format!(
                "{role} with shape {:?} does not match last dimension of input shape {:?}",
                tensor.shape, node.spec.input_shapes.first()
            ));
        }
    }
    Ok(())
}

fn check_flatten(_graph: &Graph, node: &Node) -> Result<(), String> {
    if !matches!(node.spec.kind, LayerKind::Flatten) {
        return Ok(());
    }
    if node.preds().len() != 1 {
        return Err("flatten should only have one input".to_string());
    }
    if node.spec.output_shapes.len() != 1 {
        return Err("flatten should only have one output shape".to_string());
    }
    let in_elements: usize = node
        .spec
        .input_shapes
        .iter()
        .map(|s| s.iter().skip(1).product::<usize>())
        .product();
    let out_elements = node.spec.output_shape().last().copied().unwrap_or(0);
    if in_elements != out_elements {
        return Err(format!(
            "input has {in_elements} elements but output shape has {out_elements}"
        ));
    }
    Ok(())
}

fn check_global_sum_pooling(_graph: &Graph, node: &Node) -> Result<(), String> {
    let LayerKind::Sum { dims } = &node.spec.kind else {
        return Ok(());
    };
    if !node.succs().is_empty() {
        return Err("sum is only supported as the last layer".to_string());
    }
    if node.preds().len() != 1 {
        return Err("global sum pooling should only have one input".to_string());
    }
    let rank = node.spec.input_shapes.first().map_or(0, Vec::len);
    let expected: &[isize] = match rank {
        3 => &[-1],
        4 => &[-2, -1],
        _ => {
            return Err(format!(
                "input should have 3 (N, S, C) or 4 (N, H, W, C) dimensions, got {rank}"
            ))
        }
    };
    if dims.as_slice() != expected {
        return Err(format!("rank {rank} input must reduce over {expected:?}, got {dims:?}"));
    }
    Ok(())
}

fn check_round_mode(_graph: &Graph, node: &Node) -> Result<(), String> {
    match &node.q {
        Some(q) if q.is_integer() => match q.output_round_mode {
            None | Some(RoundMode::None) => {
                Err("output round mode must be set for integer layers".to_string())
            }
            Some(_) => Ok(()),
        },
        _ => Ok(()),
    }
}
