// This module implements the graph optimizer: a fixed, ordered list of rewrite passes that
// shrink the layer graph without changing what it computes. Identity and dropout layers are
// removed outright, explicit zero-padding layers are folded into the convolution that follows,
// standalone RELU/RELU6 layers are folded into the activation field of the layer that feeds
// them (taking the activation's output scale factor along), and finally every layer name is
// rewritten into a valid C identifier. Each pass only uses the graph's insert/delete/replace
// primitives, so the topological order invariant holds after every pass. Passes that can fail
// return a CompileError naming the offending layer and the pipeline stops there.

//! Graph rewrite passes.

use hashbrown::HashSet;

use crate::core::{CompilationSession, CompileError, CompileResult};
use crate::graph::{Activation, Graph, LayerKind, NodeId};

type PassFn = fn(&mut Graph, &CompilationSession<'_>) -> CompileResult<usize>;

/// The optimizer passes, in execution order. Renaming must stay last.
const PASSES: [(&str, PassFn); 5] = [
    ("remove_identity", remove_identity),
    ("remove_dropout", remove_dropout),
    ("fuse_zero_padding", fuse_zero_padding),
    ("fuse_activation", fuse_activation),
    ("rename_operators", rename_operators),
];

/// Runs every rewrite pass over a graph.
pub struct Optimizer;

impl Optimizer {
    /// Run all passes in order, stopping at the first failure.
    pub fn run(graph: &mut Graph, session: &CompilationSession<'_>) -> CompileResult<()> {
        for (name, pass) in PASSES {
            let before = graph.len();
            let changed = pass(graph, session)?;
            debug_assert!(graph.is_topologically_ordered(), "{name} broke the topological order");
            log::debug!("Pass {}: {} rewrites, {} -> {} nodes", name, changed, before, graph.len());
            session.record_pass(name, changed);
        }
        log::debug!("Optimized graph:\n{}", graph.to_dot());
        Ok(())
    }

    /// Names of the passes, in execution order.
    pub fn pass_names() -> impl Iterator<Item = &'static str> {
        PASSES.iter().map(|(name, _)| *name)
    }
}

fn ids_where(graph: &Graph, pred: impl Fn(&LayerKind) -> bool) -> Vec<NodeId> {
    graph
        .ids()
        .iter()
        .copied()
        .filter(|&id| pred(&graph.node(id).spec.kind))
        .collect()
}

/// Delete every `Identity` layer.
pub fn remove_identity(graph: &mut Graph, session: &CompilationSession<'_>) -> CompileResult<usize> {
    let targets = ids_where(graph, |k| matches!(k, LayerKind::Identity));
    for &id in &targets {
        graph.delete_and_splice(id)?;
        session.record_node_removed();
    }
    Ok(targets.len())
}

/// Delete every `Dropout` layer; dropout is the identity at inference time.
pub fn remove_dropout(graph: &mut Graph, session: &CompilationSession<'_>) -> CompileResult<usize> {
    let targets = ids_where(graph, |k| matches!(k, LayerKind::Dropout { .. }));
    for &id in &targets {
        graph.delete_and_splice(id)?;
        session.record_node_removed();
    }
    Ok(targets.len())
}

/// Fold explicit zero padding into the convolutions that consume it.
pub fn fuse_zero_padding(graph: &mut Graph, session: &CompilationSession<'_>) -> CompileResult<usize> {
    let targets = ids_where(graph, |k| {
        matches!(k, LayerKind::ZeroPadding1D { .. } | LayerKind::ZeroPadding2D { .. })
    });

    for &id in &targets {
        let node = graph.node(id);
        let Some((rank, padding)) = node.spec.zero_padding() else {
            return Err(CompileError::structural(node.name(), "expected a zero padding layer"));
        };
        let padding = padding.to_vec();
        let input_shapes = node.spec.input_shapes.clone();
        let succs = node.succs().to_vec();

        for s in succs {
            let succ = &mut graph.node_mut(s).spec;
            let absorbed = match succ.padding_mut() {
                Some((r, field)) if r == rank => {
                    *field = padding.clone();
                    true
                }
                _ => false,
            };
            if !absorbed {
                return Err(CompileError::structural(
                    &succ.name,
                    format!("{} cannot absorb {}D padding", succ.kind.name(), rank),
                ));
            }
            succ.input_shapes = input_shapes.clone();
            log::trace!("Padding {:?} folded into '{}'", padding, succ.name);
        }

        graph.delete_and_splice(id)?;
        session.record_node_fused();
    }
    Ok(targets.len())
}

/// Fold standalone RELU/RELU6 layers into their producer.
///
/// The activation must have exactly one predecessor. When that predecessor
/// feeds other layers too, the activation stays standalone.
pub fn fuse_activation(graph: &mut Graph, session: &CompilationSession<'_>) -> CompileResult<usize> {
    let targets = ids_where(graph, |k| {
        matches!(k, LayerKind::Activation(Activation::Relu | Activation::Relu6))
    });
    let mut fused = 0;

    for id in targets {
        let node = graph.node(id);
        let LayerKind::Activation(activation) = node.spec.kind else {
            return Err(CompileError::structural(node.name(), "expected an activation layer"));
        };
        let [pred] = node.preds() else {
            return Err(CompileError::structural(
                node.name(),
                format!("cannot fuse an activation with {} inputs", node.preds().len()),
            ));
        };
        let pred = *pred;
        if graph.node(pred).succs().len() > 1 {
            log::debug!(
                "Keeping '{}' standalone: '{}' has other consumers",
                node.name(),
                graph.node(pred).name()
            );
            continue;
        }
        let act_q = node.q.clone();
        let act_name = node.name().to_string();

        let target = graph.node_mut(pred);
        let target_name = target.spec.name.clone();
        let Some(field) = target.spec.fusable_activation_mut() else {
            return Err(CompileError::structural(
                target_name,
                format!("cannot fuse '{act_name}': layer has no activation field"),
            ));
        };
        let Some(composed) = field.compose(activation) else {
            return Err(CompileError::structural(
                target_name,
                format!("cannot fuse '{act_name}' onto a {} activation", field),
            ));
        };
        *field = composed;

        if let (Some(aq), Some(tq)) = (act_q, target.q.as_mut()) {
            tq.output_scale_factor = aq.output_scale_factor;
            if aq.output_round_mode.is_some() {
                tq.output_round_mode = aq.output_round_mode;
            }
        }

        graph.delete_and_splice(id)?;
        session.record_node_fused();
        log::debug!("Fused '{}' into '{}' ({})", act_name, target_name, composed);
        fused += 1;
    }
    Ok(fused)
}

/// Characters of `name` that may appear in a C identifier.
pub fn c_identifier(name: &str) -> String {
    let mut out: String = name.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_').collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Rewrite every layer name into a valid C identifier.
pub fn rename_operators(graph: &mut Graph, _session: &CompilationSession<'_>) -> CompileResult<usize> {
    let ids = graph.ids().to_vec();
    let mut taken = HashSet::with_capacity(ids.len());
    let mut renames = Vec::new();

    for &id in &ids {
        let name = graph.node(id).name();
        let new_name = c_identifier(name);
        if new_name.is_empty() {
            return Err(CompileError::structural(name, "name has no valid C identifier characters"));
        }
        if !taken.insert(new_name.clone()) {
            return Err(CompileError::structural(
                name,
                format!("renamed to '{new_name}' which is already used"),
            ));
        }
        if new_name != name {
            renames.push((id, new_name));
        }
    }

    for (id, new_name) in &renames {
        log::trace!("Renaming '{}' to '{}'", graph.node(*id).name(), new_name);
        graph.node_mut(*id).spec.name = new_name.clone();
    }
    Ok(renames.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NumberKind, Quantization, RoundMode};
    use crate::graph::{Conv, Dense, LayerSpec, Tensor};
    use bumpalo::Bump;

    fn dense(name: &str, activation: Activation) -> LayerSpec {
        LayerSpec::new(
            name,
            LayerKind::Dense(Dense {
                units: 2,
                activation,
                kernel: Tensor::from_f32(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]),
                bias: None,
            }),
            vec![vec![1, 2]],
            vec![vec![1, 2]],
        )
    }

    fn act(name: &str, a: Activation) -> LayerSpec {
        LayerSpec::new(name, LayerKind::Activation(a), vec![vec![1, 2]], vec![vec![1, 2]])
    }

    fn conv1d(name: &str) -> LayerSpec {
        LayerSpec::new(
            name,
            LayerKind::Conv1D(Conv {
                filters: 1,
                kernel_size: vec![1],
                strides: vec![1],
                groups: 1,
                padding: vec![(0, 0)],
                activation: Activation::Linear,
                kernel: Tensor::from_f32(vec![1, 1, 1], vec![1.0]),
                bias: None,
            }),
            vec![vec![1, 6, 1]],
            vec![vec![1, 6, 1]],
        )
    }

    fn int_q(output_sf: i32) -> Quantization {
        Quantization {
            kind: NumberKind::Integer,
            width: 8,
            long_width: 16,
            weights_scale_factor: Some(6),
            bias_scale_factor: None,
            output_scale_factor: Some(output_sf),
            weights_round_mode: Some(RoundMode::Floor),
            output_round_mode: Some(RoundMode::Floor),
        }
    }

    #[test]
    fn test_fuse_relu_copies_scale_factor() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 2])).unwrap();
        let fc = g.insert(dense("fc", Activation::Linear), &[x], &[]).unwrap();
        let relu = g.insert(act("relu", Activation::Relu), &[fc], &[]).unwrap();
        g.node_mut(fc).q = Some(int_q(3));
        let mut relu_q = int_q(5);
        relu_q.output_round_mode = Some(RoundMode::Nearest);
        g.node_mut(relu).q = Some(relu_q);

        assert_eq!(fuse_activation(&mut g, &session).unwrap(), 1);
        assert!(!g.contains(relu));
        assert_eq!(g.node(fc).spec.activation(), Some(Activation::Relu));
        let q = g.node(fc).q.as_ref().unwrap();
        assert_eq!(q.output_scale_factor, Some(5));
        assert_eq!(q.output_round_mode, Some(RoundMode::Nearest));
        g.verify().unwrap();
    }

    #[test]
    fn test_softmax_is_never_fused() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 2])).unwrap();
        let fc = g.insert(dense("fc", Activation::Linear), &[x], &[]).unwrap();
        let sm = g.insert(act("softmax", Activation::Softmax), &[fc], &[]).unwrap();

        assert_eq!(fuse_activation(&mut g, &session).unwrap(), 0);
        assert!(g.contains(sm));
        assert_eq!(g.node(fc).spec.activation(), Some(Activation::Linear));
    }

    #[test]
    fn test_fuse_onto_layer_without_activation_fails() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 2])).unwrap();
        let flat = g
            .insert(LayerSpec::new("flat", LayerKind::Flatten, vec![vec![1, 2]], vec![vec![1, 2]]), &[x], &[])
            .unwrap();
        g.insert(act("relu", Activation::Relu), &[flat], &[]).unwrap();

        let err = fuse_activation(&mut g, &session).unwrap_err();
        assert_eq!(err.layer(), Some("flat"));
    }

    #[test]
    fn test_multi_input_activation_is_rejected() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 2])).unwrap();
        let a = g.insert(dense("a", Activation::Linear), &[x], &[]).unwrap();
        let b = g.insert(dense("b", Activation::Linear), &[x], &[]).unwrap();
        g.insert(act("relu", Activation::Relu), &[a, b], &[]).unwrap();

        let err = fuse_activation(&mut g, &session).unwrap_err();
        assert!(matches!(err, CompileError::Structural { .. }));
        assert_eq!(err.layer(), Some("relu"));
    }

    #[test]
    fn test_fan_out_keeps_activation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 2])).unwrap();
        let fc = g.insert(dense("fc", Activation::Linear), &[x], &[]).unwrap();
        let relu = g.insert(act("relu", Activation::Relu), &[fc], &[]).unwrap();
        let other = g.insert(dense("other", Activation::Linear), &[fc], &[]).unwrap();
        g.insert(
            LayerSpec::new("add", LayerKind::Add { activation: Activation::Linear }, vec![vec![1, 2]; 2], vec![vec![1, 2]]),
            &[relu, other],
            &[],
        )
        .unwrap();

        assert_eq!(fuse_activation(&mut g, &session).unwrap(), 0);
        assert!(g.contains(relu));
        assert_eq!(g.node(fc).spec.activation(), Some(Activation::Linear));
    }

    #[test]
    fn test_zero_padding_is_folded() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 4, 1])).unwrap();
        let pad = g
            .insert(
                LayerSpec::new(
                    "pad",
                    LayerKind::ZeroPadding1D { padding: vec![(1, 1)] },
                    vec![vec![1, 4, 1]],
                    vec![vec![1, 6, 1]],
                ),
                &[x],
                &[],
            )
            .unwrap();
        let conv = g.insert(conv1d("conv"), &[pad], &[]).unwrap();

        assert_eq!(fuse_zero_padding(&mut g, &session).unwrap(), 1);
        assert!(!g.contains(pad));
        let spec = &g.node(conv).spec;
        assert_eq!(spec.input_shapes, vec![vec![1, 4, 1]]);
        match &spec.kind {
            LayerKind::Conv1D(c) => assert_eq!(c.padding, vec![(1, 1)]),
            other => panic!("unexpected kind {other:?}"),
        }
        g.verify().unwrap();
    }

    #[test]
    fn test_zero_padding_needs_padding_field() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 2])).unwrap();
        let pad = g
            .insert(
                LayerSpec::new("pad", LayerKind::ZeroPadding1D { padding: vec![(1, 0)] }, vec![vec![1, 2]], vec![vec![1, 3]]),
                &[x],
                &[],
            )
            .unwrap();
        g.insert(dense("fc", Activation::Linear), &[pad], &[]).unwrap();

        let err = fuse_zero_padding(&mut g, &session).unwrap_err();
        assert_eq!(err.layer(), Some("fc"));
    }

    #[test]
    fn test_rename_operators() {
        assert_eq!(c_identifier("features.0.conv"), "features0conv");
        assert_eq!(c_identifier("1st"), "_1st");

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("input", vec![1, 2])).unwrap();
        let fc = g.insert(dense("block.fc", Activation::Linear), &[x], &[]).unwrap();
        assert_eq!(rename_operators(&mut g, &session).unwrap(), 1);
        assert_eq!(g.node(fc).name(), "blockfc");

        g.insert(dense("blockfc.", Activation::Linear), &[fc], &[]).unwrap();
        assert!(rename_operators(&mut g, &session).is_err());
    }

    #[test]
    fn test_pass_order() {
        let names: Vec<_> = Optimizer::pass_names().collect();
        assert_eq!(names.last(), Some(&"rename_operators"));
        assert_eq!(names.len(), 5);
    }
}
