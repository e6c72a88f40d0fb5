// This module loads per-layer calibration data (the activations range file written by the
// training framework) and turns it into the quantization records attached to graph nodes.
// Each data line names a layer and gives its input, activation, weights and bias scale
// factors plus three round modes. The literal `None` marks an absent value. The graph input
// normally has no line of its own, so the loader synthesizes one from the first input scale
// factor and input round mode found in the file. Annotation runs before the optimizer so that
// activation fusion can move output scale factors onto the fused layer.

//! Calibration data and quantization annotation.

use std::path::Path;

use hashbrown::HashMap;

use crate::core::{CompileError, CompileResult, NumberKind, QuantMode, Quantization, RoundMode};
use crate::graph::{Graph, NodeId};

const FIELDS: usize = 8;

/// Calibration values for one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationEntry {
    pub input_scale_factor: Option<i32>,
    pub activation_scale_factor: Option<i32>,
    pub weights_scale_factor: Option<i32>,
    pub bias_scale_factor: Option<i32>,
    pub input_round_mode: Option<RoundMode>,
    pub activation_round_mode: Option<RoundMode>,
    pub weights_round_mode: Option<RoundMode>,
}

impl CalibrationEntry {
    /// Integer quantization record described by this entry.
    pub fn to_quantization(&self, mode: QuantMode) -> Quantization {
        Quantization {
            kind: mode.kind(),
            width: mode.width(),
            long_width: mode.long_width(),
            weights_scale_factor: self.weights_scale_factor,
            bias_scale_factor: self.bias_scale_factor,
            output_scale_factor: self.activation_scale_factor,
            weights_round_mode: self.weights_round_mode,
            output_round_mode: self.activation_round_mode,
        }
    }
}

/// Calibration entries keyed by layer name, in file order.
#[derive(Debug, Clone, Default)]
pub struct CalibrationTable {
    entries: HashMap<String, CalibrationEntry>,
    order: Vec<String>,
}

impl CalibrationTable {
    /// Load a calibration file, synthesizing the entry of `input_name`.
    pub fn load(path: impl AsRef<Path>, input_name: &str) -> CompileResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, input_name)
    }

    /// Parse calibration text, synthesizing the entry of `input_name`.
    pub fn parse(text: &str, input_name: &str) -> CompileResult<Self> {
        let mut table = Self::default();
        let mut first_input_sf = None;
        let mut first_input_round_mode = None;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            if raw.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
            if fields.len() != FIELDS {
                return Err(CompileError::Calibration {
                    line,
                    reason: format!("expected {FIELDS} comma-separated fields, found {}", fields.len()),
                });
            }
            let entry = CalibrationEntry {
                input_scale_factor: int_or_none(fields[1], line)?,
                activation_scale_factor: int_or_none(fields[2], line)?,
                weights_scale_factor: int_or_none(fields[3], line)?,
                bias_scale_factor: int_or_none(fields[4], line)?,
                input_round_mode: round_mode_or_none(fields[5], line)?,
                activation_round_mode: round_mode_or_none(fields[6], line)?,
                weights_round_mode: round_mode_or_none(fields[7], line)?,
            };
            if first_input_sf.is_none() {
                first_input_sf = entry.input_scale_factor;
            }
            if first_input_round_mode.is_none() {
                first_input_round_mode = entry.input_round_mode;
            }
            table.insert(fields[0].to_string(), entry);
        }

        if !table.is_empty() && table.get(input_name).is_none() {
            table.insert(
                input_name.to_string(),
                CalibrationEntry {
                    input_scale_factor: first_input_sf,
                    activation_scale_factor: first_input_sf,
                    weights_scale_factor: Some(0),
                    bias_scale_factor: None,
                    input_round_mode: first_input_round_mode,
                    activation_round_mode: first_input_round_mode,
                    weights_round_mode: None,
                },
            );
        }
        log::debug!("Loaded calibration data for {} layers", table.len());
        Ok(table)
    }

    pub fn insert(&mut self, name: String, entry: CalibrationEntry) {
        if self.entries.insert(name.clone(), entry).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&CalibrationEntry> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CalibrationEntry)> {
        self.order
            .iter()
            .filter_map(move |name| self.entries.get(name).map(|e| (name.as_str(), e)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn int_or_none(field: &str, line: usize) -> CompileResult<Option<i32>> {
    if field == "None" {
        return Ok(None);
    }
    field
        .parse()
        .map(Some)
        .map_err(|_| CompileError::Calibration { line, reason: format!("invalid scale factor '{field}'") })
}

fn round_mode_or_none(field: &str, line: usize) -> CompileResult<Option<RoundMode>> {
    if field == "None" {
        return Ok(None);
    }
    field
        .parse()
        .map(Some)
        .map_err(|reason| CompileError::Calibration { line, reason })
}

/// Attach a quantization record to every node of `graph`.
///
/// Float mode needs no calibration data. Integer modes look each layer up in
/// `table`; the input falls back to the first following layer that has data
/// and any other layer falls back to its first predecessor's record.
pub fn annotate(graph: &mut Graph, table: Option<&CalibrationTable>, mode: QuantMode) -> CompileResult<()> {
    if mode.kind() != NumberKind::Integer {
        for id in graph.ids().to_vec() {
            graph.node_mut(id).q = Some(Quantization::float(mode.width(), mode.long_width()));
        }
        return Ok(());
    }

    let input_name = graph.input().map(|id| graph.node(id).name().to_string()).unwrap_or_default();
    let table = match table {
        Some(t) if !t.is_empty() => t,
        _ => {
            return Err(CompileError::quantization(
                input_name,
                "no calibration data available, required for fixed-point quantization",
            ))
        }
    };

    for id in graph.ids().to_vec() {
        let node = graph.node(id);
        let q = if let Some(entry) = table.get(node.name()) {
            entry.to_quantization(mode)
        } else if node.preds().is_empty() {
            log::warn!("No quantization information for '{}', looking for a subsequent layer", node.name());
            let Some(source) = first_calibrated_successor(graph, id, table) else {
                return Err(CompileError::quantization(
                    node.name(),
                    "no quantization information and no subsequent layer to borrow from",
                ));
            };
            log::warn!("Applying '{}' quantization information to '{}'", graph.node(source).name(), node.name());
            let Some(entry) = table.get(graph.node(source).name()) else {
                return Err(CompileError::quantization(node.name(), "calibration entry disappeared"));
            };
            entry.to_quantization(mode)
        } else {
            let pred = graph.node(node.preds()[0]);
            log::warn!(
                "No quantization information for '{}', applying first previous layer '{}' information",
                node.name(),
                pred.name()
            );
            match &pred.q {
                Some(q) => q.clone(),
                None => {
                    return Err(CompileError::quantization(
                        node.name(),
                        format!("predecessor '{}' has no quantization information", pred.name()),
                    ))
                }
            }
        };
        graph.node_mut(id).q = Some(q);
    }
    Ok(())
}

fn first_calibrated_successor(graph: &Graph, from: NodeId, table: &CalibrationTable) -> Option<NodeId> {
    let mut next = *graph.node(from).succs().first()?;
    loop {
        let node = graph.node(next);
        if table.get(node.name()).is_some() {
            return Some(next);
        }
        next = *node.succs().first()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{LayerKind, LayerSpec};

    #[test]
    fn test_synthesized_input_entry() {
        let table = CalibrationTable::parse("conv1,4,5,6,7,floor,nearest,floor\n", "input").unwrap();
        let input = table.get("input").unwrap();
        assert_eq!(input.input_scale_factor, Some(4));
        assert_eq!(input.activation_scale_factor, Some(4));
        assert_eq!(input.input_round_mode, Some(RoundMode::Floor));
        assert_eq!(input.activation_round_mode, Some(RoundMode::Floor));
        assert_eq!(input.weights_scale_factor, Some(0));
        assert_eq!(input.bias_scale_factor, None);

        let conv = table.get("conv1").unwrap();
        assert_eq!(conv.weights_scale_factor, Some(6));
        assert_eq!(conv.bias_scale_factor, Some(7));
        assert_eq!(conv.activation_round_mode, Some(RoundMode::Nearest));
    }

    #[test]
    fn test_none_literals() {
        let text = "a,None,3,None,None,None,NONE,floor\nb, 2 ,3,1,None,Nearest,floor,None\n";
        let table = CalibrationTable::parse(text, "x").unwrap();
        let a = table.get("a").unwrap();
        assert_eq!(a.input_scale_factor, None);
        assert_eq!(a.input_round_mode, None);
        assert_eq!(a.activation_round_mode, Some(RoundMode::None));
        // The input entry takes the first values that are present.
        let x = table.get("x").unwrap();
        assert_eq!(x.input_scale_factor, Some(2));
        assert_eq!(x.input_round_mode, Some(RoundMode::Nearest));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_malformed_lines() {
        let err = CalibrationTable::parse("a,1,2,3\n", "x").unwrap_err();
        assert!(matches!(err, CompileError::Calibration { line: 1, .. }));

        let err = CalibrationTable::parse("\na,1,2,x,4,floor,floor,floor\n", "x").unwrap_err();
        assert!(matches!(err, CompileError::Calibration { line: 2, .. }));

        let err = CalibrationTable::parse("a,1,2,3,4,ceil,floor,floor\n", "x").unwrap_err();
        assert!(matches!(err, CompileError::Calibration { line: 1, .. }));
    }

    fn chain() -> Graph {
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("input", vec![1, 2])).unwrap();
        let a = g
            .insert(LayerSpec::new("a", LayerKind::Identity, vec![vec![1, 2]], vec![vec![1, 2]]), &[x], &[])
            .unwrap();
        g.insert(LayerSpec::new("b", LayerKind::Flatten, vec![vec![1, 2]], vec![vec![1, 2]]), &[a], &[])
            .unwrap();
        g
    }

    #[test]
    fn test_annotate_float() {
        let mut g = chain();
        annotate(&mut g, None, QuantMode::Float32).unwrap();
        for node in g.nodes() {
            let q = node.q.as_ref().unwrap();
            assert_eq!(q.kind, NumberKind::Float);
            assert_eq!(q.output_scale_factor, Some(0));
        }
    }

    #[test]
    fn test_annotate_integer_fallbacks() {
        let mut g = chain();
        // No entry for the input nor for "b".
        let mut table = CalibrationTable::default();
        table.insert(
            "a".to_string(),
            CalibrationEntry {
                input_scale_factor: Some(3),
                activation_scale_factor: Some(5),
                weights_scale_factor: None,
                bias_scale_factor: None,
                input_round_mode: Some(RoundMode::Floor),
                activation_round_mode: Some(RoundMode::Floor),
                weights_round_mode: None,
            },
        );
        annotate(&mut g, Some(&table), QuantMode::Int8).unwrap();

        let input = g.node(g.find("input").unwrap()).q.clone().unwrap();
        assert_eq!(input.output_scale_factor, Some(5));
        assert_eq!((input.width, input.long_width), (8, 16));
        let b = g.node(g.find("b").unwrap()).q.clone().unwrap();
        assert_eq!(b, g.node(g.find("a").unwrap()).q.clone().unwrap());
    }

    #[test]
    fn test_annotate_integer_requires_data() {
        let mut g = chain();
        let err = annotate(&mut g, None, QuantMode::Int16).unwrap_err();
        assert!(matches!(err, CompileError::Quantization { .. }));
    }
}
