// This module drives one compilation from an imported layer graph to generated C. The stages
// run in a fixed order: graph verification, quantization annotation, optimization passes,
// validation, weight quantization, activation allocation and code emission. Each stage takes the
// graph by reference and either succeeds or returns the CompileError that aborts the run; no
// stage is retried. All per-run state (numeric types, statistics, scratch allocations) lives in
// the CompilationSession handed to the Compiler, so two compilations never share anything.

//! End-to-end compilation pipeline.

use crate::allocator::{AllocationPlan, Allocator};
use crate::calibration::{annotate, CalibrationTable};
use crate::core::{CompilationSession, CompileResult, NumberTypes, QuantMode, Stage};
use crate::emitter::{CTemplates, Emitter, SourceBundle, TemplateEngine};
use crate::graph::Graph;
use crate::optimizer::Optimizer;
use crate::quantizer::quantize_graph;
use crate::validator::Validator;

/// Options of a compilation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerOptions {
    pub mode: QuantMode,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self { mode: QuantMode::Float32 }
    }
}

/// Result of a successful compilation.
#[derive(Debug, Clone)]
pub struct Compilation {
    pub bundle: SourceBundle,
    pub plan: AllocationPlan,
    pub number_types: NumberTypes,
}

/// Runs every stage of the pipeline within one session.
pub struct Compiler<'s, 'arena, E: TemplateEngine = CTemplates> {
    session: &'s CompilationSession<'arena>,
    options: CompilerOptions,
    emitter: Emitter<E>,
}

impl<'s, 'arena> Compiler<'s, 'arena, CTemplates> {
    pub fn new(session: &'s CompilationSession<'arena>, options: CompilerOptions) -> Self {
        Self::with_engine(session, options, CTemplates)
    }
}

impl<'s, 'arena, E: TemplateEngine> Compiler<'s, 'arena, E> {
    pub fn with_engine(session: &'s CompilationSession<'arena>, options: CompilerOptions, engine: E) -> Self {
        Self { session, options, emitter: Emitter::new(engine) }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// Compile `graph` in place. `calibration` is required for integer modes.
    pub fn compile(&self, graph: &mut Graph, calibration: Option<&CalibrationTable>) -> CompileResult<Compilation> {
        log::info!("Compiling {} layers in {} mode", graph.len(), self.options.mode);
        graph.verify().map_err(|e| e.in_stage(Stage::Import))?;

        annotate(graph, calibration, self.options.mode)?;
        Optimizer::run(graph, self.session)?;
        log::info!("Optimized graph has {} layers", graph.len());

        Validator::run(graph)?;
        quantize_graph(graph, self.session)?;

        let plan = Allocator::allocate(graph, self.session)?;
        log::debug!("Allocation plan:\n{plan}");

        let number_types = self.session.number_types();
        let bundle = self
            .emitter
            .emit(graph, &plan, &number_types, self.session)
            .map_err(|e| e.in_stage(Stage::Emit))?;
        log::info!("Compilation finished\n{}", self.session.stats());
        Ok(Compilation { bundle, plan, number_types })
    }
}

impl Compilation {
    /// Contents of the single-file output.
    pub fn single_file(&self) -> String {
        self.bundle.single_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CompileError;
    use crate::graph::{Activation, Dense, LayerKind, LayerSpec, Tensor};
    use bumpalo::Bump;

    fn mlp() -> Graph {
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("input 1", vec![1, 2])).unwrap();
        let fc = g
            .insert(
                LayerSpec::new(
                    "dense/1",
                    LayerKind::Dense(Dense {
                        units: 2,
                        activation: Activation::Linear,
                        kernel: Tensor::from_f32(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]),
                        bias: None,
                    }),
                    vec![vec![1, 2]],
                    vec![vec![1, 2]],
                ),
                &[x],
                &[],
            )
            .unwrap();
        let relu = g
            .insert(
                LayerSpec::new("relu", LayerKind::Activation(Activation::Relu), vec![vec![1, 2]], vec![vec![1, 2]]),
                &[fc],
                &[],
            )
            .unwrap();
        g.insert(LayerSpec::new("drop", LayerKind::Dropout { rate: 0.5 }, vec![vec![1, 2]], vec![vec![1, 2]]), &[relu], &[])
            .unwrap();
        g
    }

    #[test]
    fn test_float_pipeline() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = mlp();
        let result = Compiler::new(&session, CompilerOptions::default()).compile(&mut g, None).unwrap();

        // Dropout removed, relu fused, names sanitized.
        assert_eq!(g.len(), 2);
        let paths: Vec<_> = result.bundle.artifacts().iter().map(|a| a.path.as_str()).collect();
        assert!(paths.contains(&"dense1.c"));
        assert!(result.single_file().starts_with("#define SINGLE_FILE\n"));
        assert_eq!(result.plan.pool_count(), 0);
        assert!(session.stats().passes_run >= 5);
    }

    #[test]
    fn test_integer_mode_requires_calibration() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let options = CompilerOptions { mode: QuantMode::Int8 };
        let err = Compiler::new(&session, options).compile(&mut mlp(), None).unwrap_err();
        assert!(matches!(err, CompileError::Quantization { .. }));
    }

    #[test]
    fn test_int8_pipeline() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let table = CalibrationTable::parse(
            "dense/1,5,4,7,None,floor,floor,floor\nrelu,4,4,None,None,floor,floor,None\n",
            "input 1",
        )
        .unwrap();
        let options = CompilerOptions { mode: QuantMode::Int8 };
        let mut g = mlp();
        let result = Compiler::new(&session, options).compile(&mut g, Some(&table)).unwrap();

        let dense = result.bundle.get("dense1.c").unwrap();
        assert!(dense.contains("#define NUMBER_T int8_t"));
        assert!(dense.contains("#define INPUT_SCALE_FACTOR 5"));
        // 1.0 scaled by 2^7 saturates.
        assert!(result.bundle.get("weights/dense1.c").unwrap().contains("{127, 0}"));
    }

    #[test]
    fn test_malformed_graph_fails_at_import() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 2])).unwrap();
        for name in ["a", "b"] {
            g.insert(LayerSpec::new(name, LayerKind::Identity, vec![vec![1, 2]], vec![vec![1, 2]]), &[x], &[])
                .unwrap();
        }

        // "a" is a sink that is not the last node.
        let err = Compiler::new(&session, CompilerOptions::default()).compile(&mut g, None).unwrap_err();
        assert!(matches!(err, CompileError::Structural { .. }));
        assert_eq!(err.layer(), Some("a"));
        assert_eq!(err.stage(), Stage::Import);
        assert_eq!(session.stats().passes_run, 0);
    }
}
