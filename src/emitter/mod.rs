// This module implements the code emitter, the last stage of the pipeline. It walks the
// quantized and allocated graph in order and asks a template engine for every artifact of the
// generated C project: the defines header, the numeric types header, then for each layer its
// header, its implementation and (when it has parameters) its weights, and finally the model
// header and the model source chaining all layer calls. The engine is a trait so the rendering
// service stays opaque to the emitter; CTemplates is the engine shipped with the compiler.
// Artifacts are collected in a SourceBundle that can be written to a directory tree or
// concatenated into a single translation unit.

//! C source generation.

pub mod carray;
pub mod templates;

use std::fmt;
use std::path::Path;

use crate::allocator::AllocationPlan;
use crate::core::{CompilationSession, CompileError, CompileResult, NumberTypes, Stage};
use crate::graph::{Graph, LayerKind, Node, NodeId};

pub use carray::CArray;
pub use templates::CTemplates;

/// Identifies one template of the rendering service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateId {
    LayerHeader(&'static str),
    LayerSource(&'static str),
    LayerWeights(&'static str),
    Defines,
    NumericTypes,
    ModelHeader,
    Model,
}

impl TemplateId {
    /// Template location, relative to the template root.
    pub fn path(&self) -> String {
        match self {
            TemplateId::LayerHeader(name) => format!("include/layers/{name}.hh"),
            TemplateId::LayerSource(name) => format!("layers/{name}.cc"),
            TemplateId::LayerWeights(name) => format!("layers/weights/{name}.cc"),
            TemplateId::Defines => "include/defines.hh".to_string(),
            TemplateId::NumericTypes => "include/number.hh".to_string(),
            TemplateId::ModelHeader => "include/model.hh".to_string(),
            TemplateId::Model => "model.cc".to_string(),
        }
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Template family implementing a layer kind. `None` for the input, which
/// generates no code.
pub fn template_name(node: &Node) -> CompileResult<Option<&'static str>> {
    let name = match &node.spec.kind {
        LayerKind::Input => return Ok(None),
        LayerKind::AvgPool1D(_) => "averagepool1d",
        LayerKind::AvgPool2D(_) => "averagepool2d",
        LayerKind::Conv1D(_) => "conv1d",
        LayerKind::Conv2D(_) => "conv2d",
        LayerKind::Dense(_) => "fc",
        LayerKind::MaxPool1D(_) => "maxpool1d",
        LayerKind::MaxPool2D(_) => "maxpool2d",
        LayerKind::Activation(_) => "activation",
        LayerKind::Flatten => "flatten",
        LayerKind::BatchNorm1D(_) => "batchnorm1d",
        LayerKind::BatchNorm2D(_) => "batchnorm2d",
        LayerKind::Add { .. } => "add",
        LayerKind::Sum { .. } => "sum",
        LayerKind::Concatenate { .. } => "concatenate",
        LayerKind::Slice { .. } => "slice",
        LayerKind::SampleNorm { .. } => "samplenorm",
        LayerKind::Permute { .. } => "permute",
        LayerKind::Upsample { .. } => "upsample",
        kind @ (LayerKind::Identity
        | LayerKind::Dropout { .. }
        | LayerKind::ZeroPadding1D { .. }
        | LayerKind::ZeroPadding2D { .. }) => {
            return Err(CompileError::structural(
                node.name(),
                format!("{} layer must be removed by the optimizer before code generation", kind.name()),
            )
            .in_stage(Stage::Emit))
        }
    };
    Ok(Some(name))
}

/// Everything a template may read.
pub struct Bindings<'a> {
    pub graph: &'a Graph,
    pub plan: &'a AllocationPlan,
    pub number_types: &'a NumberTypes,
    /// Layer being rendered, for per-layer templates.
    pub node: Option<NodeId>,
    /// Parameters of that layer as C arrays, kernel first.
    pub weights: Vec<CArray>,
}

impl<'a> Bindings<'a> {
    fn model(graph: &'a Graph, plan: &'a AllocationPlan, number_types: &'a NumberTypes) -> Self {
        Self { graph, plan, number_types, node: None, weights: Vec::new() }
    }

    /// The layer bound to a per-layer template.
    pub fn node(&self, template: &TemplateId) -> CompileResult<&'a Node> {
        self.node
            .and_then(|id| self.graph.get(id))
            .ok_or_else(|| render_error(template, "no layer bound to a per-layer template"))
    }
}

/// A template rendering service.
pub trait TemplateEngine {
    fn render(&self, template: &TemplateId, bindings: &Bindings<'_>) -> CompileResult<String>;
}

pub(crate) fn render_error(template: &TemplateId, reason: impl Into<String>) -> CompileError {
    CompileError::Render { template: template.path(), reason: reason.into() }
}

/// One generated file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Path relative to the output directory.
    pub path: String,
    pub contents: String,
}

/// The generated C project, in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceBundle {
    artifacts: Vec<Artifact>,
}

impl SourceBundle {
    pub fn push(&mut self, path: impl Into<String>, contents: String) {
        self.artifacts.push(Artifact { path: path.into(), contents });
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.artifacts.iter().find(|a| a.path == path).map(|a| a.contents.as_str())
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// All artifacts as one translation unit.
    pub fn single_file(&self) -> String {
        let mut out = String::from("#define SINGLE_FILE\n");
        for artifact in &self.artifacts {
            out.push_str(&artifact.contents);
            out.push('\n');
        }
        out
    }

    /// Write every artifact below `dir`, creating directories as needed.
    pub fn write_to(&self, dir: &Path) -> CompileResult<()> {
        for artifact in &self.artifacts {
            let path = dir.join(&artifact.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| CompileError::output(parent, e))?;
            }
            std::fs::write(&path, &artifact.contents).map_err(|e| CompileError::output(&path, e))?;
        }
        Ok(())
    }
}

/// Drives a template engine over the graph.
pub struct Emitter<E: TemplateEngine = CTemplates> {
    engine: E,
}

impl Default for Emitter<CTemplates> {
    fn default() -> Self {
        Self::new(CTemplates)
    }
}

impl<E: TemplateEngine> Emitter<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn emit(
        &self,
        graph: &Graph,
        plan: &AllocationPlan,
        number_types: &NumberTypes,
        session: &CompilationSession<'_>,
    ) -> CompileResult<SourceBundle> {
        let mut bundle = SourceBundle::default();
        let model = Bindings::model(graph, plan, number_types);

        self.render_into(&mut bundle, "include/defines.h", TemplateId::Defines, &model, session)?;
        self.render_into(&mut bundle, "include/number.h", TemplateId::NumericTypes, &model, session)?;

        for &id in graph.ids() {
            let node = graph.node(id);
            let Some(template) = template_name(node)? else {
                continue;
            };
            let name = node.name();
            let weights: Vec<CArray> = node
                .spec
                .weights()
                .into_iter()
                .map(|(role, tensor)| CArray::from_tensor(name, role, tensor))
                .collect();
            let bindings = Bindings { node: Some(id), weights, ..Bindings::model(graph, plan, number_types) };

            let header = format!("include/{name}.h");
            self.render_into(&mut bundle, header, TemplateId::LayerHeader(template), &bindings, session)?;
            self.render_into(&mut bundle, format!("{name}.c"), TemplateId::LayerSource(template), &bindings, session)?;
            if node.spec.has_weights() {
                let path = format!("weights/{name}.c");
                self.render_into(&mut bundle, path, TemplateId::LayerWeights(template), &bindings, session)?;
            }
            log::debug!("Rendered layer {name} with template {template}");
        }

        self.render_into(&mut bundle, "include/model.h", TemplateId::ModelHeader, &model, session)?;
        self.render_into(&mut bundle, "model.c", TemplateId::Model, &model, session)?;
        log::info!("Generated {} source files", bundle.len());
        Ok(bundle)
    }

    fn render_into(
        &self,
        bundle: &mut SourceBundle,
        path: impl Into<String>,
        template: TemplateId,
        bindings: &Bindings<'_>,
        session: &CompilationSession<'_>,
    ) -> CompileResult<()> {
        let contents = self.engine.render(&template, bindings)?;
        session.record_artifact(contents.len());
        bundle.push(path, contents);
        Ok(())
    }
}
