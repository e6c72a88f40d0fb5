// This module implements the `.nnir` text format used to feed layer graphs to the compiler
// without a framework importer. A model is a sequence of lines. Layer lines declare one layer
// each, in topological order, naming the layers they consume:
//
//     name = kind(input, ...) key=value ... -> [d0, d1, ...]
//
// Weight lines attach a tensor to a parameter of a declared layer:
//
//     name.role [d0, d1, ...] = v0 v1 ...
//
// The first layer must be `input()`. Input shapes are taken from the output shapes of the
// consumed layers. `;` starts a comment running to the end of the line.

//! Text model format.

mod parser;

use std::path::Path;

use crate::core::CompileResult;
use crate::graph::Graph;

pub use parser::parse_model;

/// Read and parse a model file.
pub fn load_model(path: &Path) -> CompileResult<Graph> {
    let text = std::fs::read_to_string(path)?;
    parse_model(&text)
}
