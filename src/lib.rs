//! nncc - Neural network to C compiler.
//!
//! nncc turns a layer graph of a trained neural network into a portable,
//! allocation-free C project for microcontrollers. Graphs are read from the
//! `.nnir` text format or built programmatically, optionally quantized to
//! fixed point from a calibration table, and emitted as one C file per layer
//! plus a model entry point.
//!
//! # Primary Usage
//!
//! ```ignore
//! use nncc::core::CompilationSession;
//! use nncc::pipeline::{Compiler, CompilerOptions};
//! use bumpalo::Bump;
//!
//! let mut graph = nncc::text_ir::parse_model(&text)?;
//!
//! // Create compilation session with arena allocation
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//!
//! let result = Compiler::new(&session, CompilerOptions::default()).compile(&mut graph, None)?;
//! print!("{}", result.single_file());
//! ```
//!
//! # Architecture
//!
//! - [`graph`] - Layer graph IR with stable node handles
//! - [`optimizer`] - Rewrite passes (dropout/identity removal, fusions, renaming)
//! - [`validator`] - Per-layer legality rules
//! - [`calibration`] - Calibration tables and quantization annotation
//! - [`quantizer`] - Fixed-point conversion of weights
//! - [`allocator`] - Activation buffer pooling
//! - [`emitter`] - C code generation
//! - [`pipeline`] - Stage driver
//! - [`eval`] - Float reference evaluation
//! - [`text_ir`] - `.nnir` model format
//! - [`core`] - Shared infrastructure (errors, numbers, session)

pub mod core;
pub mod graph;

pub mod allocator;
pub mod calibration;
pub mod emitter;
pub mod eval;
pub mod optimizer;
pub mod pipeline;
pub mod quantizer;
pub mod text_ir;
pub mod validator;

pub use core::{CompilationSession, CompileError, CompileResult, QuantMode, SessionStats};
pub use graph::{Graph, LayerKind, LayerSpec, NodeId};
pub use pipeline::{Compilation, Compiler, CompilerOptions};
