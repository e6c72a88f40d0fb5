// This module is the hub for the infrastructure shared by every pipeline stage: the error
// taxonomy (CompileError with the structural/validation/quantization/allocation classes),
// numeric metadata (number kinds, round modes, per-node quantization records and the
// distinct numeric type set the emitter declares) and the arena-backed compilation session
// that scopes per-run state. Nothing in here knows about layers or graphs.

//! Core infrastructure.
//!
//! # Key Components
//!
//! ## Errors (`error`)
//! - `CompileError` and `CompileResult`
//! - Validator rule and pipeline stage tags
//!
//! ## Numbers (`number`)
//! - Number kinds, round modes and quantization records
//! - The ordered set of numeric types accumulated during quantization
//!
//! ## Session Management (`session`)
//! - Arena-based scratch allocation using `bumpalo`
//! - Compilation statistics

pub mod error;
pub mod number;
pub mod session;

pub use error::{CompileError, CompileResult, Stage, ValidationRule};

pub use number::{
    NumberKind,
    NumberType,
    NumberTypes,
    QuantMode,
    Quantization,
    RoundMode,
};

pub use session::{CompilationSession, SessionStats};
