// This module defines the error taxonomy of the compiler using the thiserror crate. Every
// pipeline stage returns CompileResult<T>; a failure names the offending layer (or the input
// line for calibration and model files) and carries a human readable cause. The four core
// classes are Structural (malformed graph or unsupported rewrite), Validation (one of the
// named validator rules), Quantization (unsupported width, missing scale factor or round
// mode) and Allocation (an overwrite node whose source pool cannot be resolved). Ambient
// variants cover calibration/model parsing, template rendering and I/O at the edges.
// `stage()` tells the orchestrator which part of the pipeline reported the failure. Structural
// errors can arise in several stages, so they carry the stage explicitly.

//! Error types for the compiler.
//!
//! Using thiserror for idiomatic error handling.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Validator rule that rejected a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationRule {
    ActivationLegality,
    BatchNormShape,
    FlattenArity,
    GlobalSumPooling,
    RoundModePresence,
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationRule::ActivationLegality => "activation legality",
            ValidationRule::BatchNormShape => "batchnorm shape",
            ValidationRule::FlattenArity => "flatten arity",
            ValidationRule::GlobalSumPooling => "global sum pooling placement",
            ValidationRule::RoundModePresence => "round mode presence",
        };
        f.write_str(name)
    }
}

/// Pipeline stage a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Import,
    Annotate,
    Optimize,
    Validate,
    Quantize,
    Allocate,
    Emit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Import => "import",
            Stage::Annotate => "annotate",
            Stage::Optimize => "optimize",
            Stage::Validate => "validate",
            Stage::Quantize => "quantize",
            Stage::Allocate => "allocate",
            Stage::Emit => "emit",
        };
        f.write_str(name)
    }
}

/// Main error type for model compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Structural error at layer '{layer}': {reason}")]
    Structural {
        layer: String,
        reason: String,
        stage: Stage,
    },

    #[error("Validation failed ({rule}) for layer '{layer}': {reason}")]
    Validation {
        layer: String,
        rule: ValidationRule,
        reason: String,
    },

    #[error("Quantization failed for layer '{layer}': {reason}")]
    Quantization {
        layer: String,
        reason: String,
    },

    #[error("Allocation failed for layer '{layer}': {reason}")]
    Allocation {
        layer: String,
        reason: String,
    },

    #[error("Calibration data line {line}: {reason}")]
    Calibration {
        line: usize,
        reason: String,
    },

    #[error("Model description line {line}: {reason}")]
    Parse {
        line: usize,
        reason: String,
    },

    #[error("Rendering template '{template}' failed: {reason}")]
    Render {
        template: String,
        reason: String,
    },

    #[error("Writing '{}' failed: {source}", .path.display())]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompileError {
    /// A structural error raised while rewriting the graph.
    pub fn structural(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        CompileError::Structural { layer: layer.into(), reason: reason.into(), stage: Stage::Optimize }
    }

    /// Attribute a structural error to `stage`. Other kinds keep their fixed stage.
    pub fn in_stage(mut self, stage: Stage) -> Self {
        if let CompileError::Structural { stage: current, .. } = &mut self {
            *current = stage;
        }
        self
    }

    pub fn output(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CompileError::Output { path: path.into(), source }
    }

    pub fn validation(layer: impl Into<String>, rule: ValidationRule, reason: impl Into<String>) -> Self {
        CompileError::Validation { layer: layer.into(), rule, reason: reason.into() }
    }

    pub fn quantization(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        CompileError::Quantization { layer: layer.into(), reason: reason.into() }
    }

    pub fn allocation(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        CompileError::Allocation { layer: layer.into(), reason: reason.into() }
    }

    /// Name of the layer the error refers to, if any.
    pub fn layer(&self) -> Option<&str> {
        match self {
            CompileError::Structural { layer, .. }
            | CompileError::Validation { layer, .. }
            | CompileError::Quantization { layer, .. }
            | CompileError::Allocation { layer, .. } => Some(layer),
            _ => None,
        }
    }

    /// Stage that reports this kind of failure.
    pub fn stage(&self) -> Stage {
        match self {
            CompileError::Structural { stage, .. } => *stage,
            CompileError::Validation { .. } => Stage::Validate,
            CompileError::Quantization { .. } => Stage::Quantize,
            CompileError::Allocation { .. } => Stage::Allocate,
            CompileError::Calibration { .. } => Stage::Annotate,
            CompileError::Parse { .. } | CompileError::Io(_) => Stage::Import,
            CompileError::Render { .. } | CompileError::Output { .. } => Stage::Emit,
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names_layer() {
        let err = CompileError::validation("dense1", ValidationRule::ActivationLegality, "softmax fused");
        assert_eq!(err.layer(), Some("dense1"));
        assert_eq!(err.stage(), Stage::Validate);
        let msg = err.to_string();
        assert!(msg.contains("dense1"));
        assert!(msg.contains("activation legality"));
    }

    #[test]
    fn test_calibration_error_has_no_layer() {
        let err = CompileError::Calibration { line: 3, reason: "expected 8 fields".into() };
        assert_eq!(err.layer(), None);
        assert_eq!(err.stage(), Stage::Annotate);
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn test_structural_stage_is_carried() {
        let err = CompileError::structural("pad", "cannot fuse");
        assert_eq!(err.stage(), Stage::Optimize);
        assert_eq!(err.in_stage(Stage::Import).stage(), Stage::Import);

        // Only structural errors are re-attributed.
        let err = CompileError::quantization("fc", "missing scale factor").in_stage(Stage::Import);
        assert_eq!(err.stage(), Stage::Quantize);

        let err = CompileError::output("out/model.c", std::io::Error::other("disk full"));
        assert_eq!(err.stage(), Stage::Emit);
        assert!(err.to_string().contains("out/model.c"));
    }
}
