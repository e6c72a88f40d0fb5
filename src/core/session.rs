// This module provides the per-compilation session. CompilationSession owns (by reference) a
// bumpalo arena used for scratch data that lives exactly as long as one compile run, such as
// the allocator's liveness slices, together with the set of
// distinct numeric types accumulated by the quantizer and later declared by the emitter.
// Nothing here is process-wide: two concurrent compilations use two sessions. SessionStats
// counts what each stage did (nodes removed and fused, tensors quantized, pools opened,
// artifacts rendered) and is logged at the end of a run.

//! Arena-based compilation session management.
//!
//! All per-run scratch objects are tied to the session lifetime, so stage
//! results such as liveness tables can borrow from the arena instead of
//! being copied around.

use bumpalo::Bump;
use std::cell::RefCell;
use std::fmt;

use super::number::{NumberType, NumberTypes};

/// Arena-based compilation session.
///
/// Holds the numeric types seen during quantization. A session must not be
/// reused across compilations.
pub struct CompilationSession<'arena> {
    /// Arena allocator for per-run scratch data.
    arena: &'arena Bump,

    /// Distinct numeric types the generated code must declare.
    number_types: RefCell<NumberTypes>,

    /// Session statistics.
    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            number_types: RefCell::new(NumberTypes::new()),
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Allocate a slice in the session arena.
    pub fn alloc_slice<T>(&self, slice: &[T]) -> &'arena [T]
    where
        T: Copy,
    {
        self.arena.alloc_slice_copy(slice)
    }

    /// Record a numeric type used by a layer.
    pub fn record_number_type(&self, ty: NumberType) {
        if self.number_types.borrow_mut().insert(ty) {
            log::debug!("New numeric type {} (accumulator {})", ty.ctype(), ty.long_ctype());
        }
    }

    /// Snapshot of the numeric types seen so far.
    pub fn number_types(&self) -> NumberTypes {
        self.number_types.borrow().clone()
    }

    pub fn record_pass(&self, name: &str, changed: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.passes_run += 1;
        *stats.pass_changes.entry(name.to_string()).or_insert(0) += changed;
    }

    pub fn record_node_removed(&self) {
        self.stats.borrow_mut().nodes_removed += 1;
    }

    pub fn record_node_fused(&self) {
        self.stats.borrow_mut().nodes_fused += 1;
    }

    pub fn record_tensor_quantized(&self, elements: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.tensors_quantized += 1;
        stats.elements_quantized += elements;
    }

    pub fn record_pool_opened(&self) {
        self.stats.borrow_mut().pools_opened += 1;
    }

    pub fn record_footprint(&self, bytes: usize) {
        self.stats.borrow_mut().activation_bytes = bytes;
    }

    pub fn record_artifact(&self, bytes: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.artifacts_rendered += 1;
        stats.bytes_rendered += bytes;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Optimizer passes executed.
    pub passes_run: usize,

    /// Number of rewrites performed per pass.
    pub pass_changes: std::collections::BTreeMap<String, usize>,

    /// Nodes deleted by elimination passes.
    pub nodes_removed: usize,

    /// Nodes merged into a neighbour.
    pub nodes_fused: usize,

    /// Weight tensors converted to fixed point.
    pub tensors_quantized: usize,

    /// Total elements converted to fixed point.
    pub elements_quantized: usize,

    /// Activation pools opened by the allocator.
    pub pools_opened: usize,

    /// RAM needed by the activation pools, in bytes.
    pub activation_bytes: usize,

    /// Artifacts produced by the emitter.
    pub artifacts_rendered: usize,

    /// Total size of the rendered sources.
    pub bytes_rendered: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Passes run: {}", self.passes_run)?;
        writeln!(f, "  Nodes removed: {}", self.nodes_removed)?;
        writeln!(f, "  Nodes fused: {}", self.nodes_fused)?;
        writeln!(
            f,
            "  Tensors quantized: {} ({} elements)",
            self.tensors_quantized, self.elements_quantized
        )?;
        writeln!(f, "  Pools opened: {}", self.pools_opened)?;
        writeln!(f, "  Activation RAM: {} bytes", self.activation_bytes)?;
        writeln!(
            f,
            "  Artifacts rendered: {} ({} bytes)",
            self.artifacts_rendered, self.bytes_rendered
        )?;

        if !self.pass_changes.is_empty() {
            writeln!(f, "  Pass breakdown:")?;
            for (pass, changes) in &self.pass_changes {
                writeln!(f, "    {}: {}", pass, changes)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::number::NumberKind;

    #[test]
    fn test_compilation_session_creation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.passes_run, 0);
        assert_eq!(stats.pools_opened, 0);
        // Seeded with the runtime's 32-bit integer type.
        assert_eq!(session.number_types().len(), 1);
    }

    #[test]
    fn test_number_types_are_per_session() {
        let arena = Bump::new();
        let first = CompilationSession::new(&arena);
        first.record_number_type(NumberType::new(NumberKind::Integer, 8, 16));
        first.record_number_type(NumberType::new(NumberKind::Integer, 8, 16));
        assert_eq!(first.number_types().len(), 2);

        let second = CompilationSession::new(&arena);
        assert_eq!(second.number_types().len(), 1);
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_pass("remove_dropout", 2);
        session.record_node_removed();
        session.record_node_removed();
        session.record_pool_opened();
        session.record_artifact(128);

        let output = format!("{}", session.stats());
        assert!(output.contains("Passes run: 1"));
        assert!(output.contains("Nodes removed: 2"));
        assert!(output.contains("remove_dropout: 2"));
        assert!(output.contains("Artifacts rendered: 1 (128 bytes)"));
    }
}
