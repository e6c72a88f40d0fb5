// This module plans activation buffer reuse. Every layer output lives in a buffer from the
// moment the layer runs until its last consumer has run; two outputs whose lifetimes are
// disjoint can share one memory pool. The liveness pass records, per topological position,
// when each output is created and the last position that still reads it, and stores the table
// in the session arena. The allocator then walks the graph once: the graph input and the last
// layer's output are supplied by the caller (pool index 0), reshape layers that overwrite their
// input join their input's pool, and every other layer takes the first pool that holds none of
// its inputs and whose tenants are all dead, opening a new pool otherwise. This is a greedy
// first-fit interval colouring; it is not guaranteed to use the fewest pools.

//! Activation pool allocation.

use std::fmt;

use hashbrown::{HashMap, HashSet};

use crate::core::{CompilationSession, CompileError, CompileResult};
use crate::graph::{Graph, NodeId};

/// Lifetime of one layer output, in topological positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    /// Position of the layer producing the buffer.
    pub created: usize,
    /// Last position that reads the buffer.
    pub keep_until: usize,
}

impl LiveRange {
    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.created <= other.keep_until && other.created <= self.keep_until
    }
}

/// Liveness table indexed by topological position.
pub struct LivenessAnalysis<'arena> {
    ranges: &'arena [LiveRange],
}

impl<'arena> LivenessAnalysis<'arena> {
    /// Compute the live range of every layer output.
    pub fn analyze(graph: &Graph, session: &CompilationSession<'arena>) -> Self {
        let positions: HashMap<NodeId, usize> =
            graph.ids().iter().enumerate().map(|(pos, &id)| (id, pos)).collect();

        let mut ranges = Vec::with_capacity(graph.len());
        for (pos, node) in graph.nodes().enumerate() {
            let keep_until = node
                .succs()
                .iter()
                .filter_map(|s| positions.get(s).copied())
                .max()
                .unwrap_or(pos);
            ranges.push(LiveRange { created: pos, keep_until });
        }
        Self { ranges: session.alloc_slice(&ranges) }
    }

    pub fn range(&self, pos: usize) -> Option<LiveRange> {
        self.ranges.get(pos).copied()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// One reusable memory region and the layers whose outputs live in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub tenants: Vec<NodeId>,
    /// Last position at which any tenant is still read.
    pub live_until: usize,
}

/// Result of activation allocation.
#[derive(Debug, Clone, Default)]
pub struct AllocationPlan {
    pools: Vec<Pool>,
    index: HashMap<NodeId, usize>,
    ranges: HashMap<NodeId, LiveRange>,
    overwrites: HashSet<(NodeId, NodeId)>,
}

impl AllocationPlan {
    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// 1-based pool of a layer output; 0 for caller-provided buffers.
    pub fn pool_index(&self, id: NodeId) -> usize {
        self.index.get(&id).copied().unwrap_or(0)
    }

    pub fn live_range(&self, id: NodeId) -> Option<LiveRange> {
        self.ranges.get(&id).copied()
    }

    /// True if both outputs are placed in the same pool.
    pub fn shares_pool(&self, a: NodeId, b: NodeId) -> bool {
        let pa = self.pool_index(a);
        pa != 0 && pa == self.pool_index(b)
    }

    /// True if `dst` writes its output over the buffer of `src`.
    pub fn overwrites(&self, src: NodeId, dst: NodeId) -> bool {
        self.overwrites.contains(&(src, dst))
    }

    /// Bytes of RAM needed by the pools: each pool is as large as its
    /// largest tenant.
    pub fn footprint_bytes(&self, graph: &Graph) -> usize {
        self.pools
            .iter()
            .map(|pool| {
                pool.tenants
                    .iter()
                    .map(|&id| output_bytes(graph, id))
                    .max()
                    .unwrap_or(0)
            })
            .sum()
    }

    fn open_pool(&mut self, id: NodeId, range: LiveRange) -> usize {
        self.pools.push(Pool { tenants: vec![id], live_until: range.keep_until });
        let index = self.pools.len();
        self.index.insert(id, index);
        index
    }

    fn join_pool(&mut self, index: usize, id: NodeId, range: LiveRange) {
        let pool = &mut self.pools[index - 1];
        pool.tenants.push(id);
        pool.live_until = pool.live_until.max(range.keep_until);
        self.index.insert(id, index);
    }
}

/// Size in bytes of a layer's output buffer.
pub fn output_bytes(graph: &Graph, id: NodeId) -> usize {
    let node = graph.node(id);
    let element = node.q.as_ref().map_or(4, |q| (q.width as usize).div_ceil(8));
    node.spec.output_elements() * element
}

impl fmt::Display for AllocationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pool) in self.pools.iter().enumerate() {
            let tenants: Vec<_> = pool.tenants.iter().map(ToString::to_string).collect();
            writeln!(f, "pool {}: [{}] live until {}", i + 1, tenants.join(", "), pool.live_until)?;
        }
        Ok(())
    }
}

/// Greedy first-fit pool allocator.
pub struct Allocator;

impl Allocator {
    pub fn allocate(graph: &Graph, session: &CompilationSession<'_>) -> CompileResult<AllocationPlan> {
        let liveness = LivenessAnalysis::analyze(graph, session);
        let ids = graph.ids();
        let mut plan = AllocationPlan::default();

        for (pos, &id) in ids.iter().enumerate() {
            if let Some(range) = liveness.range(pos) {
                plan.ranges.insert(id, range);
            }
        }

        // The input and the last output are provided by the caller.
        let last = ids.len().saturating_sub(1);
        for pos in 1..last {
            let id = ids[pos];
            let node = graph.node(id);
            let Some(range) = liveness.range(pos) else {
                return Err(CompileError::allocation(node.name(), "missing liveness information"));
            };

            if pos == 1 {
                // First layer reads the external input.
                plan.open_pool(id, range);
                session.record_pool_opened();
                continue;
            }

            if node.spec.overwrites_input() {
                let [input] = node.preds() else {
                    return Err(CompileError::allocation(
                        node.name(),
                        format!("need exactly one input when overwriting input, found {}", node.preds().len()),
                    ));
                };
                let index = plan.pool_index(*input);
                if index == 0 {
                    return Err(CompileError::allocation(
                        node.name(),
                        format!("input '{}' is not allocated in exactly one pool", graph.node(*input).name()),
                    ));
                }
                plan.join_pool(index, id, range);
                plan.overwrites.insert((*input, id));
                log::debug!("'{}' overwrites '{}' in pool {}", node.name(), graph.node(*input).name(), index);
                continue;
            }

            let input_pools: HashSet<usize> = node.preds().iter().map(|&p| plan.pool_index(p)).collect();
            let free = plan
                .pools
                .iter()
                .enumerate()
                .map(|(i, pool)| (i + 1, pool))
                .find(|(index, pool)| !input_pools.contains(index) && pool.live_until <= pos)
                .map(|(index, _)| index);

            match free {
                Some(index) => {
                    plan.join_pool(index, id, range);
                    log::debug!("'{}' reuses pool {}", node.name(), index);
                }
                None => {
                    let index = plan.open_pool(id, range);
                    session.record_pool_opened();
                    log::debug!("'{}' opens pool {}", node.name(), index);
                }
            }
        }

        let footprint = plan.footprint_bytes(graph);
        session.record_footprint(footprint);
        log::info!("Allocated {} pools, {} bytes of activations", plan.pool_count(), footprint);
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Activation, LayerKind, LayerSpec};
    use bumpalo::Bump;

    fn layer(name: &str, kind: LayerKind) -> LayerSpec {
        LayerSpec::new(name, kind, vec![vec![1, 4]], vec![vec![1, 4]])
    }

    fn relu(name: &str) -> LayerSpec {
        layer(name, LayerKind::Activation(Activation::Relu))
    }

    fn add(name: &str) -> LayerSpec {
        layer(name, LayerKind::Add { activation: Activation::Linear })
    }

    fn assert_no_aliasing(graph: &Graph, plan: &AllocationPlan) {
        for pool in plan.pools() {
            for (i, &a) in pool.tenants.iter().enumerate() {
                for &b in &pool.tenants[i + 1..] {
                    if plan.overwrites(a, b) || plan.overwrites(b, a) {
                        continue;
                    }
                    let (ra, rb) = (plan.live_range(a).unwrap(), plan.live_range(b).unwrap());
                    assert!(
                        !ra.overlaps(&rb),
                        "'{}' {:?} and '{}' {:?} share a pool",
                        graph.node(a).name(),
                        ra,
                        graph.node(b).name(),
                        rb
                    );
                }
            }
        }
    }

    #[test]
    fn test_chain_alternates_two_pools() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let mut prev = g.add_input(LayerSpec::input("x", vec![1, 4])).unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            prev = g.insert(relu(&format!("r{i}")), &[prev], &[]).unwrap();
            ids.push(prev);
        }
        let plan = Allocator::allocate(&g, &session).unwrap();
        assert_eq!(plan.pool_count(), 2);
        assert_eq!(plan.pool_index(ids[0]), 1);
        assert_eq!(plan.pool_index(ids[1]), 2);
        assert_eq!(plan.pool_index(ids[2]), 1);
        assert_eq!(plan.pool_index(ids[3]), 2);
        // Last output is external.
        assert_eq!(plan.pool_index(ids[4]), 0);
        assert_no_aliasing(&g, &plan);
        assert_eq!(plan.footprint_bytes(&g), 32);
    }

    #[test]
    fn test_diamond_branches_do_not_share() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let a = g.add_input(LayerSpec::input("a", vec![1, 4])).unwrap();
        let b = g.insert(relu("b"), &[a], &[]).unwrap();
        let c = g.insert(relu("c"), &[a], &[]).unwrap();
        let d = g.insert(add("d"), &[b, c], &[]).unwrap();

        let plan = Allocator::allocate(&g, &session).unwrap();
        assert!(!plan.shares_pool(b, c));
        assert_eq!(plan.pool_index(a), 0);
        assert_eq!(plan.pool_index(d), 0);
        assert_ne!(plan.pool_index(b), 0);
        assert_ne!(plan.pool_index(c), 0);
        assert_no_aliasing(&g, &plan);
    }

    #[test]
    fn test_diamond_pools_are_reused_after_join() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let a = g.add_input(LayerSpec::input("a", vec![1, 4])).unwrap();
        let b = g.insert(relu("b"), &[a], &[]).unwrap();
        let c = g.insert(relu("c"), &[a], &[]).unwrap();
        let d = g.insert(add("d"), &[b, c], &[]).unwrap();
        let e = g.insert(relu("e"), &[d], &[]).unwrap();
        g.insert(relu("out"), &[e], &[]).unwrap();

        let plan = Allocator::allocate(&g, &session).unwrap();
        assert_eq!(plan.pool_count(), 3);
        // b and c are dead once d has run.
        assert!(plan.shares_pool(b, e) || plan.shares_pool(c, e));
        assert_no_aliasing(&g, &plan);
    }

    #[test]
    fn test_flatten_joins_input_pool() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 4])).unwrap();
        let r0 = g.insert(relu("r0"), &[x], &[]).unwrap();
        let r1 = g.insert(relu("r1"), &[r0], &[]).unwrap();
        let flat = g.insert(layer("flat", LayerKind::Flatten), &[r1], &[]).unwrap();
        let r2 = g.insert(relu("r2"), &[flat], &[]).unwrap();
        g.insert(relu("out"), &[r2], &[]).unwrap();

        let plan = Allocator::allocate(&g, &session).unwrap();
        assert!(plan.shares_pool(r1, flat));
        assert!(plan.overwrites(r1, flat));
        assert!(!plan.shares_pool(flat, r2));
        assert_eq!(plan.pools()[plan.pool_index(flat) - 1].live_until, 4);
        assert_no_aliasing(&g, &plan);
    }

    #[test]
    fn test_flatten_of_external_input_fails() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 4])).unwrap();
        let r0 = g.insert(relu("r0"), &[x], &[]).unwrap();
        let flat = g.insert(layer("flat", LayerKind::Flatten), &[x], &[]).unwrap();
        g.insert(add("out"), &[r0, flat], &[]).unwrap();

        let err = Allocator::allocate(&g, &session).unwrap_err();
        assert!(matches!(err, CompileError::Allocation { .. }));
        assert_eq!(err.layer(), Some("flat"));
    }

    #[test]
    fn test_liveness_lives_in_arena() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut g = Graph::new();
        let x = g.add_input(LayerSpec::input("x", vec![1, 4])).unwrap();
        let a = g.insert(relu("a"), &[x], &[]).unwrap();
        g.insert(add("b"), &[x, a], &[]).unwrap();

        let liveness = LivenessAnalysis::analyze(&g, &session);
        assert_eq!(liveness.len(), 3);
        assert_eq!(liveness.range(0), Some(LiveRange { created: 0, keep_until: 2 }));
        assert_eq!(liveness.range(2), Some(LiveRange { created: 2, keep_until: 2 }));
    }
}
