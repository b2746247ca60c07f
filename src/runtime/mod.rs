//! Executable model of the runtime the generated C program links against.
//!
//! The C text printed by [`crate::codegen`] and the types here implement the
//! same release strategies; the model exists so their properties can be
//! checked without compiling C.

pub mod deferred;
pub mod dest;
pub mod heap;
pub mod scc;
pub mod weak;

pub use deferred::DeferredQueue;
pub use dest::Dest;
pub use heap::{Heap, Obj, ObjId, ObjKind};
pub use scc::SccRegistry;
pub use weak::{WeakId, WeakTable};

use crate::session::CompileOptions;

/// All runtime state of one program run.
#[derive(Debug)]
pub struct Runtime {
    pub heap: Heap,
    pub deferred: DeferredQueue,
    pub scc: SccRegistry,
    pub weak: WeakTable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownStats {
    pub freelist: usize,
    pub deferred: usize,
    pub weak_refs: usize,
}

impl Runtime {
    pub fn new(options: &CompileOptions) -> Self {
        Runtime {
            heap: Heap::new(options.stack_pool_size),
            deferred: DeferredQueue::new(options.deferred_batch_size),
            scc: SccRegistry::new(),
            weak: WeakTable::new(),
        }
    }

    pub fn deferred_release(&mut self, obj: ObjId) {
        self.deferred.deferred_release(obj);
    }

    pub fn safe_point(&mut self) -> usize {
        self.deferred.safe_point(&mut self.heap)
    }

    /// The epilogue of the generated `main`.
    pub fn shutdown(&mut self) -> ShutdownStats {
        let stats = ShutdownStats {
            freelist: self.heap.flush_freelist(),
            deferred: self.deferred.flush_deferred(&mut self.heap),
            weak_refs: self.weak.cleanup_weak_refs(),
        };
        tracing::debug!(?stats, live = self.heap.live_count(), "runtime shutdown");
        stats
    }
}
