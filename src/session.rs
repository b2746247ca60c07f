//! Compile options and the per-run session.

use crate::arena::Arena;
use crate::types::TypeRegistry;
use std::cell::RefCell;

/// Knobs for the memory pipeline and the emitted runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOptions {
    /// Cells in the generated stack pool
    pub stack_pool_size: usize,
    /// Deferred decrements applied per safe point
    pub deferred_batch_size: usize,
    /// Upper bound on liveness dataflow iterations
    pub liveness_iteration_cap: usize,
    /// Nesting depth past which analyzers skip a node
    pub analysis_depth_limit: usize,
    /// Free bindings right after their last use instead of at block end
    pub enable_nll: bool,
    /// Rewrite allocations to reuse a just-freed cell of the same size
    pub enable_reuse: bool,
    /// Allocate non-escaping integer bindings from the stack pool
    pub enable_stack_alloc: bool,
    /// Freeze cyclic bindings and release them per SCC
    pub freeze_cyclic: bool,
    /// Prepend the runtime library to emitted programs
    pub emit_runtime: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            stack_pool_size: 256,
            deferred_batch_size: 32,
            liveness_iteration_cap: 64,
            analysis_depth_limit: 256,
            enable_nll: true,
            enable_reuse: true,
            enable_stack_alloc: true,
            freeze_cyclic: false,
            emit_runtime: true,
        }
    }
}

/// State shared by every level of one evaluation: options, the registered
/// types and the compile-time arena. Dropped once at exit.
pub struct Session {
    pub options: CompileOptions,
    pub types: RefCell<TypeRegistry>,
    pub arena: Arena,
}

impl Session {
    pub fn new(options: CompileOptions) -> Self {
        Session {
            options,
            types: RefCell::new(TypeRegistry::new()),
            arena: Arena::new(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new(CompileOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = CompileOptions::default();
        assert_eq!(options.stack_pool_size, 256);
        assert_eq!(options.deferred_batch_size, 32);
        assert_eq!(options.liveness_iteration_cap, 64);
        assert_eq!(options.analysis_depth_limit, 256);
        assert!(options.enable_nll && options.enable_reuse && options.enable_stack_alloc);
        assert!(!options.freeze_cyclic);
        assert!(options.emit_runtime);
    }

    #[test]
    fn test_session_starts_empty() {
        let session = Session::default();
        assert!(session.types.borrow().is_empty());
        assert_eq!(session.arena.symbol_count(), 0);
    }
}
