// ============================================================================
// Event Sourcing Infrastructure
// ============================================================================
//
// core/  - envelope model and codec (no I/O)
// store/ - append-only persistence and dead-letter storage
//
// ============================================================================

mod core;
mod store;

pub use self::core::*;
pub use self::store::*;

#[cfg(test)]
pub(crate) use self::store::test_support;
