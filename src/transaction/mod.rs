// ============================================================================
// Transaction Module
// ============================================================================
//
// Wraps a unit of work in begin/commit/rollback on an adapter handle.
//
// State transitions:
//   Active ──commit──> Committed
//     │
//     └──rollback──> Aborted
//
// ============================================================================

pub mod executor;
pub mod state;

pub use executor::{TransactionExecutor, TransactionStats};
pub use state::{TransactionId, TransactionState};
