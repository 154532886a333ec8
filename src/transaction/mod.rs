// ============================================================================
// Transaction Module
// ============================================================================
//
// Runs caller-supplied transaction bodies against pooled sessions:
//
// - handle: `Transaction`, the narrow view of an open remote transaction
// - runner: attempt lifecycle, outcome classification, retry loop
// - retry: backoff schedule between aborted attempts
//
// ============================================================================

pub mod handle;
pub mod retry;
pub mod runner;

pub use handle::Transaction;
pub use retry::{Backoff, RetryPolicy};
pub use runner::TransactionRunner;
