//! Everything a typical application needs in one import.
//!
//! ```
//! use sessionpool::prelude::*;
//! ```

pub use crate::client::{MemorySessionClient, SessionClient, Status, StatusCode};
pub use crate::{
    Database, Error, PoolConfig, PoolStats, ReleaseOutcome, Result, RetryPolicy, Session,
    SessionKind, SessionPool, Transaction, TransactionRunner,
};
