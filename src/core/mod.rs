pub mod error;
pub mod types;

pub use error::{Error, ErrorClass, Result};
pub use types::{SessionId, SessionKind, TransactionId, TransactionMode};
