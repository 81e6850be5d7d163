//! Persisted execution/job/parameter state.
//!
//! ## Transactions
//!
//! Transactions are handled by calling `begin` on the pool:
//!
//! ```ignore
//! let mut tx = pool.begin().await.unwrap();
//! some_db_call(&mut tx).await;
//! tx.commit().await.unwrap(); // changes are discarded otherwise
//! ```

pub mod execution_db;

pub use execution_db::{ExecutionDatabase, ExecutionReport, ExecutionStatus, JobReport, StorageError};
