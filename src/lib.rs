//! chbridge - bidirectional bulk data movement between ClickHouse and flat
//! files, plus a multi-table join-and-export utility.
//!
//! The core is the batched transfer pipeline: rows stream between the store
//! and CSV/JSON files one bounded batch at a time, so peak memory tracks the
//! batch size rather than the dataset size.

pub mod api;
pub mod batch;
pub mod client;
pub mod connection;
pub mod error;
pub mod join;
pub mod schema;
pub mod transfer;

pub use batch::{FileFormat, RowBatch, DEFAULT_BATCH_SIZE};
pub use client::{ColumnMeta, HttpStoreClient, QueryResult, StoreClient};
pub use connection::ConnectionSpec;
pub use error::{BridgeError, Result};
pub use join::{JoinPlanner, JoinSpec};
pub use schema::{ColumnDescriptor, SemanticType};
pub use transfer::{
    CancelToken, TransferOptions, TransferOrchestrator, TransferReport, TransferStatus,
};
