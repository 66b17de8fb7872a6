//! The HeTu data-layer kernel.
//!
//! HeTu is a server-side logic database for real-time multi-user
//! applications. Clients invoke server-defined *systems* that transactionally
//! read and mutate typed rows stored in *components*, and subscribe to rows
//! or index ranges whose deltas are pushed back when a transaction touches
//! them.
//!
//! This crate is the kernel: the backend client and its commit protocol, the
//! transactional session with its write-buffering identity map, the
//! subscription broker, the system scheduler, the endpoint executor, future
//! calls and the snowflake id generator. Websocket framing, the
//! compression/crypto pipeline and the CLI live outside and talk to the
//! kernel through the types exported here.

pub mod db;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod snowflake;
pub mod system;
pub mod util;

pub use db::backend::{Backend, BackendClient, MqClient, TableMaint, TableStatus, WorkerKeeper};
pub use db::idmap::{DirtySet, IdentityMap, RowState};
pub use db::mem::MemBackend;
pub use db::repo::Repository;
pub use db::session::{Session, run_with_retry};
pub use db::sub::{RlsContext, Subscriptions};
pub use error::DbError;
pub use manager::{ComponentTableManager, Table};
pub use snowflake::SnowflakeId;
pub use system::{SystemCall, SystemDef, SystemRegistry, SystemResult};
