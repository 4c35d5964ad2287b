//! Key/value storage layer.
//!
//! The engine treats its backend as a plain ordered key/value table with no
//! native transactions; every higher-level atomicity guarantee (the job status
//! index in particular) is built on ordered single-key writes plus repair.

mod kv;
mod libsql_kv;
mod memory;

pub use kv::KvStore;
pub(crate) use kv::escape_segment;
pub use libsql_kv::LibSqlKv;
pub use memory::MemoryKv;
