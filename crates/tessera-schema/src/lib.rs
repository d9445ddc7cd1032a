//! Tessera schema layer
//!
//! A versioned schema cache over the Tessera record store.
//!
//! # Architecture
//!
//! Schema lives in special records (names starting with `@`) inside the
//! same store as the data:
//!
//! - `@ATTRIBUTES`: per-attribute flag tokens (`CASE_INSENSITIVE`,
//!   `INTEGER`, `HIDDEN`, `NONE`), `*` for the default
//! - `@SUBCLASSES`: base class -> direct subclasses
//! - `@INDEXLIST`: indexed attributes (`@IDXATTR`) and `@IDXONE`
//! - `@BASEINFO`: `SEQUENCE_NUMBER` and `MOD_TIMESTAMP`
//!
//! Every schema write bumps `SEQUENCE_NUMBER` in the same transaction. Every
//! schema query first checks the store's modification counter, then the
//! sequence number, and rebuilds the cached tables only when the latter moved.

pub mod attribute;
pub mod cache;
pub mod database;
pub mod error;
pub mod loader;
pub mod message;
pub mod registry;
pub mod sequence;

pub use attribute::{AttributeFlags, AttributeSyntax};
pub use cache::{CacheState, CacheStats, SchemaCache};
pub use database::{Database, DecoratedElement, DecoratedRecord};
pub use error::{SchemaError, SchemaResult};
pub use loader::{IndexDescriptor, SchemaTables};
pub use message::{Element, Message};
pub use registry::{HandlerDescriptor, HandlerRegistry};
pub use sequence::{bump_sequence, BaseInfo};
