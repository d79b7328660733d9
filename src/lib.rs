//! A generic, thread-safe object pool.
//!
//! Hands costly-to-create resources (database connections, sockets, worker
//! contexts, parsers) out to client threads on demand, reclaims them on
//! return, and enforces bounded resource usage through eviction and
//! validation policies.
//!
//! Two pool shapes are provided:
//!
//! - [`SinglePool`] — one pool of interchangeable instances.
//! - [`KeyedPool`] — a dynamic set of sub-pools multiplexed by key, sharing
//!   a global cap on top of per-key caps.
//!
//! Both are driven by a user-supplied [`Factory`]/[`KeyedFactory`]: the only
//! I/O surface the pool itself consumes. Borrowing, returning, eviction and
//! validation are otherwise identical between the two; see [`single`] and
//! [`keyed`] for the full contract each one implements.
//!
//! ```no_run
//! use objectpool::{Factory, PoolConfig, SinglePool};
//!
//! struct Connections;
//!
//! impl Factory<String> for Connections {
//!     fn create(&self) -> Result<String, objectpool::BoxError> {
//!         Ok("connection".to_string())
//!     }
//!     fn destroy(&self, _object: String) {}
//! }
//!
//! let pool = SinglePool::new(Connections, PoolConfig::default());
//! let conn = pool.borrow().unwrap();
//! assert_eq!(&*conn, "connection");
//! ```

mod config;
mod entry;
mod error;
mod evictor;
mod factory;
mod idle_deque;
mod keyed;
mod single;

pub use config::{KeyedPoolConfig, PoolConfig};
pub use error::{BoxError, Error, Result};
pub use evictor::EvictionScheduler;
pub use factory::{Factory, KeyedFactory};
pub use keyed::{KeyedPool, Pooled as KeyedPooled};
pub use single::{Pooled, PoolStats, SinglePool};
