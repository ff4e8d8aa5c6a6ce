//! A fixed-size SMP task pool: one shared FIFO queue, N worker threads, a
//! caller-steal forcing protocol, and a handful of data-parallel
//! algorithms (`parallel`, `amap`, `map`/`async_buf`, `reduce`) built on
//! top of it.
//!
//! Start with [`pool::TaskPool`] and [`task::Task`] for the primitives, or
//! [`global::global_pool`] for the lazily-built process-wide default.

pub mod amap;
pub(crate) mod chunk;
pub mod error;
pub mod foreach;
pub mod global;
pub mod map;
pub mod pool;
pub(crate) mod queue;
pub mod reduce;
pub mod task;
pub mod wls;

pub use error::{AggregatedFault, ForeachBreak, PreconditionError};
pub use foreach::{parallel, parallel_indexed, recommended_work_unit, ForeachControl};
pub use global::{default_pool_threads, global_pool, set_default_pool_threads, total_cpus};
pub use map::{async_buf, map, AsyncBuf};
pub use pool::{Scope, ScopedTask, TaskPool, TaskPoolBuilder};
pub use reduce::{reduce, reduce2, reduce_seeded};
pub use task::{Task, TaskError, TaskState};
pub use wls::WorkerLocalStorage;

pub use amap::{amap, amap_into};
