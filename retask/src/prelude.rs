//! The purpose of this module is to alleviate the need to import many of the `[retask]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use retask::prelude::*;
//! ```
pub use crate::backend::Backend;
pub use crate::backoff::BackoffStrategy;
pub use crate::engine::{ErrorType, ExecutionError};
pub use crate::periodic::{BeatSchedule, CronField, Crontab, PeriodicTask, PeriodicTaskId};
pub use crate::pool::{ConcurrencyMode, WorkerPool};
pub use crate::registry::{Handler, HandlerError, Registry};
pub use crate::scheduler::{BeatScheduler, SchedulerConfig};
pub use crate::task::builder::TaskBuilder;
pub use crate::task::query::Where;
pub use crate::task::{Arguments, Priority, Task, TaskId, TaskStatus};
pub use crate::worker::{Worker, WorkerConfig};
pub use crate::{Retask, RetaskError};
