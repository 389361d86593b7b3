//! Cooperative one-shot futures driven by stackful context switching.
//!
//! This crate provides a [`Scheduler`] that runs nullary closures as queued
//! tasks, and a [`Future`] that hands their eventual outcome to waiting
//! code. Waiting suspends the *full native call stack* of the caller — from
//! arbitrary call depth, with no suspend points declared anywhere — by
//! switching to a resolution loop on a freshly allocated stack. The loop
//! drains queued tasks and repeatedly invokes a user-supplied progress step
//! (typically "run one I/O event") until some future a caller is blocked on
//! completes, then resumes the earliest eligible caller.
//!
//! Everything is single-threaded and cooperative: there are no locks, no
//! preemption and no cross-thread completion. Control transfers happen only
//! inside [`Future::wait`] and in the resolution loop.
//!
//! ```no_run
//! use coopfut::Scheduler;
//!
//! let sched = Scheduler::new(|| { /* run one event-loop tick */ });
//! let doubled = sched.spawn(|| 21 * 2);
//! assert_eq!(doubled.wait(), Ok(42));
//! ```
//!
//! Fallible tasks declare their error type through their return value and
//! deliver it to the awaiter:
//!
//! ```no_run
//! use coopfut::Scheduler;
//!
//! let sched = Scheduler::new(|| {});
//! let parsed = sched.spawn_fallible(|| "17".parse::<u32>());
//! assert_eq!(parsed.wait(), Ok(17));
//! ```

mod arch;
mod error;
mod future;
mod scheduler;
pub mod stack;

pub use crate::error::CompleteError;
pub use crate::future::Future;
pub use crate::scheduler::{EventSource, Scheduler};
