//! Weft Runtime
//!
//! A message-driven concurrency runtime: asynchronous [`Task`]s,
//! stream-processing [`Process`]es, and the primitives underneath them —
//! [`Port`]s and [`Receiver`]s for ordered message delivery, arbiters for
//! receive policy, and a work-stealing [`PooledScheduler`] that runs it all
//! on a shared pool of worker threads.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use weft_runtime::message::Message;
//! use weft_runtime::process::Process;
//!
//! let counter = Arc::new(AtomicUsize::new(0));
//! let c = Arc::clone(&counter);
//! let process = Process::new(move |_, _item| {
//!     c.fetch_add(1, Ordering::Relaxed);
//! });
//!
//! for _ in 0..8 {
//!     process.enqueue(Message::new(0));
//! }
//! process.run();
//! process.no_more_work();
//!
//! while !process.is_finished() {
//!     std::thread::yield_now();
//! }
//! assert_eq!(counter.load(Ordering::Relaxed), 8);
//! ```

pub mod arbiter;
pub mod error;
pub mod main_scheduler;
pub mod message;
pub mod port;
pub mod process;
pub mod progress;
pub mod receiver;
pub mod rrobin;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod wsqueue;

pub use arbiter::{CoordinationArbiter, Lane, ReceiveDecision};
pub use error::TaskError;
pub use main_scheduler::MainLoopScheduler;
pub use message::{Message, Value};
pub use port::Port;
pub use process::Process;
pub use progress::{ProgressMessage, ProgressMode};
pub use receiver::{DeliveryStatus, Receiver};
pub use runtime::init;
pub use scheduler::{PooledScheduler, ScheduleExt, Scheduler, SchedulerConfig};
pub use task::Task;
pub use wsqueue::{Stealer, WorkStealingQueue};
