//! Client side of the canvaslink channel: connection management with
//! reconnect backoff, command dispatch with correlation and timeouts,
//! chunked progress reporting, sequential batch execution, and a handler
//! registry for serving commands.
//!
//! Both parties on a channel use the same [`Link`]. The automation side
//! dispatches commands through a [`CommandDispatcher`]; the plugin side
//! takes the request stream and drives a [`CommandExecutor`] over it.

mod backoff;
mod batch;
mod config;
mod connection;
mod dispatcher;
mod error;
mod executor;
mod progress;
mod scheduler;

pub use backoff::{BackoffConfig, BackoffPolicy};
pub use batch::{BatchOptions, BatchOutcome, BatchReport, run_batch};
pub use config::LinkConfig;
pub use connection::{ConnectionState, Link, Responder};
pub use dispatcher::CommandDispatcher;
pub use error::LinkError;
pub use executor::{CommandExecutor, CommandHandler, ExecError, HandlerFuture};
pub use progress::ProgressReporter;
pub use scheduler::{ManualScheduler, ScheduledDelay, Scheduler, TokioScheduler};
