//! taskio - a worker-pool task dispatcher.
//!
//! A `Dispatcher` owns a fixed pool of worker threads. Clients create
//! lightweight `Task` handles and send `Event`s to them; events queued on one
//! task run in FIFO order and never on two workers at once, while distinct
//! tasks run concurrently. This serial-per-task guarantee is what consumers
//! such as I/O engines rely on to turn in-order event posting into in-order
//! delivery.
//!
//! Two event shapes exist: a one-shot closure (`Event::call`) and a readiness
//! notification (`Event::ready`) that invokes a [`Notify`] target without any
//! per-dispatch allocation.
//!
//! ```ignore
//! use taskio::{Config, Dispatcher, Event};
//!
//! let dispatcher = Dispatcher::new(Config::default());
//! let task = dispatcher.task();
//! task.send(Event::call(|| println!("ran on a worker")));
//! dispatcher.shutdown();
//! ```

mod config;
mod event;
mod task;
mod worker;

pub use config::Config;
pub use event::{Direction, Event, Notify};
pub use task::Task;
pub use worker::Dispatcher;
