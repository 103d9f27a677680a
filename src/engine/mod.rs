//! Dispatch engine: the public dispatcher, its worker loops, and the
//! dependency wakeup list.

pub mod dispatcher;
mod waitlist;
mod worker;

pub use dispatcher::{Dispatcher, DispatcherConfig};
