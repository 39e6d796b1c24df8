//! Queue agent worker: pulls jobs from the queue, runs them on the
//! configured backend, stores the results and publishes the outcome.

pub mod config;
pub mod notify;
pub mod queue;
pub mod shutdown;
pub mod storage;
pub mod trace;
pub mod worker;
