//! sentlog - follows log files, extracts fields with grok patterns and reports
//! matching lines to Sentry.
//!
//! The binary wires these modules together; the library is split the same way
//! the runtime is: a [`runner::Supervisor`] owns generations of
//! [`worker::InputWorker`]s, each of which tails one file
//! ([`tailer`]), matches lines ([`matcher`]) and reports them ([`reporter`]).

pub mod budget;
pub mod cli;
pub mod config;
pub mod error;
pub mod grok;
pub mod logging;
pub mod matcher;
pub mod metrics;
pub mod reporter;
pub mod runner;
pub mod seek;
pub mod tailer;
pub mod timestamp;
pub mod watcher;
pub mod worker;
