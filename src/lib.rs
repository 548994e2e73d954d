// COLOCATE LIBRARY
// PURE SCHEDULING LOGIC PLUS THE PROCFS AND PROCESS ADAPTERS.
// THE BINARY IS A THIN CLI OVER control::Controller.

pub mod backend;
pub mod control;
pub mod cores;
pub mod error;
pub mod event;
pub mod job;
pub mod load;
pub mod metrics;
pub mod phase;
pub mod policy;
pub mod record;
