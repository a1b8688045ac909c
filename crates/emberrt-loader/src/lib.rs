//! The Loader worker: a dedicated loading thread that reads binary images
//! from flash, verifies their integrity, and turns them into running
//! processes.
//!
//! Commands arrive on a bounded FIFO queue and are processed strictly in
//! arrival order; all flash reads and process creation happen on this one
//! thread, so at most one image is in flight at a time and the manager main
//! loop never blocks on storage I/O.

mod process;
mod worker;

pub use process::{HostCall, ProcessHost, ProcessImage, SimHost};
pub use worker::{LoadCommand, Loader, LoaderOutcome, QUEUE_DEPTH};
