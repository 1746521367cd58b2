#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod block;
pub mod config;
pub mod envelope;
pub mod error;
pub mod loader;
pub mod local;
pub mod master;
pub mod operation;
pub mod pipeline;
pub mod sink;
pub mod staged;
pub mod types;

// Algorithm kernels built on the pattern
#[path = "../kernels/mod.rs"]
pub mod kernels;

pub use block::{CsrBlock, LabeledBlock, PartitionBlock};
pub use envelope::{Envelope, Payload};
pub use error::{KernelError, PipelineError};
pub use pipeline::{Coordinator, Factorization};
pub use types::{GlobalResult, KeyedPartialCollection, NamedTables, PartitionIndex, TaskContext};
