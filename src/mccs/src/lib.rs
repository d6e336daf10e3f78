//! Communicator setup protocol and execution-plan executor.
//!
//! A [`Communicator`] turns connect / exchange requests into live
//! transports and remote memory handles through two-phase [`SetupBatch`]es.
//! An [`Executor`] builds, caches and launches execution contexts for an
//! [`ExecutionPlan`] on one rank.

pub mod bootstrap;
pub mod channel;
pub mod communicator;
pub mod config;
pub mod error;
pub mod executor;
pub mod gpu;
pub mod kernel;
pub mod memory;
pub mod plan;
pub mod proxy;
pub mod semaphore;
pub mod setup;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use communicator::{Communicator, CommunicatorBuilder};
pub use error::{Error, ErrorCode, Result};
pub use executor::Executor;
pub use kernel::{DataType, PacketType};
pub use memory::RegisteredMemory;
pub use plan::ExecutionPlan;
pub use setup::{SetupBatch, SetupFuture, Setuppable};
pub use transport::{Transport, TransportFlags};
