//! Command stream production, delivery, and consumption.
//!
//! The coordinator is the only producer; workers consume one sequential
//! ordered stream each. The fabric underneath is swappable, but its
//! guarantees are not: identical bytes, identical order, to every worker.

pub mod cluster;
pub mod coordinator;
pub mod fabric;
pub mod worker;

pub use self::cluster::LocalCluster;
pub use self::coordinator::{Coordinator, FrameRouter};
pub use self::fabric::{ChannelFabric, Fabric, ReplyInbox, WorkerChannel, WorkerLink};
pub use self::worker::run_worker;
