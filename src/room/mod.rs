pub mod actor;
pub mod outbound;
pub mod registry;
pub mod stats;

pub use actor::{ConnId, RoomCommand};
pub use registry::{AcquireError, Registry, RoomHandle};
