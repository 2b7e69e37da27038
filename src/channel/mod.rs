pub mod memory;
pub mod socket;
pub mod traits;

pub use memory::{duplex, LinkControl, MemoryChannel};
pub use traits::{Channel, ChannelEnd};
