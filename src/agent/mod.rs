//! Automation agent embedded in the hosted chat client.

pub mod dom;
pub mod extract;
pub mod phone;
mod runtime;
pub mod sender;
pub mod silence;

pub use dom::{ChatSurface, DomNode, MemorySurface, MutationRecord, StructuralChangeNotifier};
pub use extract::{ChatMessage, Direction, MessageExtractor};
pub use runtime::{Agent, Phase};
pub use sender::OutboundSender;
pub use silence::{ActivityTable, ContactActivity, SilenceMonitor, SilencePolicy, SilenceReport};
