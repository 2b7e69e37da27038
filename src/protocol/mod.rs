//! Wire protocol shared by every context: envelopes, call and event kinds,
//! the cross-context error taxonomy and correlation id generation.

pub mod envelope;
pub mod error;
pub mod ids;

pub use envelope::{
    decode_data, Attachment, CallKind, ConnectRequest, DisconnectRequest, Envelope, Event,
    EventKind, OperateRequest, QueueMessageRequest, SendMessageRequest, EVENT_KIND, RESPONSE_KIND,
};
pub use error::{RelayError, WireError};
pub use ids::{IdSource, SequentialIdSource};
