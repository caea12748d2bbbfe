//! Signaling channel to the call-control server.
//!
//! - [`messages`] - wire envelope, outbound intents, inbound events
//! - [`MessageQueue`] - gated FIFO with per-message enqueue predicate
//! - [`SignalingChannel`] - connect/send/disconnect over a [`SignalingConnector`]
//! - [`WebSocketConnector`] - production connector

mod channel;
pub mod messages;
mod queue;
mod websocket;

pub use channel::{
    ChannelClosed, ChannelState, ConnectResult, SignalingChannel, SignalingConnector,
    SignalingReceivers, SignalingSink, StreamEvent,
};
pub use messages::{InboundMessage, OutboundMessage};
pub use queue::{Disposition, MessageQueue};
pub use websocket::WebSocketConnector;
