//! WebSocket gateway for the voice relay.
//!
//! Each browser tab holds one WebSocket. The gateway gives every connection a
//! session task that bridges microphone audio to transcription, utterances to
//! the conversation engine, and replies to streamed speech.

pub mod connection;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;

pub use registry::{SessionHandle, SessionRegistry};
pub use server::start_gateway;
pub use session::SessionServices;
pub use state::GatewayState;
