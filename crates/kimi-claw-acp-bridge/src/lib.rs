//! ACP to gateway protocol bridge.
//!
//! The remote endpoint speaks ACP JSON-RPC; the local gateway speaks its own
//! `req`/`res`/`event` framing. [`BridgeCore`] owns all session and prompt
//! state and is driven by a single actor task ([`spawn_bridge`]) so every
//! handler runs to completion before the next input is looked at. Timers,
//! file resolution, and stream resumption run as side tasks that report back
//! through the same input channel.

pub mod acp_outbound;
pub mod assistant_stream_queue;
pub mod bridge_core;
pub mod bridge_errors;
pub mod bridge_runtime;
pub mod content_blocks;
pub mod file_resolver;
pub mod gateway_events;
pub mod history_replay;
pub mod local_session_history;
pub mod message_filter;
pub mod observability;
pub mod payload_fields;
pub mod prompt_converter;
pub mod request_handler;
pub mod session_state;

#[cfg(test)]
mod test_support;

pub use acp_outbound::*;
pub use assistant_stream_queue::*;
pub use bridge_core::*;
pub use bridge_errors::*;
pub use bridge_runtime::*;
pub use file_resolver::*;
pub use local_session_history::*;
pub use message_filter::*;
pub use observability::*;
pub use prompt_converter::*;
pub use session_state::*;
