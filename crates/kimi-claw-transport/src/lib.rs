//! Reconnecting WebSocket transports for both legs of the Kimi Claw bridge.
//!
//! `JsonRpcWsClient` carries ACP JSON-RPC to the remote bridge endpoint and is
//! ready as soon as the socket opens. `HandshakeWsClient` talks to the local
//! gateway and only becomes ready after a signed `connect` exchange. Both share
//! the same runtime: liveness probes, text heartbeat interception, exponential
//! backoff, and a bounded outbound queue that survives reconnects.

pub mod device_identity;
pub mod handshake_ws_client;
pub mod jsonrpc_ws_client;
pub mod outbound_queue;
pub mod reconnect_backoff;
pub mod transport_contract;
pub mod ws_client_runtime;

pub use device_identity::*;
pub use handshake_ws_client::*;
pub use jsonrpc_ws_client::*;
pub use outbound_queue::*;
pub use reconnect_backoff::*;
pub use transport_contract::*;
pub use ws_client_runtime::*;
