//! Actor task that owns a [`BridgeCore`] and serializes every input.

use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;

use crate::bridge_core::{BridgeCollaborators, BridgeCore, BridgeInput, BridgeOptions};

#[derive(Debug, Clone)]
/// Cloneable entry point into a running bridge.
pub struct BridgeHandle {
    tx: UnboundedSender<BridgeInput>,
}

impl BridgeHandle {
    /// Returns `false` once the bridge loop has stopped.
    pub fn send_bridge_message(&self, message: Value) -> bool {
        self.tx.send(BridgeInput::BridgeMessage(message)).is_ok()
    }

    pub fn send_gateway_frame(&self, frame: Value) -> bool {
        self.tx.send(BridgeInput::GatewayFrame(frame)).is_ok()
    }

    pub fn gateway_disconnected(&self) -> bool {
        self.tx.send(BridgeInput::GatewayDisconnected).is_ok()
    }

    pub fn shutdown(&self) {
        if self.tx.send(BridgeInput::Shutdown).is_err() {
            tracing::debug!("bridge loop already stopped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Starts the bridge loop; it ends on [`BridgeHandle::shutdown`] or when every handle is dropped.
pub fn spawn_bridge(
    options: BridgeOptions,
    collaborators: BridgeCollaborators,
) -> (BridgeHandle, JoinHandle<()>) {
    let (tx, mut rx) = unbounded_channel();
    let mut core = BridgeCore::new(options, collaborators, tx.downgrade());
    let task = tokio::spawn(async move {
        while let Some(input) = rx.recv().await {
            let stop = matches!(input, BridgeInput::Shutdown);
            core.handle_input(input);
            if stop {
                break;
            }
        }
        core.shutdown();
        tracing::debug!(
            prompts = core.state().in_flight_request_ids().len(),
            "bridge loop stopped"
        );
    });
    (BridgeHandle { tx }, task)
}
