//! # Result Sink
//!
//! Outbound boundary of the completion phase. Sending never blocks the
//! completion context; an unreachable recipient is reported back so the
//! dispatcher can log and drop the message.

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::message::{Endpoint, OutboundMessage, Recipient};
use crate::constants::ComponentType;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Recipient {recipient} is unreachable")]
    Unreachable { recipient: String },
}

/// Delivers task results to cluster components
pub trait ResultSink: Send + Sync {
    fn send(&self, recipient: &Recipient, message: OutboundMessage) -> Result<(), SendError>;
}

/// In-process sink routing results to per-endpoint channels.
///
/// Components are registered under their endpoint; a component recipient is
/// resolved to that endpoint at send time.
#[derive(Debug, Default)]
pub struct ChannelResultSink {
    channels: DashMap<Endpoint, mpsc::UnboundedSender<OutboundMessage>>,
    components: DashMap<(ComponentType, u64), Endpoint>,
}

impl ChannelResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel for `endpoint`, replacing any previous one
    pub fn connect(&self, endpoint: Endpoint) -> mpsc::UnboundedReceiver<OutboundMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        debug!(endpoint = %endpoint, "Endpoint connected to result sink");
        self.channels.insert(endpoint, sender);
        receiver
    }

    /// Forget an endpoint; later sends to it are unreachable
    pub fn disconnect(&self, endpoint: &Endpoint) {
        self.channels.remove(endpoint);
        self.components.retain(|_, registered| registered != endpoint);
    }

    /// Make a component addressable by type and id
    pub fn register_component(
        &self,
        component_type: ComponentType,
        component_id: u64,
        endpoint: Endpoint,
    ) {
        self.components.insert((component_type, component_id), endpoint);
    }

    fn resolve(&self, recipient: &Recipient) -> Option<Endpoint> {
        match recipient {
            Recipient::Endpoint(endpoint) => Some(endpoint.clone()),
            Recipient::Component {
                component_type,
                component_id,
            } => self
                .components
                .get(&(*component_type, *component_id))
                .map(|entry| entry.value().clone()),
        }
    }
}

impl ResultSink for ChannelResultSink {
    fn send(&self, recipient: &Recipient, message: OutboundMessage) -> Result<(), SendError> {
        let unreachable = || SendError::Unreachable {
            recipient: recipient.to_string(),
        };

        let endpoint = self.resolve(recipient).ok_or_else(unreachable)?;
        let channel = self.channels.get(&endpoint).ok_or_else(unreachable)?;
        channel.send(message).map_err(|_| unreachable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ServerErrorCode;

    fn message() -> OutboundMessage {
        OutboundMessage::PasswordChanged {
            entity_id: 1,
            account_name: "alice".to_string(),
            result: ServerErrorCode::Success,
        }
    }

    #[test]
    fn test_routes_to_connected_endpoint() {
        let sink = ChannelResultSink::new();
        let endpoint = Endpoint::new("baseapp-1");
        let mut inbox = sink.connect(endpoint.clone());

        sink.send(&Recipient::Endpoint(endpoint), message()).unwrap();
        assert_eq!(inbox.try_recv().unwrap(), message());
    }

    #[test]
    fn test_component_resolution() {
        let sink = ChannelResultSink::new();
        let endpoint = Endpoint::new("cellapp-3");
        let mut inbox = sink.connect(endpoint.clone());
        sink.register_component(ComponentType::Cellapp, 3, endpoint);

        let recipient = Recipient::Component {
            component_type: ComponentType::Cellapp,
            component_id: 3,
        };
        sink.send(&recipient, message()).unwrap();
        assert!(inbox.try_recv().is_ok());

        let unknown = Recipient::Component {
            component_type: ComponentType::Baseapp,
            component_id: 3,
        };
        assert!(matches!(
            sink.send(&unknown, message()),
            Err(SendError::Unreachable { .. })
        ));
    }

    #[test]
    fn test_disconnected_endpoint_is_unreachable() {
        let sink = ChannelResultSink::new();
        let endpoint = Endpoint::new("loginapp-1");
        let _inbox = sink.connect(endpoint.clone());
        sink.disconnect(&endpoint);

        let err = sink
            .send(&Recipient::Endpoint(endpoint), message())
            .unwrap_err();
        assert_eq!(err.to_string(), "Recipient loginapp-1 is unreachable");
    }
}
