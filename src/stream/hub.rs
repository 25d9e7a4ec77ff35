use crate::error::StreamError;
use crate::stream::client::{StreamClient, StreamSettings};
use crate::stream::transport::FeedTransport;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Keeps at most one live `StreamClient` per instrument.
pub struct StreamHub {
    transport: Option<Arc<dyn FeedTransport>>,
    settings: StreamSettings,
    clients: RwLock<HashMap<String, Arc<StreamClient>>>,
}

impl StreamHub {
    pub fn new(transport: Option<Arc<dyn FeedTransport>>, settings: StreamSettings) -> Self {
        Self {
            transport,
            settings,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.transport.is_some()
    }

    /// The connected (or connecting) client for `instrument`, created on first use.
    /// A client that has closed is replaced by a fresh one.
    pub fn client(&self, instrument: &str) -> Result<Arc<StreamClient>, StreamError> {
        let transport = self.transport.clone().ok_or(StreamError::NotConfigured)?;

        if let Some(client) = self.clients.read().get(instrument) {
            if !client.is_closed() {
                return Ok(client.clone());
            }
        }

        let mut clients = self.clients.write();
        if let Some(client) = clients.get(instrument) {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            debug!(instrument, "Replacing closed push feed client");
        }

        let client = Arc::new(StreamClient::new(instrument, transport, self.settings));
        client.connect();
        clients.insert(instrument.to_string(), client.clone());
        Ok(client)
    }

    pub fn get(&self, instrument: &str) -> Option<Arc<StreamClient>> {
        self.clients.read().get(instrument).cloned()
    }

    pub fn disconnect(&self, instrument: &str) -> bool {
        match self.clients.write().remove(instrument) {
            Some(client) => {
                client.disconnect();
                true
            }
            None => false,
        }
    }

    pub fn disconnect_all(&self) {
        let clients: Vec<Arc<StreamClient>> = self.clients.write().drain().map(|(_, c)| c).collect();
        if !clients.is_empty() {
            info!(count = clients.len(), "Disconnecting all push feeds");
        }
        for client in clients {
            client.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_hub_refuses() {
        let hub = StreamHub::new(None, StreamSettings::default());
        assert!(!hub.is_configured());
        assert!(matches!(hub.client("AAPL"), Err(StreamError::NotConfigured)));
    }
}
