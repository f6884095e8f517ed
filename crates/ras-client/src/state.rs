//! Active connection state

use ras_core::{BoxedLink, ConnectionError, ConnectionPath};
use ras_protocol::Message;
use tokio::sync::{watch, Mutex};

use crate::pairing::AuthenticatedChannel;

/// Holds the one live channel to the daemon.
///
/// The path and the link are swapped together; a reconnection replaces both
/// and observers see the new path, never a half-updated one.
pub struct ConnectionSlot {
    path: watch::Sender<Option<ConnectionPath>>,
    link: Mutex<Option<BoxedLink>>,
}

impl Default for ConnectionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSlot {
    pub fn new() -> Self {
        let (path, _) = watch::channel(None);
        Self {
            path,
            link: Mutex::new(None),
        }
    }

    /// Current path, if connected
    pub fn current(&self) -> Option<ConnectionPath> {
        self.path.borrow().clone()
    }

    /// Watch path changes
    pub fn subscribe(&self) -> watch::Receiver<Option<ConnectionPath>> {
        self.path.subscribe()
    }

    /// Install a freshly authenticated channel, closing the one it replaces
    pub async fn replace(&self, channel: AuthenticatedChannel) {
        let mut link = self.link.lock().await;
        let previous = link.replace(channel.link);
        self.path.send_replace(Some(channel.path));
        drop(link);

        if let Some(mut previous) = previous {
            if let Err(e) = previous.close().await {
                tracing::debug!("Closing replaced link: {}", e);
            }
        }
    }

    /// Drop the current channel, closing it
    pub async fn clear(&self) {
        let previous = {
            let mut link = self.link.lock().await;
            self.path.send_replace(None);
            link.take()
        };

        if let Some(mut previous) = previous {
            let _ = previous.close().await;
        }
    }

    /// Send on the current link
    pub async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        match self.link.lock().await.as_mut() {
            Some(link) => link.send(message).await,
            None => Err(ConnectionError::Closed),
        }
    }

    /// Send `message` and wait for the next inbound frame
    pub async fn request(&self, message: Message) -> Result<Option<Message>, ConnectionError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(ConnectionError::Closed)?;
        link.send(message).await?;
        link.recv().await
    }
}
