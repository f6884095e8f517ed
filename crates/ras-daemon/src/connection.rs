//! Per-client link handling
//!
//! Every path ends up here: the responder side of the handshake, then a
//! loop answering keepalives and forwarding data until the client leaves.

use std::sync::Arc;
use std::time::Duration;

use ras_core::handshake::{self, HandshakeError};
use ras_core::{BoxedLink, PathType};
use ras_protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::{DaemonEvent, DaemonState};

/// Missed keepalives before a silent client is dropped
const IDLE_KEEPALIVES: u32 = 3;

/// Why a served link ended
#[derive(Debug)]
pub enum LinkEnd {
    /// Handshake failed or timed out
    Unauthenticated(Option<HandshakeError>),
    /// Client closed or went away
    Closed,
    /// No traffic for too long
    Idle,
    /// Daemon shutting down
    Cancelled,
}

/// Authenticate `link` and serve it until it ends
pub async fn serve_link(
    mut link: BoxedLink,
    path_type: PathType,
    state: Arc<DaemonState>,
    cancel: CancellationToken,
) -> LinkEnd {
    let peer = link.peer_addr();

    let handshake = tokio::time::timeout(
        state.config.handshake_timeout,
        handshake::respond(link.as_mut(), &state.keys.auth, state.session_id()),
    )
    .await;

    match handshake {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!("Handshake over {} from {:?} failed: {}", path_type, peer, e);
            let _ = link.close().await;
            return LinkEnd::Unauthenticated(Some(e));
        }
        Err(_) => {
            warn!("Handshake over {} from {:?} timed out", path_type, peer);
            let _ = link.close().await;
            return LinkEnd::Unauthenticated(None);
        }
    }

    info!("Client authenticated over {} from {:?}", path_type, peer);
    state.emit(DaemonEvent::ClientConnected { path_type, peer });

    let idle = state.config.keepalive_interval * IDLE_KEEPALIVES;
    let end = serve_authenticated(link.as_mut(), &state, idle, &cancel).await;

    let _ = link.close().await;
    state.emit(DaemonEvent::ClientDisconnected { path_type });
    info!("Client link over {} ended: {:?}", path_type, end);
    end
}

async fn serve_authenticated(
    link: &mut dyn ras_core::PeerLink,
    state: &DaemonState,
    idle: Duration,
    cancel: &CancellationToken,
) -> LinkEnd {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = link
                    .send(Message::Close { reason: Some("daemon shutting down".to_string()) })
                    .await;
                return LinkEnd::Cancelled;
            }
            received = tokio::time::timeout(idle, link.recv()) => received,
        };

        let message = match received {
            Err(_) => return LinkEnd::Idle,
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => return LinkEnd::Closed,
            Ok(Err(e)) => {
                debug!("Client link error: {}", e);
                return LinkEnd::Closed;
            }
        };

        match message {
            Message::Ping { timestamp } => {
                if link.send(Message::Pong { timestamp }).await.is_err() {
                    return LinkEnd::Closed;
                }
            }
            Message::Data(data) => state.emit(DaemonEvent::Data(data)),
            Message::Close { reason } => {
                debug!("Client closed: {:?}", reason);
                return LinkEnd::Closed;
            }
            other => debug!("Ignoring {:?} after handshake", other.message_type()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::PairingRecord;
    use bytes::Bytes;
    use ras_core::config::DaemonConfig;
    use ras_core::link::duplex_pair;
    use ras_core::{PeerLink, SessionKeys};
    use ras_protocol::MasterSecret;

    fn state() -> Arc<DaemonState> {
        let record =
            PairingRecord::generate("127.0.0.1:8821".parse().unwrap(), None, None).unwrap();
        let config = DaemonConfig {
            relay_server: "http://127.0.0.1:9".to_string(),
            handshake_timeout: Duration::from_millis(500),
            keepalive_interval: Duration::from_millis(200),
            ..DaemonConfig::default()
        };
        Arc::new(DaemonState::new(config, record, 8822).unwrap())
    }

    #[tokio::test]
    async fn test_authenticated_ping_and_data() {
        let state = state();
        let mut events = state.subscribe();
        let (server, mut client) = duplex_pair(4096);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(serve_link(
            Box::new(server),
            PathType::LanDirect,
            state.clone(),
            cancel.clone(),
        ));

        handshake::initiate(&mut client, &state.keys.auth, state.session_id())
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            DaemonEvent::ClientConnected { path_type: PathType::LanDirect, .. }
        ));

        client.send(Message::Ping { timestamp: 42 }).await.unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            Some(Message::Pong { timestamp: 42 })
        );

        client.send(Message::Data(Bytes::from_static(b"hi"))).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            DaemonEvent::Data(Bytes::from_static(b"hi"))
        );

        client.send(Message::Close { reason: None }).await.unwrap();
        assert!(matches!(task.await.unwrap(), LinkEnd::Closed));
    }

    #[tokio::test]
    async fn test_wrong_key_is_unauthenticated() {
        let state = state();
        let (server, mut client) = duplex_pair(4096);

        let task = tokio::spawn(serve_link(
            Box::new(server),
            PathType::Relayed,
            state.clone(),
            CancellationToken::new(),
        ));

        let wrong = SessionKeys::derive(&MasterSecret::from_bytes([9u8; 32])).unwrap();
        let result = handshake::initiate(&mut client, &wrong.auth, state.session_id()).await;
        assert!(result.is_err());
        assert!(matches!(
            task.await.unwrap(),
            LinkEnd::Unauthenticated(Some(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let state = state();
        let (server, _client) = duplex_pair(4096);

        let end = serve_link(
            Box::new(server),
            PathType::LanDirect,
            state,
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(end, LinkEnd::Unauthenticated(None)));
    }

    #[tokio::test]
    async fn test_idle_client_is_dropped() {
        let state = state();
        let (server, mut client) = duplex_pair(4096);

        let task = tokio::spawn(serve_link(
            Box::new(server),
            PathType::LanDirect,
            state.clone(),
            CancellationToken::new(),
        ));
        handshake::initiate(&mut client, &state.keys.auth, state.session_id())
            .await
            .unwrap();

        assert!(matches!(task.await.unwrap(), LinkEnd::Idle));
    }

    #[tokio::test]
    async fn test_cancel_closes_client() {
        let state = state();
        let (server, mut client) = duplex_pair(4096);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(serve_link(
            Box::new(server),
            PathType::LanDirect,
            state.clone(),
            cancel.clone(),
        ));
        handshake::initiate(&mut client, &state.keys.auth, state.session_id())
            .await
            .unwrap();

        cancel.cancel();
        assert!(matches!(
            client.recv().await.unwrap(),
            Some(Message::Close { .. })
        ));
        assert!(matches!(task.await.unwrap(), LinkEnd::Cancelled));
    }
}
