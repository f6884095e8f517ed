//! Direct TCP paths (overlay network and LAN)
//!
//! Both run the same exchange against a different address: a signed
//! `POST /v1/signal` to the daemon's signaling port, then a TCP connection to
//! the transport port named in the signed response.

use std::net::SocketAddr;

use async_trait::async_trait;
use rand::RngCore;
use ras_core::link::StreamLink;
use ras_core::signaling::{sign, verify};
use ras_core::time::current_time_secs;
use ras_core::{BoxedLink, ConnectionError, PathType};
use ras_protocol::signaling::{HEADER_SESSION, HEADER_SIGNATURE, HEADER_TIMESTAMP, SIGNAL_PATH};
use ras_protocol::{SignalRequest, SignalResponse};
use reqwest::StatusCode;
use tokio::net::TcpStream;
use tracing::debug;

use super::{CandidateError, PathCandidate, TransportContext};

/// Signaling + TCP towards one of the payload's addresses
#[derive(Debug, Clone, Copy)]
pub struct DirectCandidate {
    path_type: PathType,
}

impl DirectCandidate {
    /// Dial the payload's overlay address
    pub fn overlay() -> Self {
        Self {
            path_type: PathType::OverlayDirect,
        }
    }

    /// Dial the payload's rendezvous address
    pub fn lan() -> Self {
        Self {
            path_type: PathType::LanDirect,
        }
    }

    fn signaling_addr(&self, ctx: &TransportContext) -> Option<SocketAddr> {
        match self.path_type {
            PathType::OverlayDirect => ctx.payload.overlay_address(),
            _ => Some(ctx.payload.rendezvous()),
        }
    }
}

fn header<'a>(headers: &'a reqwest::header::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Run the signed signaling exchange and return the daemon's answer
pub async fn signal(
    ctx: &TransportContext,
    target: SocketAddr,
) -> Result<SignalResponse, CandidateError> {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let request = SignalRequest {
        request_nonce: hex::encode(nonce),
        client_addr: None,
    };
    let body = serde_json::to_vec(&request)
        .map_err(|e| ConnectionError::Unreachable(format!("encode signal request: {}", e)))?;

    let session_id = ctx.payload.session_id();
    let timestamp = current_time_secs();
    let signature = sign(&ctx.keys.auth, session_id, timestamp, &body);

    let url = format!("http://{}{}", target, SIGNAL_PATH);
    debug!("Signaling {}", url);

    let response = reqwest::Client::new()
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(HEADER_SESSION, session_id)
        .header(HEADER_TIMESTAMP, timestamp.to_string())
        .header(HEADER_SIGNATURE, signature)
        .body(body)
        .send()
        .await
        .map_err(|e| CandidateError::Unreachable(format!("{}: {}", target, e)))?;

    match response.status() {
        StatusCode::OK => {}
        StatusCode::NOT_FOUND => return Err(CandidateError::UnknownSession),
        StatusCode::UNAUTHORIZED => {
            return Err(CandidateError::Rejected("signature or timestamp refused".into()))
        }
        other => return Err(CandidateError::Rejected(format!("HTTP {}", other))),
    }

    let headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map_err(|e| CandidateError::Unreachable(format!("{}: {}", target, e)))?;

    let timestamp = header(&headers, HEADER_TIMESTAMP)
        .and_then(|t| t.parse::<u64>().ok())
        .ok_or_else(|| CandidateError::Verification("missing response timestamp".into()))?;
    let signature = header(&headers, HEADER_SIGNATURE)
        .ok_or_else(|| CandidateError::Verification("missing response signature".into()))?;

    verify(
        &ctx.keys.auth,
        session_id,
        timestamp,
        &body,
        signature,
        current_time_secs(),
        ctx.timestamp_tolerance_secs,
    )
    .map_err(|e| CandidateError::Verification(e.to_string()))?;

    let answer: SignalResponse = serde_json::from_slice(&body)
        .map_err(|e| CandidateError::Verification(format!("malformed response: {}", e)))?;
    if answer.request_nonce != request.request_nonce {
        return Err(CandidateError::Verification(
            "response does not answer this request".into(),
        ));
    }

    Ok(answer)
}

#[async_trait]
impl PathCandidate for DirectCandidate {
    fn path_type(&self) -> PathType {
        self.path_type
    }

    fn is_applicable(&self, ctx: &TransportContext) -> bool {
        self.signaling_addr(ctx).is_some()
    }

    async fn attempt(&self, ctx: &TransportContext) -> Result<BoxedLink, CandidateError> {
        let target = self
            .signaling_addr(ctx)
            .ok_or_else(|| CandidateError::Unreachable("no address for this path".into()))?;

        let answer = signal(ctx, target).await?;
        let transport = SocketAddr::new(target.ip(), answer.transport_port);
        debug!("Daemon transport at {}", transport);

        let stream = TcpStream::connect(transport)
            .await
            .map_err(|e| CandidateError::Unreachable(format!("{}: {}", transport, e)))?;

        Ok(Box::new(StreamLink::tcp(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode as HttpStatus};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::Router;
    use ras_core::relay::RelayClient;
    use ras_core::SessionKeys;
    use ras_protocol::{MasterSecret, PairingPayload};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn context(rendezvous: SocketAddr) -> TransportContext {
        let secret = MasterSecret::from_bytes([4u8; 32]);
        let payload = PairingPayload::new(rendezvous, secret.clone(), "s-direct").unwrap();
        TransportContext {
            payload,
            keys: Arc::new(SessionKeys::derive(&secret).unwrap()),
            relay: RelayClient::new("http://127.0.0.1:9").unwrap(),
            stun_servers: Vec::new(),
            timestamp_tolerance_secs: 300,
        }
    }

    /// Minimal signaling endpoint that answers with `transport_port`,
    /// optionally signing with the wrong key
    async fn serve_signal(transport_port: u16, keys: SessionKeys, honest: bool) -> SocketAddr {
        let app = Router::new().route(
            SIGNAL_PATH,
            post(move |headers: HeaderMap, body: axum::body::Bytes| {
                let keys = keys.clone();
                async move {
                    let session = headers[HEADER_SESSION].to_str().unwrap().to_string();
                    let request: SignalRequest = serde_json::from_slice(&body).unwrap();
                    let response = serde_json::to_vec(&SignalResponse {
                        request_nonce: request.request_nonce,
                        transport_port,
                        observed_addr: None,
                    })
                    .unwrap();
                    let ts = current_time_secs();
                    let key = if honest { &keys.auth } else { &keys.signaling };
                    let sig = sign(key, &session, ts, &response);
                    (
                        HttpStatus::OK,
                        [
                            (HEADER_TIMESTAMP, ts.to_string()),
                            (HEADER_SIGNATURE, sig),
                        ],
                        response,
                    )
                        .into_response()
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_lan_connects_to_signaled_port() {
        let transport = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport_port = transport.local_addr().unwrap().port();

        let probe = context("127.0.0.1:1".parse().unwrap());
        let signaling = serve_signal(transport_port, (*probe.keys).clone(), true).await;
        let ctx = context(signaling);

        let accept = tokio::spawn(async move { transport.accept().await.unwrap() });
        let link = DirectCandidate::lan().attempt(&ctx).await.unwrap();
        accept.await.unwrap();

        assert_eq!(link.peer_addr().unwrap().port(), transport_port);
    }

    #[tokio::test]
    async fn test_forged_response_rejected() {
        let probe = context("127.0.0.1:1".parse().unwrap());
        let signaling = serve_signal(1, (*probe.keys).clone(), false).await;
        let ctx = context(signaling);

        let err = DirectCandidate::lan().attempt(&ctx).await.err().unwrap();
        assert!(matches!(err, CandidateError::Verification(_)), "{err}");
    }

    #[tokio::test]
    async fn test_unknown_session_maps_to_404() {
        let app = Router::new().route(SIGNAL_PATH, post(|| async { HttpStatus::NOT_FOUND }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let err = DirectCandidate::lan().attempt(&context(addr)).await.err().unwrap();
        assert!(matches!(err, CandidateError::UnknownSession));
    }

    #[test]
    fn test_overlay_needs_overlay_address() {
        let ctx = context("192.168.1.100:8821".parse().unwrap());
        assert!(!DirectCandidate::overlay().is_applicable(&ctx));
        assert!(DirectCandidate::lan().is_applicable(&ctx));

        let mut with_overlay = ctx.clone();
        with_overlay.payload = with_overlay
            .payload
            .clone()
            .with_overlay_address("100.101.102.103:8821".parse().unwrap());
        assert!(DirectCandidate::overlay().is_applicable(&with_overlay));
    }
}
