//! Relayed path
//!
//! Every frame goes through the push relay. Slow, but it needs nothing more
//! than outbound HTTPS from both peers.

use async_trait::async_trait;
use ras_core::relay::seal::{open_envelope, seal_envelope};
use ras_core::relay::{EventKind, RelayFrame, RelayLink, RelaySubscription};
use ras_core::{BoxedLink, DerivedKey, PathType};
use ras_protocol::signaling::{downstream_topic, upstream_topic};
use ras_protocol::SignalEnvelope;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{wait_for_envelope, CandidateError, PathCandidate, TransportContext};

/// Inbound frames buffered between the subscription and the link
const FEED_CAPACITY: usize = 64;

/// Link over the relay's signaling topics
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayedCandidate;

impl RelayedCandidate {
    pub fn new() -> Self {
        Self
    }
}

/// Forward this link's `RelayData` envelopes until the daemon closes it
async fn feed(
    mut subscription: RelaySubscription,
    key: DerivedKey,
    link_id: String,
    tx: mpsc::Sender<RelayFrame>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = subscription.next_event() => event,
        };

        let event = match event {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => {
                debug!("Relay feed for {} ended: {}", link_id, e);
                break;
            }
        };
        if event.kind() != EventKind::Message {
            continue;
        }
        let Some(text) = event.message else {
            continue;
        };

        match open_envelope(&key, &text) {
            Ok(SignalEnvelope::RelayData {
                link_id: id,
                seq,
                sealed,
            }) if id == link_id => {
                if tx.send(RelayFrame { seq, sealed }).await.is_err() {
                    break;
                }
            }
            Ok(SignalEnvelope::RelayClose { link_id: id }) if id == link_id => {
                debug!("Daemon closed relayed link {}", link_id);
                break;
            }
            Ok(_) => {}
            Err(e) => debug!("Ignoring relay signaling message: {}", e),
        }
    }
}

#[async_trait]
impl PathCandidate for RelayedCandidate {
    fn path_type(&self) -> PathType {
        PathType::Relayed
    }

    async fn attempt(&self, ctx: &TransportContext) -> Result<BoxedLink, CandidateError> {
        let topic = ctx.payload.relay_topic();
        let mut downstream = ctx.relay.subscribe(&downstream_topic(topic)).await?;

        let link_id = uuid::Uuid::new_v4().to_string();
        let open = SignalEnvelope::RelayOpen {
            link_id: link_id.clone(),
            session_id: ctx.payload.session_id().to_string(),
        };
        let outbound = upstream_topic(topic);
        ctx.relay
            .publish(&outbound, seal_envelope(&ctx.keys.signaling, &open)?)
            .await?;

        wait_for_envelope(&mut downstream, &ctx.keys.signaling, |envelope| match envelope {
            SignalEnvelope::RelayAccept { link_id: id } if id == link_id => Some(()),
            _ => None,
        })
        .await?;
        debug!("Relayed link {} accepted", link_id);

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(feed(
            downstream,
            ctx.keys.signaling.clone(),
            link_id.clone(),
            tx,
            cancel.clone(),
        ));

        let link = RelayLink::new(ctx.relay.clone(), outbound, link_id, &ctx.keys, rx)
            .with_guard(cancel.drop_guard());
        Ok(Box::new(link))
    }
}
