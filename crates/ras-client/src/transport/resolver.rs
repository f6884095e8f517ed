//! Priority-ordered transport resolver

use std::time::{Duration, Instant};

use ras_core::config::CandidateTimeouts;
use ras_core::{ConnectionPath, PathType};
use tracing::{debug, info, warn};

use super::{
    AttemptFailure, CandidateError, DirectCandidate, EstablishedPath, NatCandidate,
    PathCandidate, RelayedCandidate, ResolveError, TransportContext,
};

fn priority(path_type: PathType) -> usize {
    PathType::PRIORITY_ORDER
        .iter()
        .position(|p| *p == path_type)
        .unwrap_or(usize::MAX)
}

/// Tries candidates in priority order until one connects
pub struct TransportResolver {
    candidates: Vec<Box<dyn PathCandidate>>,
    timeouts: CandidateTimeouts,
}

impl TransportResolver {
    /// Resolver with no candidates
    pub fn new(timeouts: CandidateTimeouts) -> Self {
        Self {
            candidates: Vec::new(),
            timeouts,
        }
    }

    /// Resolver with all four standard paths
    pub fn standard(timeouts: CandidateTimeouts) -> Self {
        Self::new(timeouts)
            .with_candidate(DirectCandidate::overlay())
            .with_candidate(DirectCandidate::lan())
            .with_candidate(NatCandidate::new())
            .with_candidate(RelayedCandidate::new())
    }

    /// Add a candidate; it is placed by its path's priority
    pub fn with_candidate(mut self, candidate: impl PathCandidate + 'static) -> Self {
        self.candidates.push(Box::new(candidate));
        // stable: equal priorities keep insertion order
        self.candidates.sort_by_key(|c| priority(c.path_type()));
        self
    }

    /// Path types in the order they will be tried
    pub fn order(&self) -> Vec<PathType> {
        self.candidates.iter().map(|c| c.path_type()).collect()
    }

    fn timeout_for(&self, path_type: PathType) -> Duration {
        match path_type {
            PathType::OverlayDirect => self.timeouts.overlay,
            PathType::LanDirect => self.timeouts.lan,
            PathType::NatTraversalDirect => self.timeouts.nat_traversal,
            PathType::Relayed => self.timeouts.relay,
        }
    }

    /// Establish the highest-priority path that works
    pub async fn resolve(&self, ctx: &TransportContext) -> Result<EstablishedPath, ResolveError> {
        let mut attempts = Vec::new();

        for candidate in &self.candidates {
            let path_type = candidate.path_type();
            if !candidate.is_applicable(ctx) {
                debug!("Skipping {}: not applicable", path_type);
                continue;
            }

            let limit = self.timeout_for(path_type);
            let started = Instant::now();
            debug!("Trying {} (timeout {:?})", path_type, limit);

            let result = match tokio::time::timeout(limit, candidate.attempt(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(CandidateError::Timeout(limit)),
            };

            match result {
                Ok(link) => {
                    let path = ConnectionPath::new(
                        path_type,
                        link.local_addr(),
                        link.peer_addr(),
                        started.elapsed(),
                    );
                    info!("Connected via {}", path);
                    return Ok(EstablishedPath { path, link });
                }
                Err(error) => {
                    warn!("{} failed: {}", path_type, error);
                    attempts.push(AttemptFailure { path_type, error });
                }
            }
        }

        Err(ResolveError::ConnectionFailed { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ras_core::link::duplex_pair;
    use ras_core::relay::RelayClient;
    use ras_core::{BoxedLink, SessionKeys};
    use ras_protocol::{MasterSecret, PairingPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Hang,
        Skip,
    }

    struct Scripted {
        path_type: PathType,
        behavior: Behavior,
        log: Arc<Mutex<Vec<PathType>>>,
    }

    #[async_trait]
    impl PathCandidate for Scripted {
        fn path_type(&self) -> PathType {
            self.path_type
        }

        fn is_applicable(&self, _ctx: &TransportContext) -> bool {
            !matches!(self.behavior, Behavior::Skip)
        }

        async fn attempt(&self, _ctx: &TransportContext) -> Result<BoxedLink, CandidateError> {
            self.log.lock().unwrap().push(self.path_type);
            match self.behavior {
                Behavior::Succeed => {
                    let (link, _peer) = duplex_pair(64);
                    Ok(Box::new(link))
                }
                Behavior::Fail => Err(CandidateError::Unreachable("scripted".to_string())),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Behavior::Skip => unreachable!("skipped candidates are never attempted"),
            }
        }
    }

    fn context() -> TransportContext {
        let secret = MasterSecret::from_bytes([2u8; 32]);
        let payload =
            PairingPayload::new("192.168.1.100:8821".parse().unwrap(), secret.clone(), "s-1")
                .unwrap();
        TransportContext {
            payload,
            keys: Arc::new(SessionKeys::derive(&secret).unwrap()),
            relay: RelayClient::new("http://127.0.0.1:9").unwrap(),
            stun_servers: Vec::new(),
            timestamp_tolerance_secs: 300,
        }
    }

    fn timeouts() -> CandidateTimeouts {
        CandidateTimeouts {
            overlay: Duration::from_millis(50),
            lan: Duration::from_millis(50),
            nat_traversal: Duration::from_millis(50),
            relay: Duration::from_millis(50),
        }
    }

    fn resolver(script: &[(PathType, Behavior)]) -> (TransportResolver, Arc<Mutex<Vec<PathType>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut resolver = TransportResolver::new(timeouts());
        for (path_type, behavior) in script {
            resolver = resolver.with_candidate(Scripted {
                path_type: *path_type,
                behavior: *behavior,
                log: log.clone(),
            });
        }
        (resolver, log)
    }

    #[test]
    fn test_standard_order() {
        assert_eq!(
            TransportResolver::standard(CandidateTimeouts::default()).order(),
            PathType::PRIORITY_ORDER.to_vec()
        );
    }

    #[tokio::test]
    async fn test_candidates_sorted_by_priority() {
        let (resolver, log) = resolver(&[
            (PathType::Relayed, Behavior::Succeed),
            (PathType::LanDirect, Behavior::Fail),
            (PathType::OverlayDirect, Behavior::Fail),
        ]);

        let established = resolver.resolve(&context()).await.unwrap();
        assert_eq!(established.path.path_type(), PathType::Relayed);
        assert_eq!(
            *log.lock().unwrap(),
            vec![PathType::OverlayDirect, PathType::LanDirect, PathType::Relayed]
        );
    }

    #[tokio::test]
    async fn test_first_success_stops() {
        let (resolver, log) = resolver(&[
            (PathType::OverlayDirect, Behavior::Skip),
            (PathType::LanDirect, Behavior::Succeed),
            (PathType::NatTraversalDirect, Behavior::Succeed),
            (PathType::Relayed, Behavior::Succeed),
        ]);

        let established = resolver.resolve(&context()).await.unwrap();
        assert_eq!(established.path.path_type(), PathType::LanDirect);
        assert_eq!(*log.lock().unwrap(), vec![PathType::LanDirect]);
    }

    #[tokio::test]
    async fn test_timeout_falls_through() {
        let (resolver, _log) = resolver(&[
            (PathType::LanDirect, Behavior::Hang),
            (PathType::NatTraversalDirect, Behavior::Succeed),
        ]);

        let established = resolver.resolve(&context()).await.unwrap();
        assert_eq!(established.path.path_type(), PathType::NatTraversalDirect);
    }

    #[tokio::test]
    async fn test_all_fail_lists_attempts_in_order() {
        let (resolver, _log) = resolver(&[
            (PathType::Relayed, Behavior::Hang),
            (PathType::OverlayDirect, Behavior::Skip),
            (PathType::NatTraversalDirect, Behavior::Fail),
            (PathType::LanDirect, Behavior::Fail),
        ]);

        let err = resolver.resolve(&context()).await.unwrap_err();
        let order: Vec<_> = err.attempts().iter().map(|a| a.path_type).collect();
        assert_eq!(
            order,
            vec![PathType::LanDirect, PathType::NatTraversalDirect, PathType::Relayed]
        );
        assert!(err.attempts()[2].error.is_timeout());
        assert!(!err.all_timed_out());
    }

    #[tokio::test]
    async fn test_nothing_reachable_tries_all_four() {
        let (resolver, log) = resolver(&[
            (PathType::Relayed, Behavior::Fail),
            (PathType::NatTraversalDirect, Behavior::Fail),
            (PathType::LanDirect, Behavior::Hang),
            (PathType::OverlayDirect, Behavior::Fail),
        ]);

        let err = resolver.resolve(&context()).await.unwrap_err();
        assert_eq!(*log.lock().unwrap(), PathType::PRIORITY_ORDER.to_vec());
        assert_eq!(err.attempts().len(), 4);
        assert!(matches!(err, ResolveError::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_lan_success_never_attempts_relay() {
        let (resolver, log) = resolver(&[
            (PathType::OverlayDirect, Behavior::Skip),
            (PathType::LanDirect, Behavior::Succeed),
            (PathType::Relayed, Behavior::Succeed),
        ]);

        resolver.resolve(&context()).await.unwrap();
        assert!(!log.lock().unwrap().contains(&PathType::Relayed));
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let resolver = TransportResolver::new(timeouts());
        let err = resolver.resolve(&context()).await.unwrap_err();
        assert!(err.attempts().is_empty());
        assert_eq!(err.to_string(), "all transport paths failed (no applicable path)");
    }

    #[tokio::test]
    async fn test_latency_is_measured() {
        struct Slow(AtomicUsize);

        #[async_trait]
        impl PathCandidate for Slow {
            fn path_type(&self) -> PathType {
                PathType::LanDirect
            }

            async fn attempt(&self, _ctx: &TransportContext) -> Result<BoxedLink, CandidateError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let (link, _peer) = duplex_pair(64);
                Ok(Box::new(link))
            }
        }

        let resolver = TransportResolver::new(timeouts()).with_candidate(Slow(AtomicUsize::new(0)));
        let established = resolver.resolve(&context()).await.unwrap();
        assert!(established.path.latency() >= Duration::from_millis(20));
    }
}
