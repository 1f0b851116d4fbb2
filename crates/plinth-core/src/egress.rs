use std::time::Instant;

use dashmap::DashMap;

use crate::error::CoreError;
use crate::session::SessionId;

/// An advertised media endpoint for one session.
#[derive(Debug, Clone)]
pub struct MediaEndpoint {
    pub url: String,
    pub allocated_at: Instant,
}

/// Publishes per-session media URLs.
///
/// Workers report the URL they actually bound (typically on a loopback or
/// node-local address); the publisher rewrites it against the configured
/// public host before advertising it to clients. Revoking a session forgets
/// both the reported and the advertised URL, so nothing can be re-allocated
/// for that session id afterwards.
pub struct EgressPublisher {
    /// Host (optionally `host:port`) advertised to clients in place of the
    /// worker-local authority. None means advertise worker URLs as-is.
    public_host: Option<String>,
    reported: DashMap<SessionId, String>,
    endpoints: DashMap<SessionId, MediaEndpoint>,
}

impl EgressPublisher {
    pub fn new(public_host: Option<String>) -> Self {
        Self {
            public_host,
            reported: DashMap::new(),
            endpoints: DashMap::new(),
        }
    }

    /// Record the URL a worker reported on readiness.
    pub fn record_worker_url(&self, session_id: &SessionId, url: &str) {
        tracing::debug!(session_id = %session_id, url, "worker media url reported");
        self.reported.insert(session_id.clone(), url.to_string());
    }

    /// Advertise the session's media endpoint.
    ///
    /// Fails with `WorkerNotReady` when the worker has not reported a URL
    /// (or the session was revoked).
    pub fn allocate(&self, session_id: &SessionId) -> Result<String, CoreError> {
        let worker_url = self
            .reported
            .get(session_id)
            .map(|r| r.value().clone())
            .ok_or(CoreError::WorkerNotReady)?;

        let url = self.rewrite(&worker_url);
        self.endpoints.insert(
            session_id.clone(),
            MediaEndpoint {
                url: url.clone(),
                allocated_at: Instant::now(),
            },
        );
        tracing::info!(session_id = %session_id, url = %url, "media endpoint allocated");
        Ok(url)
    }

    /// The currently advertised URL for a session, if any.
    pub fn lookup(&self, session_id: &SessionId) -> Option<String> {
        self.endpoints.get(session_id).map(|e| e.url.clone())
    }

    /// Stop advertising the session's endpoint.
    pub fn revoke(&self, session_id: &SessionId) {
        self.reported.remove(session_id);
        if self.endpoints.remove(session_id).is_some() {
            tracing::info!(session_id = %session_id, "media endpoint revoked");
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Swap the worker-local authority for the public one. Worker URLs that
    /// do not parse are advertised untouched rather than dropped.
    fn rewrite(&self, raw: &str) -> String {
        let Some(public_host) = self.public_host.as_deref() else {
            return raw.to_string();
        };

        let mut parsed = match url::Url::parse(raw) {
            Ok(u) => u,
            Err(e) => {
                tracing::warn!(url = raw, error = %e, "unparseable worker url, advertising as-is");
                return raw.to_string();
            }
        };

        let (host, port) = match public_host.rsplit_once(':') {
            Some((h, p)) => match p.parse::<u16>() {
                Ok(port) => (h, Some(port)),
                Err(_) => (public_host, None),
            },
            None => (public_host, None),
        };

        if parsed.set_host(Some(host)).is_err() {
            tracing::warn!(url = raw, host, "public host rewrite failed, advertising as-is");
            return raw.to_string();
        }
        if let Some(port) = port {
            let _ = parsed.set_port(Some(port));
        }
        parsed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_before_ready_fails() {
        let egress = EgressPublisher::new(None);
        let id = SessionId::new();
        assert!(matches!(
            egress.allocate(&id),
            Err(CoreError::WorkerNotReady)
        ));
    }

    #[test]
    fn allocate_returns_reported_url() {
        let egress = EgressPublisher::new(None);
        let id = SessionId::new();
        egress.record_worker_url(&id, "rtsp://127.0.0.1:8554/42");

        let url = egress.allocate(&id).unwrap();
        assert_eq!(url, "rtsp://127.0.0.1:8554/42");
        assert_eq!(egress.lookup(&id), Some(url));
    }

    #[test]
    fn revoke_forgets_the_session() {
        let egress = EgressPublisher::new(None);
        let id = SessionId::new();
        egress.record_worker_url(&id, "rtsp://127.0.0.1:8554/42");
        egress.allocate(&id).unwrap();

        egress.revoke(&id);
        assert_eq!(egress.lookup(&id), None);
        // A revoked session cannot be re-allocated.
        assert!(matches!(
            egress.allocate(&id),
            Err(CoreError::WorkerNotReady)
        ));
    }

    #[test]
    fn public_host_rewrites_authority() {
        let egress = EgressPublisher::new(Some("stream.example.com".into()));
        let id = SessionId::new();
        egress.record_worker_url(&id, "rtsp://127.0.0.1:8554/42");

        let url = egress.allocate(&id).unwrap();
        assert_eq!(url, "rtsp://stream.example.com:8554/42");
    }

    #[test]
    fn public_host_with_port_rewrites_both() {
        let egress = EgressPublisher::new(Some("stream.example.com:9554".into()));
        let id = SessionId::new();
        egress.record_worker_url(&id, "rtsp://127.0.0.1:8554/42");

        let url = egress.allocate(&id).unwrap();
        assert_eq!(url, "rtsp://stream.example.com:9554/42");
    }

    #[test]
    fn re_report_refreshes_the_endpoint() {
        let egress = EgressPublisher::new(None);
        let id = SessionId::new();
        egress.record_worker_url(&id, "rtsp://127.0.0.1:8554/42");
        egress.allocate(&id).unwrap();

        // Worker restarted and reported again.
        egress.record_worker_url(&id, "rtsp://127.0.0.1:8555/42");
        let url = egress.allocate(&id).unwrap();
        assert_eq!(url, "rtsp://127.0.0.1:8555/42");
    }
}
