use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use livechat_core::config::LivechatConfig;
use livechat_core::errors::{ConnectionError, SubsystemError};
use livechat_core::lifecycle::Subsystem;

const CONFIG_ENDPOINT: &str = "api/v1/livechat/config";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Ready,
    Failed,
}

/// The session with the livechat backend. `init` resolves once the widget
/// configuration has been fetched for this visitor.
pub trait ConnectionManager: Subsystem {
    fn status(&self) -> ConnectionStatus;
    /// Configuration from the last successful handshake.
    fn config(&self) -> Option<LivechatConfig>;
}

/// Retry schedule for retryable handshake failures.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff (`base * 2^attempt`, capped) with ±`jitter_factor`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let range = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if range > 0.0 {
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Settings for [`RestConnection`].
#[derive(Debug)]
pub struct ConnectionOptions {
    pub server_url: String,
    /// Returning visitor's token, sent as the `token` query parameter.
    pub token: Option<SecretString>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Deserialize)]
struct ConfigEnvelope {
    config: LivechatConfig,
}

struct Session {
    status: ConnectionStatus,
    config: Option<LivechatConfig>,
}

/// Handshake over the REST config endpoint.
pub struct RestConnection {
    client: Client,
    endpoint: Url,
    token: Option<SecretString>,
    timeout: Duration,
    retry: RetryPolicy,
    session: Mutex<Session>,
    /// Bumped by `reset`; an `init` that started under an older value is stale.
    generation: AtomicU64,
    total_retries: AtomicU64,
}

impl RestConnection {
    pub fn new(options: ConnectionOptions) -> Result<Self, SubsystemError> {
        let base = format!("{}/", options.server_url.trim_end_matches('/'));
        let endpoint = Url::parse(&base)
            .and_then(|url| url.join(CONFIG_ENDPOINT))
            .map_err(|e| SubsystemError::InvalidConfig {
                subsystem: "connection",
                message: format!("invalid server url {:?}: {e}", options.server_url),
            })?;

        Ok(Self {
            client: Client::new(),
            endpoint,
            token: options.token,
            timeout: options.timeout,
            retry: options.retry,
            session: Mutex::new(Session {
                status: ConnectionStatus::Idle,
                config: None,
            }),
            generation: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    fn request_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        if let Some(token) = &self.token {
            let _ = url
                .query_pairs_mut()
                .append_pair("token", token.expose_secret());
        }
        url
    }

    async fn fetch_once(&self) -> Result<LivechatConfig, ConnectionError> {
        let resp = match tokio::time::timeout(self.timeout, self.client.get(self.request_url()).send()).await {
            Err(_) => return Err(ConnectionError::Timeout(self.timeout)),
            Ok(Err(e)) if e.is_timeout() => return Err(ConnectionError::Timeout(self.timeout)),
            Ok(Err(e)) => return Err(ConnectionError::NetworkError(e.to_string())),
            Ok(Ok(resp)) => resp,
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ConnectionError::from_status(status, body));
        }

        let envelope: ConfigEnvelope = resp
            .json()
            .await
            .map_err(|e| ConnectionError::InvalidResponse(e.to_string()))?;
        if !envelope.config.enabled {
            return Err(ConnectionError::WidgetDisabled);
        }
        Ok(envelope.config)
    }

    async fn fetch_with_retry(&self, generation: u64) -> Result<LivechatConfig, ConnectionError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once().await {
                Ok(config) => return Ok(config),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error_kind = e.error_kind(),
                        error = %e,
                        "handshake failed, retrying"
                    );
                    attempt += 1;
                    let _ = self.total_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    if self.generation.load(Ordering::SeqCst) != generation {
                        return Err(ConnectionError::Reset);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl ConnectionManager for RestConnection {
    fn status(&self) -> ConnectionStatus {
        self.session.lock().status
    }

    fn config(&self) -> Option<LivechatConfig> {
        self.session.lock().config.clone()
    }
}

#[async_trait]
impl Subsystem for RestConnection {
    fn name(&self) -> &'static str {
        "connection"
    }

    #[instrument(skip(self), fields(subsystem = "connection", endpoint = %self.endpoint))]
    async fn init(&self) -> Result<(), SubsystemError> {
        let generation = self.generation.load(Ordering::SeqCst);
        self.session.lock().status = ConnectionStatus::Connecting;

        let result = self.fetch_with_retry(generation).await;

        let mut session = self.session.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("connection reset during handshake, discarding result");
            return Err(SubsystemError::Connection {
                subsystem: self.name(),
                source: ConnectionError::Reset,
            });
        }
        match result {
            Ok(config) => {
                info!(online = config.online, triggers = config.triggers.len(), "connection ready");
                session.config = Some(config);
                session.status = ConnectionStatus::Ready;
                Ok(())
            }
            Err(source) => {
                session.status = ConnectionStatus::Failed;
                Err(SubsystemError::Connection {
                    subsystem: self.name(),
                    source,
                })
            }
        }
    }

    async fn reset(&self) -> Result<(), SubsystemError> {
        let mut session = self.session.lock();
        let _ = self.generation.fetch_add(1, Ordering::SeqCst);
        session.status = ConnectionStatus::Idle;
        session.config = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options(server: &MockServer, token: Option<&str>) -> ConnectionOptions {
        ConnectionOptions {
            server_url: server.uri(),
            token: token.map(|t| SecretString::from(t.to_string())),
            timeout: Duration::from_secs(2),
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                jitter_factor: 0.0,
            },
        }
    }

    fn config_body(enabled: bool) -> serde_json::Value {
        serde_json::json!({
            "config": {
                "enabled": enabled,
                "online": true,
                "settings": {"registrationForm": true},
                "triggers": []
            }
        })
    }

    #[test]
    fn endpoint_joins_server_url() {
        let conn = RestConnection::new(ConnectionOptions {
            server_url: "https://chat.example.com/".into(),
            token: None,
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        })
        .unwrap();
        assert_eq!(
            conn.endpoint().as_str(),
            "https://chat.example.com/api/v1/livechat/config"
        );
    }

    #[test]
    fn invalid_server_url_is_config_error() {
        let result = RestConnection::new(ConnectionOptions {
            server_url: "not a url".into(),
            token: None,
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        });
        assert!(matches!(result, Err(SubsystemError::InvalidConfig { .. })));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter_factor: 0.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter_factor: 0.2,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(1000),
            ..Default::default()
        };
        for _ in 0..50 {
            let d = policy.delay(0).as_millis();
            assert!((800..=1200).contains(&d), "delay {d} out of range");
        }
    }

    #[tokio::test]
    async fn init_fetches_config_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/livechat/config"))
            .and(query_param("token", "visitor-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(config_body(true)))
            .expect(1)
            .mount(&server)
            .await;

        let conn = RestConnection::new(options(&server, Some("visitor-1"))).unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Idle);
        conn.init().await.unwrap();

        assert_eq!(conn.status(), ConnectionStatus::Ready);
        let config = conn.config().unwrap();
        assert!(config.online);
        assert!(config.settings.registration_form);
    }

    #[tokio::test]
    async fn retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/livechat/config"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/livechat/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(config_body(true)))
            .mount(&server)
            .await;

        let conn = RestConnection::new(options(&server, None)).unwrap();
        conn.init().await.unwrap();
        assert_eq!(conn.total_retries(), 1);
        assert_eq!(conn.status(), ConnectionStatus::Ready);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let conn = RestConnection::new(options(&server, None)).unwrap();
        let err = conn.init().await.unwrap_err();
        assert!(matches!(
            err,
            SubsystemError::Connection {
                source: ConnectionError::ServerError { status: 500, .. },
                ..
            }
        ));
        assert_eq!(conn.status(), ConnectionStatus::Failed);
        assert!(conn.config().is_none());
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .expect(1)
            .mount(&server)
            .await;

        let conn = RestConnection::new(options(&server, Some("stale"))).unwrap();
        let err = conn.init().await.unwrap_err();
        assert!(matches!(
            err,
            SubsystemError::Connection {
                source: ConnectionError::AuthenticationFailed(_),
                ..
            }
        ));
        assert_eq!(conn.total_retries(), 0);
    }

    #[tokio::test]
    async fn disabled_widget_fails_init() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(config_body(false)))
            .mount(&server)
            .await;

        let conn = RestConnection::new(options(&server, None)).unwrap();
        let err = conn.init().await.unwrap_err();
        assert!(matches!(
            err,
            SubsystemError::Connection {
                source: ConnectionError::WidgetDisabled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let conn = RestConnection::new(options(&server, None)).unwrap();
        let err = conn.init().await.unwrap_err();
        assert!(matches!(
            err,
            SubsystemError::Connection {
                source: ConnectionError::InvalidResponse(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(config_body(true))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let mut opts = options(&server, None);
        opts.timeout = Duration::from_millis(50);
        opts.retry.max_retries = 0;
        let conn = RestConnection::new(opts).unwrap();
        let err = conn.init().await.unwrap_err();
        assert!(matches!(
            err,
            SubsystemError::Connection {
                source: ConnectionError::Timeout(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn reset_during_handshake_discards_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(config_body(true))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let conn = Arc::new(RestConnection::new(options(&server, None)).unwrap());
        let pending = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.init().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.reset().await.unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SubsystemError::Connection {
                source: ConnectionError::Reset,
                ..
            }
        ));
        assert_eq!(conn.status(), ConnectionStatus::Idle);
        assert!(conn.config().is_none());
    }

    #[tokio::test]
    async fn reset_is_idempotent() {
        let server = MockServer::start().await;
        let conn = RestConnection::new(options(&server, None)).unwrap();
        conn.reset().await.unwrap();
        conn.reset().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Idle);
    }
}
