use std::time::Duration;

use crate::bus::NamespaceFilter;
use crate::gateway::router::NoRoutePolicy;
use crate::gateway::transport::TransportKind;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Base URL of the external authentication service. `None` selects the
    /// static in-process session table.
    pub auth_url: Option<String>,
    /// `sid:user:context` triples for the static session table.
    pub static_sessions: String,
    /// How long a positive session validation is cached.
    pub auth_cache_ttl: Duration,
    /// Transport kinds this gateway accepts, in no particular order.
    pub transports: Vec<TransportKind>,
    /// Maximum time a long-poll request is held open.
    pub long_poll_hold: Duration,
    /// Maximum held poll requests per connection.
    pub long_poll_max_outstanding: usize,
    /// Gap between poll cycles after which a pull connection is DEGRADED.
    pub poll_reconnect_window: Duration,
    /// Maximum number of messages returned by one poll.
    pub poll_batch_size: usize,
    /// Bound of each endpoint's outbound queue.
    pub outbound_queue_capacity: usize,
    /// How long a DEGRADED endpoint waits for a reconnect.
    pub grace_period: Duration,
    /// Time allowed between transport open and a successful handshake.
    pub handshake_timeout: Duration,
    /// Advertised client ping cadence.
    pub heartbeat_interval: Duration,
    /// What to do with messages addressed to a session with no endpoint.
    pub no_route_policy: NoRoutePolicy,
    /// Which backend-emitted namespaces the gateway routes.
    pub backend_namespaces: NamespaceFilter,
    /// Lifetime of a cached negotiation result.
    pub negotiation_ttl: Duration,
    /// Timeout of a single probe attempt.
    pub probe_timeout: Duration,
    /// Ceiling on simultaneously open connections.
    pub max_connections: usize,
    /// Cadence of the liveness sweeper.
    pub sweep_interval: Duration,
    /// Bearer token required by the producer ingress, when set.
    pub producer_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4100,
            auth_url: None,
            static_sessions: String::new(),
            auth_cache_ttl: Duration::from_secs(30),
            transports: TransportKind::PREFERENCE.to_vec(),
            long_poll_hold: Duration::from_secs(50),
            long_poll_max_outstanding: 2,
            poll_reconnect_window: Duration::from_secs(10),
            poll_batch_size: 100,
            outbound_queue_capacity: 256,
            grace_period: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_millis(25_000),
            no_route_policy: NoRoutePolicy::Drop,
            backend_namespaces: NamespaceFilter::All,
            negotiation_ttl: Duration::from_secs(300),
            probe_timeout: Duration::from_millis(3000),
            max_connections: 10_000,
            sweep_interval: Duration::from_secs(5),
            producer_token: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unparsable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parsed_var("PORT").unwrap_or(defaults.port),
            auth_url: optional_var("AUTH_URL"),
            static_sessions: optional_var("STATIC_SESSIONS").unwrap_or_default(),
            auth_cache_ttl: secs_var("AUTH_CACHE_SECS").unwrap_or(defaults.auth_cache_ttl),
            transports: optional_var("TRANSPORTS")
                .map(|v| TransportKind::parse_list(&v))
                .unwrap_or(defaults.transports),
            long_poll_hold: secs_var("LONG_POLL_HOLD_SECS").unwrap_or(defaults.long_poll_hold),
            long_poll_max_outstanding: parsed_var("LONG_POLL_MAX_OUTSTANDING")
                .unwrap_or(defaults.long_poll_max_outstanding),
            poll_reconnect_window: secs_var("POLL_RECONNECT_SECS")
                .unwrap_or(defaults.poll_reconnect_window),
            poll_batch_size: parsed_var("POLL_BATCH_SIZE").unwrap_or(defaults.poll_batch_size),
            outbound_queue_capacity: parsed_var("OUTBOUND_QUEUE_CAPACITY")
                .unwrap_or(defaults.outbound_queue_capacity),
            grace_period: secs_var("GRACE_PERIOD_SECS").unwrap_or(defaults.grace_period),
            handshake_timeout: secs_var("HANDSHAKE_TIMEOUT_SECS")
                .unwrap_or(defaults.handshake_timeout),
            heartbeat_interval: parsed_var("HEARTBEAT_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat_interval),
            no_route_policy: parsed_var("NO_ROUTE_POLICY").unwrap_or(defaults.no_route_policy),
            backend_namespaces: optional_var("BACKEND_NAMESPACES")
                .map(|v| NamespaceFilter::parse(&v))
                .unwrap_or(defaults.backend_namespaces),
            negotiation_ttl: secs_var("NEGOTIATION_TTL_SECS").unwrap_or(defaults.negotiation_ttl),
            probe_timeout: parsed_var("PROBE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
            max_connections: parsed_var("MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            sweep_interval: secs_var("SWEEP_INTERVAL_SECS").unwrap_or(defaults.sweep_interval),
            producer_token: optional_var("PRODUCER_TOKEN"),
        }
    }

    /// Whether the gateway accepts connections of the given kind.
    pub fn transport_enabled(&self, kind: TransportKind) -> bool {
        self.transports.contains(&kind)
    }

    /// Idle time after which a WebSocket peer is considered gone (1.5× the
    /// heartbeat interval).
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval * 3 / 2
    }

    /// Idle time after which a pull connection with no request in flight is
    /// considered DEGRADED.
    pub fn poll_idle_limit(&self) -> Duration {
        self.long_poll_hold + self.poll_reconnect_window
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    optional_var(name).and_then(|v| v.trim().parse().ok())
}

fn secs_var(name: &str) -> Option<Duration> {
    parsed_var::<u64>(name).map(Duration::from_secs)
}
