use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

/// Orchestrator timing knobs. Defaults are the protocol constants; each can
/// be overridden from the environment for soak setups.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub stats_window: Duration,
    pub waiting_room_window: Duration,
    pub student_grace: Duration,
    pub teacher_grace: Duration,
    pub reservation_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub drain_timeout: Duration,
    pub store_deadline: Duration,
    pub store_retry_backoff: [Duration; 3],
    pub outbound_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            stats_window: Duration::from_millis(200),
            waiting_room_window: Duration::from_millis(150),
            student_grace: Duration::from_secs(30),
            teacher_grace: Duration::from_secs(60),
            reservation_ttl: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(15),
            drain_timeout: Duration::from_secs(2),
            store_deadline: Duration::from_secs(5),
            store_retry_backoff: [
                Duration::from_millis(50),
                Duration::from_millis(150),
                Duration::from_millis(400),
            ],
            outbound_capacity: 64,
        }
    }
}

impl RoomConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stats_window: env_u64("STATS_WINDOW_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.stats_window),
            waiting_room_window: env_u64("WAITING_ROOM_WINDOW_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.waiting_room_window),
            student_grace: env_u64("STUDENT_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.student_grace),
            teacher_grace: env_u64("TEACHER_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.teacher_grace),
            reservation_ttl: env_u64("RESERVATION_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.reservation_ttl),
            heartbeat_interval: env_u64("HEARTBEAT_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            pong_timeout: env_u64("PONG_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.pong_timeout),
            drain_timeout: env_u64("DRAIN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.drain_timeout),
            store_deadline: env_u64("STORE_DEADLINE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.store_deadline),
            store_retry_backoff: defaults.store_retry_backoff,
            outbound_capacity: env_u64("OUTBOUND_QUEUE_CAPACITY")
                .map(|value| value as usize)
                .unwrap_or(defaults.outbound_capacity),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub room: RoomConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(3000);

        let host = std::env::var("HOST")
            .ok()
            .and_then(|value| value.parse::<IpAddr>().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));

        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Self {
            host,
            port,
            log_level,
            database_url: std::env::var("DATABASE_URL").ok(),
            room: RoomConfig::from_env(),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
