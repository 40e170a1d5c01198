//! Centralized configuration for Shoal.
//!
//! All tunable parameters of the peer-connection subsystem are defined here.
//! Zero values in a partially-filled config are replaced with defaults by
//! [`ShoalConfig::apply_defaults`].

use std::net::SocketAddr;
use std::time::Duration;

/// Central configuration for all Shoal components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShoalConfig {
    pub conn: ConnConfig,
    pub bandwidth: BandwidthConfig,
    pub connstate: ConnStateConfig,
    pub scheduler: SchedulerConfig,
}

/// Handshake and transport configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnConfig {
    /// Bound on sending or reading a single handshake message
    pub handshake_timeout: Duration,
    /// Bound on each steady-state frame read or write
    pub io_timeout: Duration,
    /// Bound on opening an outbound TCP connection
    pub dial_timeout: Duration,
    /// Largest accepted frame body in bytes
    pub max_frame_size: u32,
    /// Capacity of the connection event channel
    pub event_buffer: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(5),
            max_frame_size: 16 * 1024 * 1024, // 16 MiB
            event_buffer: 1000,
        }
    }
}

impl ConnConfig {
    /// Replaces zero values with defaults.
    pub fn apply_defaults(&mut self) {
        let defaults = Self::default();
        if self.handshake_timeout.is_zero() {
            self.handshake_timeout = defaults.handshake_timeout;
        }
        if self.io_timeout.is_zero() {
            self.io_timeout = defaults.io_timeout;
        }
        if self.dial_timeout.is_zero() {
            self.dial_timeout = defaults.dial_timeout;
        }
        if self.max_frame_size == 0 {
            self.max_frame_size = defaults.max_frame_size;
        }
        if self.event_buffer == 0 {
            self.event_buffer = defaults.event_buffer;
        }
    }
}

/// Process-wide bandwidth limits, bytes per second with burst ceilings.
#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthConfig {
    /// Disables all throttling when false
    pub enabled: bool,
    pub egress_rate: u64,
    pub egress_burst: u64,
    pub ingress_rate: u64,
    pub ingress_burst: u64,
}

const MIB: u64 = 1024 * 1024;

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            egress_rate: 200 * MIB,
            egress_burst: 200 * MIB,
            ingress_rate: 300 * MIB,
            ingress_burst: 300 * MIB,
        }
    }
}

impl BandwidthConfig {
    /// Replaces zero rates and bursts with defaults.
    pub fn apply_defaults(&mut self) {
        let defaults = Self::default();
        if self.egress_rate == 0 {
            self.egress_rate = defaults.egress_rate;
        }
        if self.egress_burst == 0 {
            self.egress_burst = self.egress_rate;
        }
        if self.ingress_rate == 0 {
            self.ingress_rate = defaults.ingress_rate;
        }
        if self.ingress_burst == 0 {
            self.ingress_burst = self.ingress_rate;
        }
    }

    /// Limits with throttling turned off.
    pub fn unlimited() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Blacklist and connection-count limits.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnStateConfig {
    /// How long a failed (peer, torrent) pair is skipped
    pub blacklist_cooldown: Duration,
    /// Upper bound on pending plus active conns per torrent
    pub max_open_conns_per_torrent: usize,
}

impl Default for ConnStateConfig {
    fn default() -> Self {
        Self {
            blacklist_cooldown: Duration::from_secs(30),
            max_open_conns_per_torrent: 10,
        }
    }
}

impl ConnStateConfig {
    /// Replaces zero values with defaults.
    pub fn apply_defaults(&mut self) {
        let defaults = Self::default();
        if self.blacklist_cooldown.is_zero() {
            self.blacklist_cooldown = defaults.blacklist_cooldown;
        }
        if self.max_open_conns_per_torrent == 0 {
            self.max_open_conns_per_torrent = defaults.max_open_conns_per_torrent;
        }
    }
}

/// Scheduler façade configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Address the inbound listener binds to
    pub listen_addr: SocketAddr,
    /// Bound on a liveness probe round trip
    pub probe_timeout: Duration,
    /// Namespace attached to outbound handshakes
    pub namespace: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            probe_timeout: Duration::from_secs(3),
            namespace: String::new(),
        }
    }
}

impl SchedulerConfig {
    /// Replaces zero values with defaults.
    pub fn apply_defaults(&mut self) {
        if self.probe_timeout.is_zero() {
            self.probe_timeout = Self::default().probe_timeout;
        }
    }
}

impl ShoalConfig {
    /// Replaces zero values in every section with defaults.
    pub fn apply_defaults(&mut self) {
        self.conn.apply_defaults();
        self.bandwidth.apply_defaults();
        self.connstate.apply_defaults();
        self.scheduler.apply_defaults();
    }

    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via `SHOAL_*` environment variables while
    /// maintaining sensible defaults. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(seconds) = env_parse::<u64>("SHOAL_HANDSHAKE_TIMEOUT_SECS") {
            config.conn.handshake_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse::<u64>("SHOAL_IO_TIMEOUT_SECS") {
            config.conn.io_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse::<u64>("SHOAL_DIAL_TIMEOUT_SECS") {
            config.conn.dial_timeout = Duration::from_secs(seconds);
        }

        if let Some(enabled) = env_parse::<bool>("SHOAL_BANDWIDTH_ENABLED") {
            config.bandwidth.enabled = enabled;
        }
        if let Some(rate) = env_parse::<u64>("SHOAL_EGRESS_RATE") {
            config.bandwidth.egress_rate = rate;
            config.bandwidth.egress_burst = rate;
        }
        if let Some(rate) = env_parse::<u64>("SHOAL_INGRESS_RATE") {
            config.bandwidth.ingress_rate = rate;
            config.bandwidth.ingress_burst = rate;
        }

        if let Some(seconds) = env_parse::<u64>("SHOAL_BLACKLIST_COOLDOWN_SECS") {
            config.connstate.blacklist_cooldown = Duration::from_secs(seconds);
        }

        if let Some(addr) = env_parse::<SocketAddr>("SHOAL_LISTEN_ADDR") {
            config.scheduler.listen_addr = addr;
        }

        config.apply_defaults();
        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short timeouts so failure paths resolve quickly; throttling disabled.
    pub fn for_testing() -> Self {
        Self {
            conn: ConnConfig {
                handshake_timeout: Duration::from_millis(500),
                io_timeout: Duration::from_secs(2),
                dial_timeout: Duration::from_millis(500),
                ..ConnConfig::default()
            },
            bandwidth: BandwidthConfig::unlimited(),
            connstate: ConnStateConfig {
                blacklist_cooldown: Duration::from_secs(5),
                ..ConnStateConfig::default()
            },
            scheduler: SchedulerConfig {
                probe_timeout: Duration::from_millis(500),
                ..SchedulerConfig::default()
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = ShoalConfig::default();

        assert_eq!(config.conn.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.conn.io_timeout, Duration::from_secs(60));
        assert_eq!(config.conn.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.conn.max_frame_size, 16 * 1024 * 1024);
        assert!(config.bandwidth.enabled);
        assert_eq!(config.bandwidth.egress_rate, 200 * MIB);
        assert_eq!(config.bandwidth.ingress_rate, 300 * MIB);
        assert_eq!(config.connstate.blacklist_cooldown, Duration::from_secs(30));
        assert_eq!(config.connstate.max_open_conns_per_torrent, 10);
        assert_eq!(config.scheduler.namespace, "");
    }

    #[test]
    fn test_apply_defaults_fills_zero_values() {
        let mut config = ShoalConfig {
            conn: ConnConfig {
                handshake_timeout: Duration::ZERO,
                io_timeout: Duration::from_secs(7),
                dial_timeout: Duration::ZERO,
                max_frame_size: 0,
                event_buffer: 0,
            },
            bandwidth: BandwidthConfig {
                enabled: true,
                egress_rate: 1000,
                egress_burst: 0,
                ingress_rate: 0,
                ingress_burst: 0,
            },
            connstate: ConnStateConfig {
                blacklist_cooldown: Duration::ZERO,
                max_open_conns_per_torrent: 0,
            },
            scheduler: SchedulerConfig::default(),
        };

        config.apply_defaults();

        assert_eq!(config.conn.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.conn.io_timeout, Duration::from_secs(7));
        assert_eq!(config.conn.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.conn.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.conn.event_buffer, 1000);
        assert_eq!(config.bandwidth.egress_burst, 1000);
        assert_eq!(config.bandwidth.ingress_rate, 300 * MIB);
        assert_eq!(config.bandwidth.ingress_burst, 300 * MIB);
        assert_eq!(config.connstate, ConnStateConfig::default());
    }

    #[test]
    fn test_testing_preset() {
        let config = ShoalConfig::for_testing();
        assert!(!config.bandwidth.enabled);
        assert!(config.conn.handshake_timeout < Duration::from_secs(1));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("SHOAL_HANDSHAKE_TIMEOUT_SECS", "9");
            std::env::set_var("SHOAL_EGRESS_RATE", "4096");
            std::env::set_var("SHOAL_BANDWIDTH_ENABLED", "false");
            std::env::set_var("SHOAL_BLACKLIST_COOLDOWN_SECS", "120");
            std::env::set_var("SHOAL_LISTEN_ADDR", "0.0.0.0:7000");
            std::env::set_var("SHOAL_IO_TIMEOUT_SECS", "not-a-number");
        }

        let config = ShoalConfig::from_env();

        assert_eq!(config.conn.handshake_timeout, Duration::from_secs(9));
        assert_eq!(config.conn.io_timeout, Duration::from_secs(60));
        assert_eq!(config.bandwidth.egress_rate, 4096);
        assert_eq!(config.bandwidth.egress_burst, 4096);
        assert!(!config.bandwidth.enabled);
        assert_eq!(config.connstate.blacklist_cooldown, Duration::from_secs(120));
        assert_eq!(config.scheduler.listen_addr.port(), 7000);

        // Cleanup
        unsafe {
            std::env::remove_var("SHOAL_HANDSHAKE_TIMEOUT_SECS");
            std::env::remove_var("SHOAL_EGRESS_RATE");
            std::env::remove_var("SHOAL_BANDWIDTH_ENABLED");
            std::env::remove_var("SHOAL_BLACKLIST_COOLDOWN_SECS");
            std::env::remove_var("SHOAL_LISTEN_ADDR");
            std::env::remove_var("SHOAL_IO_TIMEOUT_SECS");
        }
    }
}
