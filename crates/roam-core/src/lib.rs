use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default QUIC port when the target does not carry one.
pub const DEFAULT_PORT: u16 = 443;

/// Default cadence for the background routing-table poll, in milliseconds.
pub const DEFAULT_ROUTE_POLL_MS: u64 = 100;

/// How the network-change simulator decides when to fire the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Sleep a jittered duration drawn from `[0, interval)`, then fire.
    Time,
    /// Fire once the largest acknowledged sequence number crosses the next
    /// `interval` multiple.
    Sequence,
}

/// When the migration controller acts on a discovered route change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPolicy {
    /// Migrate only when the default gateway itself changes; local-address
    /// drift under an unchanged gateway is logged and ignored.
    GatewayChange,
    /// Migrate on any change of gateway or local address.
    AnyPathChange,
}

/// Target server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Per-run client configuration, immutable once the run starts.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target: Target,
    pub num_requests: u32,
    pub body: Option<String>,
    /// Treat 3xx responses as success instead of aborting the run.
    pub redirect_is_success: bool,
    /// Tear the connection down and reconnect between every request.
    pub one_connection_per_request: bool,
    /// Rotate the ephemeral local port between requests (ignored while a
    /// migration is in flight).
    pub rotate_port: bool,
    /// Downgrade a version-negotiation failure from its dedicated exit
    /// signal to success.
    pub version_mismatch_ok: bool,
    pub quiet: bool,
    pub policy: MigrationPolicy,
    pub route_poll_interval: Duration,
    /// Initial local UDP port; 0 asks the OS for an ephemeral one.
    pub local_port: u16,
    /// Run the background handover tracker.
    pub track: bool,
}

impl RunConfig {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            num_requests: 1,
            body: None,
            redirect_is_success: false,
            one_connection_per_request: false,
            rotate_port: true,
            version_mismatch_ok: false,
            quiet: false,
            policy: MigrationPolicy::GatewayChange,
            route_poll_interval: Duration::from_millis(DEFAULT_ROUTE_POLL_MS),
            local_port: 0,
            track: false,
        }
    }
}

/// Schedule for externally triggered network changes. Immutable once the
/// simulator starts.
#[derive(Debug, Clone)]
pub struct NetworkChangeConfig {
    /// Number of path-disruption events to fire.
    pub count: u32,
    /// Time mode: upper bound in milliseconds for the jittered delay.
    /// Sequence mode: acknowledged-sequence step between events.
    pub interval: u64,
    pub trigger: TriggerMode,
    /// Interface the run starts on.
    pub start_interface: String,
    /// Interface the first event switches to; the from/to pair flips on
    /// each later event when `count > 1`.
    pub alternate_interface: String,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl FromStr for TriggerMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time" => Ok(TriggerMode::Time),
            "sequence" | "seq" => Ok(TriggerMode::Sequence),
            other => Err(ConfigError::new(format!(
                "Invalid trigger mode {:?} (expected \"time\" or \"sequence\")",
                other
            ))),
        }
    }
}

impl FromStr for MigrationPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gateway-change" | "gateway" => Ok(MigrationPolicy::GatewayChange),
            "any-path-change" | "any" => Ok(MigrationPolicy::AnyPathChange),
            other => Err(ConfigError::new(format!(
                "Invalid migration policy {:?} (expected \"gateway-change\" or \"any-path-change\")",
                other
            ))),
        }
    }
}

pub fn parse_target(input: &str, default_port: u16) -> Result<Target, ConfigError> {
    if let Some(rest) = input.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err(ConfigError::new(format!(
                "Invalid IPv6 address format (missing closing bracket): {}",
                input
            )));
        };

        let host = &rest[..end];
        if host.is_empty() {
            return Err(ConfigError::new(format!(
                "Invalid IPv6 address in target: {}",
                input
            )));
        }

        let remainder = &rest[end + 1..];
        let port = if remainder.is_empty() {
            default_port
        } else if let Some(port_str) = remainder.strip_prefix(':') {
            parse_port(port_str, input)?
        } else {
            return Err(ConfigError::new(format!(
                "Invalid IPv6 address format (missing closing bracket): {}",
                input
            )));
        };

        return Ok(Target {
            host: host.to_string(),
            port,
        });
    }

    let mut host = input;
    let mut port = default_port;
    if let Some((left, right)) = input.split_once(':') {
        if right.is_empty() || !right.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::new(format!(
                "Invalid port number in target address: {}",
                input
            )));
        }
        host = left;
        port = parse_port(right, input)?;
    }

    if host.is_empty() {
        return Err(ConfigError::new(format!("Invalid target address: {}", input)));
    }

    Ok(Target {
        host: host.to_string(),
        port,
    })
}

fn parse_port(port_str: &str, input: &str) -> Result<u16, ConfigError> {
    let port: u16 = port_str.parse().map_err(|_| {
        ConfigError::new(format!("Invalid port number in target address: {}", input))
    })?;
    if port == 0 {
        return Err(ConfigError::new(format!(
            "Invalid port number in target address: {}",
            input
        )));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_without_port_uses_default() {
        let target = parse_target("example.com", DEFAULT_PORT).unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, DEFAULT_PORT);
    }

    #[test]
    fn target_with_port() {
        let target = parse_target("10.0.0.2:4433", 443).unwrap();
        assert_eq!(target.host, "10.0.0.2");
        assert_eq!(target.port, 4433);
    }

    #[test]
    fn bracketed_ipv6_target() {
        let target = parse_target("[2001:db8::1]:4433", 443).unwrap();
        assert_eq!(target.host, "2001:db8::1");
        assert_eq!(target.port, 4433);
        assert_eq!(target.to_string(), "[2001:db8::1]:4433");
    }

    #[test]
    fn rejects_bad_ports() {
        assert!(parse_target("host:", 443).is_err());
        assert!(parse_target("host:0", 443).is_err());
        assert!(parse_target("host:notaport", 443).is_err());
        assert!(parse_target("host:70000", 443).is_err());
    }

    #[test]
    fn rejects_empty_host() {
        assert!(parse_target("", 443).is_err());
        assert!(parse_target(":443", 443).is_err());
    }

    #[test]
    fn trigger_mode_parses() {
        assert_eq!("time".parse::<TriggerMode>().unwrap(), TriggerMode::Time);
        assert_eq!("seq".parse::<TriggerMode>().unwrap(), TriggerMode::Sequence);
        assert!("often".parse::<TriggerMode>().is_err());
    }

    #[test]
    fn migration_policy_parses() {
        assert_eq!(
            "gateway".parse::<MigrationPolicy>().unwrap(),
            MigrationPolicy::GatewayChange
        );
        assert_eq!(
            "any-path-change".parse::<MigrationPolicy>().unwrap(),
            MigrationPolicy::AnyPathChange
        );
        assert!("never".parse::<MigrationPolicy>().is_err());
    }
}
