//! Gateway configuration
//!
//! All configuration is passed explicitly at construction. Core logic never
//! reads ambient process state such as environment variables.

use crate::channels::ChannelNamer;

/// Configuration for the WebSocket-Over-HTTP subscription gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How often, in seconds, the GRIP gateway is asked to issue keep-alive
    /// requests for an open connection (default: 120). A connection is
    /// considered expired after twice this interval without renewal.
    pub keep_alive_interval_seconds: u64,
    /// GRIP control message prefix sent back in `Sec-WebSocket-Extensions`
    /// and prepended to channel names in control messages (default: empty).
    pub message_prefix: String,
    /// Strategy for deriving a GRIP channel name from a subscription.
    pub channel_namer: ChannelNamer,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_seconds: 120,
            message_prefix: String::new(),
            channel_namer: ChannelNamer::SharedByField,
        }
    }
}

impl GatewayConfig {
    /// Seconds after which a connection with no renewal is considered dead.
    pub fn expiry_interval_seconds(&self) -> u64 {
        2 * self.keep_alive_interval_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.keep_alive_interval_seconds, 120);
        assert_eq!(config.message_prefix, "");
        assert!(matches!(config.channel_namer, ChannelNamer::SharedByField));
    }

    #[test]
    fn test_expiry_is_twice_keep_alive() {
        let config = GatewayConfig {
            keep_alive_interval_seconds: 45,
            ..Default::default()
        };
        assert_eq!(config.expiry_interval_seconds(), 90);
    }
}
