use std::time::Duration;

/// Timing and sizing constants shared by the BLE driver and the update engine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Config {
    /// The largest `payload_length` that is accepted or produced
    pub max_payload: u16,
    /// How long the engine waits for the next packet of a step before re-requesting it
    pub packet_timeout: Duration,
    /// Number of timeouts tolerated in a single step before the session is aborted
    pub retry_limit: u8,
    /// Response window for a single AT command
    pub at_timeout: Duration,
    /// Silence after which an ambiguous or variable-length AT reply is considered complete
    pub at_quiet_gap: Duration,
    /// Window for the delayed "connected" notification after a connect command
    pub connect_timeout: Duration,
    /// How long the sending side waits for an ACK or NACK
    pub ack_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_payload: 1024,
            packet_timeout: Duration::from_secs(3),
            retry_limit: 5,
            at_timeout: Duration::from_millis(800),
            at_quiet_gap: Duration::from_millis(60),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(2),
        }
    }
}
