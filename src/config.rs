//! Client core configuration
//!
//! Timeout and resource knobs for circuits and streams, collected in one
//! struct so the core is parameterized by its owner instead of reading
//! module globals.

use std::time::Duration;

/// Link protocol versions this client speaks, preferred order last.
pub const SUPPORTED_LINK_VERSIONS: [u16; 2] = [3, 4];

/// Configuration for the circuit and stream layer
#[derive(Debug, Clone)]
pub struct Config {
    /// Wall-clock deadline for a complete circuit build.
    pub circuit_build_timeout: Duration,

    /// Deadline for a single hop extension (CREATE2 or EXTEND2 round-trip).
    pub hop_extend_timeout: Duration,

    /// Deadline for a stream to see CONNECTED after BEGIN.
    pub stream_connect_timeout: Duration,

    /// Maximum streams multiplexed onto one circuit.
    pub max_streams_per_circuit: usize,

    /// Maximum cells parked in a circuit's outbound queue before callers
    /// see backpressure.
    pub max_queued_cells: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            circuit_build_timeout: Duration::from_secs(60),
            hop_extend_timeout: Duration::from_secs(10),
            stream_connect_timeout: Duration::from_secs(30),
            max_streams_per_circuit: 20,
            max_queued_cells: 200,
        }
    }
}
