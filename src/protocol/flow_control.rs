//! SENDME flow control
//!
//! Circuits and streams each keep a pair of windows. The package window
//! counts DATA cells we may still send and is refilled by the peer's
//! SENDME cells; the deliver window counts DATA cells received, and every
//! time a full increment has been consumed we owe the peer a SENDME.
//!
//! Window sizes: 1000/100 for circuits, 500/50 for streams.

use crate::error::{Error, Result};

/// Circuit-level flow control windows.
#[derive(Debug, Clone)]
pub struct CircuitFlowControl {
    /// DATA cells we may still package onto the circuit.
    package_window: u16,

    /// DATA cells the peer may still deliver before we owe a SENDME.
    deliver_window: u16,
}

impl CircuitFlowControl {
    /// Initial circuit window size.
    pub const INITIAL_WINDOW: u16 = 1000;

    /// Window credit per SENDME.
    pub const WINDOW_INCREMENT: u16 = 100;

    pub fn new() -> Self {
        Self {
            package_window: Self::INITIAL_WINDOW,
            deliver_window: Self::INITIAL_WINDOW,
        }
    }

    pub fn can_send(&self) -> bool {
        self.package_window > 0
    }

    /// Account for one DATA cell sent.
    pub fn on_send(&mut self) -> Result<()> {
        if self.package_window == 0 {
            return Err(Error::ResourceExhausted(
                "circuit package window exhausted".into(),
            ));
        }
        self.package_window -= 1;
        Ok(())
    }

    /// Account for a circuit-level SENDME from the peer.
    pub fn on_sendme_received(&mut self) {
        self.package_window = self.package_window.saturating_add(Self::WINDOW_INCREMENT);
        log::debug!("circuit package window now {}", self.package_window);
    }

    /// Account for one DATA cell received. Returns `true` when a
    /// circuit-level SENDME should be sent back.
    pub fn on_receive(&mut self) -> bool {
        self.deliver_window = self.deliver_window.saturating_sub(1);
        if self.deliver_window <= Self::INITIAL_WINDOW - Self::WINDOW_INCREMENT {
            self.deliver_window += Self::WINDOW_INCREMENT;
            log::debug!("circuit deliver window refilled, emitting SENDME");
            return true;
        }
        false
    }

    pub fn package_window(&self) -> u16 {
        self.package_window
    }
}

impl Default for CircuitFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level flow control windows.
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    package_window: u16,
    deliver_window: u16,
    stream_id: u16,
}

impl StreamFlowControl {
    /// Initial stream window size.
    pub const INITIAL_WINDOW: u16 = 500;

    /// Window credit per stream SENDME.
    pub const WINDOW_INCREMENT: u16 = 50;

    pub fn new(stream_id: u16) -> Self {
        Self {
            package_window: Self::INITIAL_WINDOW,
            deliver_window: Self::INITIAL_WINDOW,
            stream_id,
        }
    }

    pub fn can_send(&self) -> bool {
        self.package_window > 0
    }

    pub fn is_blocked(&self) -> bool {
        self.package_window == 0
    }

    pub fn on_send(&mut self) -> Result<()> {
        if self.package_window == 0 {
            return Err(Error::ResourceExhausted(format!(
                "stream {} package window exhausted",
                self.stream_id
            )));
        }
        self.package_window -= 1;
        Ok(())
    }

    pub fn on_sendme_received(&mut self) {
        self.package_window = self.package_window.saturating_add(Self::WINDOW_INCREMENT);
        log::debug!(
            "stream {} package window now {}",
            self.stream_id,
            self.package_window
        );
    }

    /// Returns `true` when a stream-level SENDME should be sent back.
    pub fn on_receive(&mut self) -> bool {
        self.deliver_window = self.deliver_window.saturating_sub(1);
        if self.deliver_window <= Self::INITIAL_WINDOW - Self::WINDOW_INCREMENT {
            self.deliver_window += Self::WINDOW_INCREMENT;
            return true;
        }
        false
    }

    pub fn package_window(&self) -> u16 {
        self.package_window
    }
}
