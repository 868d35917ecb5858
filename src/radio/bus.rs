//! SPI transport and busy-line guard
//!
//! [`Transport`] is the hardware boundary: one chip-select framed transfer,
//! the busy input, the control outputs and a clock. [`Bus`] wraps it with
//! the busy wait every opcode chip needs before a transaction.

use crate::config::timing;
use core::future::Future;
use log::warn;

/// Transport level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// SPI transfer failed
    Spi,
    /// A control pin could not be driven
    Pin,
}

/// Host-driven control outputs of the radio module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPin {
    /// Active low chip reset
    Reset,
    /// RF switch receive path
    RxEnable,
    /// RF switch transmit path
    TxEnable,
}

/// Exclusive access to the radio's SPI bus and control lines
///
/// `transfer` asserts chip-select, clocks `frame` out while overwriting it
/// with the bytes clocked in, and deasserts chip-select. Pins a board does
/// not wire are accepted and ignored.
pub trait Transport {
    fn transfer(&mut self, frame: &mut [u8]) -> impl Future<Output = Result<(), BusError>>;

    /// Level of the busy line, false when the board has none
    fn is_busy(&mut self) -> bool;

    fn set_pin(&mut self, pin: ControlPin, high: bool) -> Result<(), BusError>;

    fn delay_ms(&mut self, ms: u32) -> impl Future<Output = ()>;

    /// Monotonic milliseconds
    fn now_ms(&self) -> u64;

    /// Hand the bus back when the radio is shut down
    fn release(&mut self) {}
}

/// Busy-guarded bus owned by one backend
pub struct Bus<T> {
    transport: T,
    busy_timeout_ms: u32,
    busy_timeouts: u32,
}

impl<T: Transport> Bus<T> {
    /// Wrap a transport, giving up on BUSY after `busy_timeout_ms`
    ///
    /// A chip with no BUSY line never waits.
    pub fn new(transport: T, busy_timeout_ms: u32) -> Self {
        Self {
            transport,
            busy_timeout_ms,
            busy_timeouts: 0,
        }
    }

    /// Spin until the busy line drops or the ceiling passes
    ///
    /// A stuck busy line is counted and logged, and the caller carries on
    /// with its transaction.
    pub fn wait_ready(&mut self) {
        if !self.transport.is_busy() {
            return;
        }
        let start = self.transport.now_ms();
        while self.transport.is_busy() {
            let waited = self.transport.now_ms().saturating_sub(start);
            if waited >= self.busy_timeout_ms as u64 {
                self.busy_timeouts = self.busy_timeouts.wrapping_add(1);
                warn!(
                    "radio busy for {} ms, proceeding ({} so far)",
                    waited, self.busy_timeouts
                );
                return;
            }
        }
    }

    /// Busy-guarded transfer
    pub async fn exchange(&mut self, frame: &mut [u8]) -> Result<(), BusError> {
        self.wait_ready();
        self.transport.transfer(frame).await
    }

    /// Pulse the reset line and give the chip time to boot
    pub async fn reset(&mut self) -> Result<(), BusError> {
        self.transport.set_pin(ControlPin::Reset, false)?;
        self.transport.delay_ms(timing::RESET_PULSE_MS).await;
        self.transport.set_pin(ControlPin::Reset, true)?;
        self.transport.delay_ms(timing::RESET_SETTLE_MS).await;
        Ok(())
    }

    pub fn set_pin(&mut self, pin: ControlPin, high: bool) -> Result<(), BusError> {
        self.transport.set_pin(pin, high)
    }

    pub async fn delay_ms(&mut self, ms: u32) {
        self.transport.delay_ms(ms).await
    }

    pub fn now_ms(&self) -> u64 {
        self.transport.now_ms()
    }

    pub fn release(&mut self) {
        self.transport.release()
    }

    pub fn busy_timeouts(&self) -> u32 {
        self.busy_timeouts
    }
}
