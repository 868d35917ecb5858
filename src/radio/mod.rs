//! LoRa radio abstraction
//!
//! One [`Modem`] contract over four Semtech transceiver families, plus the
//! pieces they share: the busy-guarded SPI bus, the interrupt bridge, the
//! packet buffer and the modulation calculator.

pub mod any;
pub mod bus;
pub mod irq;
pub mod lr11xx;
pub mod modulation;
pub mod packet;
mod shared;
pub mod sx126x;
pub mod sx127x;
pub mod sx128x;
pub mod traits;

#[cfg(test)]
mod mock;

pub use any::AnyRadio;
pub use bus::{BusError, ControlPin, Transport};
pub use irq::{IrqBridge, IrqStatus};
pub use modulation::Timing;
pub use traits::{Modem, ModemState, RadioConfig, RadioError, ReceiveHandler, SignalSample};
