//! Board-selected radio
//!
//! Firmware stores one `AnyRadio` and drives it through [`Modem`]; which
//! backend sits behind it is decided once, from [`BoardConfig::chip`].

use crate::config::{BoardConfig, ChipFamily};
use crate::radio::bus::Transport;
use crate::radio::irq::IrqBridge;
use crate::radio::lr11xx::Lr11xx;
use crate::radio::modulation::Timing;
use crate::radio::sx126x::Sx126x;
use crate::radio::sx127x::Sx127x;
use crate::radio::sx128x::Sx128x;
use crate::radio::traits::{Modem, ModemState, RadioConfig, RadioError, ReceiveHandler, SignalSample};

/// One of the four backends, chosen at runtime from the board table
pub enum AnyRadio<'a, T> {
    Sx127x(Sx127x<'a, T>),
    Sx126x(Sx126x<'a, T>),
    Sx128x(Sx128x<'a, T>),
    Lr11xx(Lr11xx<'a, T>),
}

macro_rules! delegate {
    ($self:ident, $radio:ident => $call:expr) => {
        match $self {
            AnyRadio::Sx127x($radio) => $call,
            AnyRadio::Sx126x($radio) => $call,
            AnyRadio::Sx128x($radio) => $call,
            AnyRadio::Lr11xx($radio) => $call,
        }
    };
}

impl<'a, T: Transport> AnyRadio<'a, T> {
    pub fn from_board(board: BoardConfig, transport: T, irq: &'a IrqBridge) -> Self {
        match board.chip {
            ChipFamily::Sx127x => AnyRadio::Sx127x(Sx127x::new(transport, board, irq)),
            ChipFamily::Sx126x => AnyRadio::Sx126x(Sx126x::new(transport, board, irq)),
            ChipFamily::Sx128x => AnyRadio::Sx128x(Sx128x::new(transport, board, irq)),
            ChipFamily::Lr11xx => AnyRadio::Lr11xx(Lr11xx::new(transport, board, irq)),
        }
    }

    pub fn chip(&self) -> ChipFamily {
        match self {
            AnyRadio::Sx127x(_) => ChipFamily::Sx127x,
            AnyRadio::Sx126x(_) => ChipFamily::Sx126x,
            AnyRadio::Sx128x(_) => ChipFamily::Sx128x,
            AnyRadio::Lr11xx(_) => ChipFamily::Lr11xx,
        }
    }
}

impl<'a, T: Transport> Modem for AnyRadio<'a, T> {
    async fn begin(&mut self, frequency_hz: u32) -> Result<(), RadioError> {
        delegate!(self, r => r.begin(frequency_hz).await)
    }

    async fn end(&mut self) {
        delegate!(self, r => r.end().await)
    }

    fn is_online(&self) -> bool {
        delegate!(self, r => r.is_online())
    }

    fn state(&self) -> ModemState {
        delegate!(self, r => r.state())
    }

    fn config(&self) -> &RadioConfig {
        delegate!(self, r => r.config())
    }

    async fn set_frequency(&mut self, frequency_hz: u32) -> Result<(), RadioError> {
        delegate!(self, r => r.set_frequency(frequency_hz).await)
    }

    async fn frequency(&mut self) -> Result<u32, RadioError> {
        delegate!(self, r => r.frequency().await)
    }

    async fn set_spreading_factor(&mut self, sf: u8) -> Result<(), RadioError> {
        delegate!(self, r => r.set_spreading_factor(sf).await)
    }

    async fn set_signal_bandwidth(&mut self, bandwidth_hz: u32) -> Result<(), RadioError> {
        delegate!(self, r => r.set_signal_bandwidth(bandwidth_hz).await)
    }

    async fn set_coding_rate4(&mut self, denominator: u8) -> Result<(), RadioError> {
        delegate!(self, r => r.set_coding_rate4(denominator).await)
    }

    async fn set_tx_power(&mut self, dbm: i8) -> Result<(), RadioError> {
        delegate!(self, r => r.set_tx_power(dbm).await)
    }

    async fn set_preamble_length(&mut self, symbols: u16) -> Result<u16, RadioError> {
        delegate!(self, r => r.set_preamble_length(symbols).await)
    }

    async fn set_crc(&mut self, enabled: bool) -> Result<(), RadioError> {
        delegate!(self, r => r.set_crc(enabled).await)
    }

    async fn begin_packet(&mut self, implicit_header: bool) -> Result<(), RadioError> {
        delegate!(self, r => r.begin_packet(implicit_header).await)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, RadioError> {
        delegate!(self, r => r.write(data).await)
    }

    async fn end_packet(&mut self) -> Result<(), RadioError> {
        delegate!(self, r => r.end_packet().await)
    }

    async fn receive(&mut self, size: u8) -> Result<(), RadioError> {
        delegate!(self, r => r.receive(size).await)
    }

    fn available(&self) -> usize {
        delegate!(self, r => r.available())
    }

    fn read(&mut self) -> Option<u8> {
        delegate!(self, r => r.read())
    }

    fn peek(&self) -> Option<u8> {
        delegate!(self, r => r.peek())
    }

    async fn carrier_detected(&mut self) -> Result<bool, RadioError> {
        delegate!(self, r => r.carrier_detected().await)
    }

    async fn current_rssi_raw(&mut self) -> Result<u8, RadioError> {
        delegate!(self, r => r.current_rssi_raw().await)
    }

    async fn current_rssi(&mut self) -> Result<i16, RadioError> {
        delegate!(self, r => r.current_rssi().await)
    }

    fn packet_signal(&self) -> SignalSample {
        delegate!(self, r => r.packet_signal())
    }

    async fn on_receive(&mut self, handler: Option<ReceiveHandler>) -> Result<(), RadioError> {
        delegate!(self, r => r.on_receive(handler).await)
    }

    async fn poll(&mut self) -> Result<Option<usize>, RadioError> {
        delegate!(self, r => r.poll().await)
    }

    async fn sleep(&mut self) -> Result<(), RadioError> {
        delegate!(self, r => r.sleep().await)
    }

    async fn standby(&mut self) -> Result<(), RadioError> {
        delegate!(self, r => r.standby().await)
    }

    async fn random(&mut self) -> Result<u8, RadioError> {
        delegate!(self, r => r.random().await)
    }

    fn timing(&self) -> &Timing {
        delegate!(self, r => r.timing())
    }

    fn busy_timeouts(&self) -> u32 {
        delegate!(self, r => r.busy_timeouts())
    }

    fn false_preambles(&self) -> u32 {
        delegate!(self, r => r.false_preambles())
    }
}
