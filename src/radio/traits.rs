//! Modem contract shared by every radio backend
//!
//! The channel-access and host framing layers only ever talk to a [`Modem`].
//! Each chip family implements it on top of its own wire protocol, so the
//! rest of the firmware never learns which transceiver is fitted.

use crate::config::lora_defaults;
use crate::radio::bus::BusError;
use crate::radio::modulation::Timing;
use core::future::Future;

/// Errors that cross the modem contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    /// Chip never answered its identity check within the detection window
    Init,
    /// tx-done was not observed before the modem timeout
    TxTimeout,
    /// SPI or control pin failure reported by the transport
    Bus,
    /// Packet operation attempted before a successful `begin()`
    Offline,
}

impl From<BusError> for RadioError {
    fn from(_: BusError) -> Self {
        RadioError::Bus
    }
}

/// Driver-enforced modem state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemState {
    /// Before `begin` or after `end`; every chip call is refused
    Uninitialized,
    /// Idle and configurable, the state every operation returns to
    Standby,
    /// Between `end_packet` issuing TX and tx-done or its timeout
    Transmitting,
    /// Continuous or fixed-length receive armed by `receive`
    Receiving,
    /// Chip asleep with its configuration retained
    Sleeping,
}

/// Physical layer configuration owned by the active backend
#[derive(Debug, Clone, PartialEq)]
pub struct RadioConfig {
    /// Centre frequency in Hz
    pub frequency_hz: u32,
    /// Bandwidth in Hz, always one of the backend's table entries
    pub bandwidth_hz: u32,
    /// Chip-specific code for `bandwidth_hz`
    pub bandwidth_code: u8,
    /// Spreading factor (5-12, chip dependent)
    pub spreading_factor: u8,
    /// Coding rate denominator (5-8 for 4/5 to 4/8)
    pub coding_rate: u8,
    /// Transmit power in dBm after chip and board clamping
    pub tx_power_dbm: i8,
    /// Preamble length in symbols as achieved by the hardware
    pub preamble_symbols: u16,
    /// Payload CRC appended on transmit and checked on receive
    pub crc: bool,
    /// No LoRa header on air; both ends must agree on `payload_length`
    pub implicit_header: bool,
    /// Fixed payload length used in implicit header mode
    pub payload_length: u8,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_hz: lora_defaults::FREQUENCY_HZ,
            bandwidth_hz: lora_defaults::BANDWIDTH_HZ,
            bandwidth_code: 0,
            spreading_factor: lora_defaults::SPREADING_FACTOR,
            coding_rate: lora_defaults::CODING_RATE,
            tx_power_dbm: lora_defaults::TX_POWER_DBM,
            preamble_symbols: lora_defaults::PREAMBLE_SYMBOLS,
            crc: lora_defaults::CRC,
            implicit_header: false,
            payload_length: 0,
        }
    }
}

/// Signal quality of the last received packet, or of the channel right now
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SignalSample {
    /// RSSI byte as reported by the chip
    pub rssi_raw: u8,
    /// SNR byte as reported by the chip
    pub snr_raw: u8,
    /// RSSI in dBm after the chip's offset and slope correction
    pub rssi_dbm: i16,
    /// SNR in dB
    pub snr_db: f32,
    /// Carrier frequency error, where the chip reports one
    pub frequency_error_hz: i32,
}

/// Receive notification, called from `poll()` with the packet just buffered
pub type ReceiveHandler = fn(packet: &[u8]);

/// Uniform packet-radio interface implemented by every chip backend
///
/// Configuration setters are silent no-ops while the radio is offline.
/// Only [`RadioError::Init`] and [`RadioError::TxTimeout`] are produced by
/// the radio itself; `Bus` and `Offline` report problems around it.
pub trait Modem {
    /// Reset and detect the chip, then apply the default configuration
    ///
    /// Leaves the modem in Standby. Safe to call again without `end()`.
    fn begin(&mut self, frequency_hz: u32) -> impl Future<Output = Result<(), RadioError>>;

    /// Put the chip to sleep, release the bus and go offline
    fn end(&mut self) -> impl Future<Output = ()>;

    fn is_online(&self) -> bool;

    fn state(&self) -> ModemState;

    fn config(&self) -> &RadioConfig;

    fn set_frequency(&mut self, frequency_hz: u32) -> impl Future<Output = Result<(), RadioError>>;

    /// Current centre frequency, read back from the chip where it can be
    fn frequency(&mut self) -> impl Future<Output = Result<u32, RadioError>>;

    fn set_spreading_factor(&mut self, sf: u8) -> impl Future<Output = Result<(), RadioError>>;

    /// Select the smallest supported bandwidth at or above `bandwidth_hz`
    fn set_signal_bandwidth(
        &mut self,
        bandwidth_hz: u32,
    ) -> impl Future<Output = Result<(), RadioError>>;

    fn set_coding_rate4(&mut self, denominator: u8) -> impl Future<Output = Result<(), RadioError>>;

    /// Clamp to the chip and board range, then program the PA
    fn set_tx_power(&mut self, dbm: i8) -> impl Future<Output = Result<(), RadioError>>;

    /// Returns the preamble length the chip can actually send
    fn set_preamble_length(&mut self, symbols: u16)
        -> impl Future<Output = Result<u16, RadioError>>;

    fn set_crc(&mut self, enabled: bool) -> impl Future<Output = Result<(), RadioError>>;

    /// Force Standby and start a new outbound packet
    fn begin_packet(&mut self, implicit_header: bool)
        -> impl Future<Output = Result<(), RadioError>>;

    /// Append payload bytes, returning how many fit below the 255 byte limit
    fn write(&mut self, data: &[u8]) -> impl Future<Output = Result<usize, RadioError>>;

    /// Transmit the staged packet and wait for tx-done
    fn end_packet(&mut self) -> impl Future<Output = Result<(), RadioError>>;

    /// Force Standby, then listen continuously
    ///
    /// A non-zero `size` selects implicit header mode with that payload length.
    fn receive(&mut self, size: u8) -> impl Future<Output = Result<(), RadioError>>;

    /// Unread bytes of the current packet
    fn available(&self) -> usize;

    fn read(&mut self) -> Option<u8>;

    fn peek(&self) -> Option<u8>;

    /// True while preamble or header activity is observed on the channel
    fn carrier_detected(&mut self) -> impl Future<Output = Result<bool, RadioError>>;

    fn current_rssi_raw(&mut self) -> impl Future<Output = Result<u8, RadioError>>;

    /// Instantaneous channel RSSI in dBm
    fn current_rssi(&mut self) -> impl Future<Output = Result<i16, RadioError>>;

    /// Signal quality captured with the last received packet
    fn packet_signal(&self) -> SignalSample;

    /// Register (or with `None`, remove) the receive handler and route the
    /// chip's rx-done interrupt to the bridge
    fn on_receive(
        &mut self,
        handler: Option<ReceiveHandler>,
    ) -> impl Future<Output = Result<(), RadioError>>;

    /// Service a pending interrupt, returning the length of a delivered packet
    fn poll(&mut self) -> impl Future<Output = Result<Option<usize>, RadioError>>;

    fn sleep(&mut self) -> impl Future<Output = Result<(), RadioError>>;

    fn standby(&mut self) -> impl Future<Output = Result<(), RadioError>>;

    /// One byte of entropy from the radio's noise source
    fn random(&mut self) -> impl Future<Output = Result<u8, RadioError>>;

    /// Airtime figures for the current modulation
    fn timing(&self) -> &Timing;

    /// Busy line waits that hit the ceiling and proceeded anyway
    fn busy_timeouts(&self) -> u32;

    /// Preamble detections that expired without a header
    fn false_preambles(&self) -> u32;

    fn enable_crc(&mut self) -> impl Future<Output = Result<(), RadioError>> {
        self.set_crc(true)
    }

    fn disable_crc(&mut self) -> impl Future<Output = Result<(), RadioError>> {
        self.set_crc(false)
    }

    fn spreading_factor(&self) -> u8 {
        self.config().spreading_factor
    }

    fn signal_bandwidth(&self) -> u32 {
        self.config().bandwidth_hz
    }

    fn coding_rate4(&self) -> u8 {
        self.config().coding_rate
    }

    fn tx_power(&self) -> i8 {
        self.config().tx_power_dbm
    }

    fn preamble_length(&self) -> u16 {
        self.config().preamble_symbols
    }

    fn packet_rssi(&self) -> i16 {
        self.packet_signal().rssi_dbm
    }

    fn packet_rssi_raw(&self) -> u8 {
        self.packet_signal().rssi_raw
    }

    fn packet_snr(&self) -> f32 {
        self.packet_signal().snr_db
    }

    fn packet_snr_raw(&self) -> u8 {
        self.packet_signal().snr_raw
    }

    fn packet_frequency_error(&self) -> i32 {
        self.packet_signal().frequency_error_hz
    }

    fn symbol_time_ms(&self) -> f32 {
        self.timing().symbol_time_ms
    }

    fn bitrate_bps(&self) -> u32 {
        self.timing().bitrate_bps
    }

    fn low_data_rate(&self) -> bool {
        self.timing().low_data_rate
    }
}
