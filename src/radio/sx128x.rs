//! SX1280/SX1281 2.4 GHz LoRa backend
//!
//! Same opcode and busy-line discipline as the SX126x, with its own opcode
//! values, a quantized preamble and board-keyed power curves. Boards with
//! separate RXEN/TXEN lines get break-before-make antenna switching.
//!
//! Continuous receive can wedge the busy line after a burst of packets, so
//! every rx-done re-issues SetRx before the packet is handed on.

use crate::config::{lora_defaults, timing, BoardConfig, PowerCurve, RfSwitch};
use crate::radio::bus::{Bus, ControlPin, Transport};
use crate::radio::irq::{IrqBridge, IrqStatus};
use crate::radio::modulation::{quantize_preamble_u16, select_bandwidth, Bandwidth};
use crate::radio::shared::{modem_accessors, ModemCore};
use crate::radio::traits::{Modem, ModemState, RadioConfig, RadioError, ReceiveHandler, SignalSample};
use log::{debug, info, warn};

mod op {
    pub const GET_IRQ_STATUS: u8 = 0x15;
    pub const GET_RX_BUFFER_STATUS: u8 = 0x17;
    pub const WRITE_REGISTER: u8 = 0x18;
    pub const READ_REGISTER: u8 = 0x19;
    pub const WRITE_BUFFER: u8 = 0x1A;
    pub const READ_BUFFER: u8 = 0x1B;
    pub const GET_PACKET_STATUS: u8 = 0x1D;
    pub const GET_RSSI_INST: u8 = 0x1F;
    pub const SET_STANDBY: u8 = 0x80;
    pub const SET_RX: u8 = 0x82;
    pub const SET_TX: u8 = 0x83;
    pub const SET_SLEEP: u8 = 0x84;
    pub const SET_RF_FREQUENCY: u8 = 0x86;
    pub const SET_PACKET_TYPE: u8 = 0x8A;
    pub const SET_MODULATION_PARAMS: u8 = 0x8B;
    pub const SET_PACKET_PARAMS: u8 = 0x8C;
    pub const SET_DIO_IRQ_PARAMS: u8 = 0x8D;
    pub const SET_TX_PARAMS: u8 = 0x8E;
    pub const SET_BUFFER_BASE_ADDRESS: u8 = 0x8F;
    pub const CLEAR_IRQ_STATUS: u8 = 0x97;
}

mod reg {
    pub const FIRMWARE_VERSION_LSB: u16 = 0x0153;
    pub const FIRMWARE_VERSION_MSB: u16 = 0x0154;
    /// Spreading factor dependent demodulator setting
    pub const SF_ADDITIONAL_CONFIG: u16 = 0x0925;
    pub const FREQ_ERROR_CORRECTION: u16 = 0x093C;
}

mod irq {
    pub const TX_DONE: u16 = 0x0001;
    pub const RX_DONE: u16 = 0x0002;
    pub const HEADER_VALID: u16 = 0x0010;
    pub const HEADER_ERROR: u16 = 0x0020;
    pub const CRC_ERROR: u16 = 0x0040;
    pub const PREAMBLE_DETECTED: u16 = 0x8000;
    pub const ALL: u16 = 0xFFFF;
}

const IRQ_MAP: [(u32, IrqStatus); 6] = [
    (irq::TX_DONE as u32, IrqStatus::TX_DONE),
    (irq::RX_DONE as u32, IrqStatus::RX_DONE),
    (irq::HEADER_VALID as u32, IrqStatus::HEADER_VALID),
    (irq::HEADER_ERROR as u32, IrqStatus::HEADER_ERROR),
    (irq::CRC_ERROR as u32, IrqStatus::CRC_ERROR),
    (irq::PREAMBLE_DETECTED as u32, IrqStatus::PREAMBLE),
];

const NOP: u8 = 0x00;
const PACKET_TYPE_LORA: u8 = 0x01;
const STANDBY_RC: u8 = 0x00;
const STANDBY_XOSC: u8 = 0x01;
const RX_CONTINUOUS: [u8; 3] = [0x00, 0xFF, 0xFF];
const TX_NO_TIMEOUT: [u8; 3] = [0x00, 0x00, 0x00];

const HEADER_IMPLICIT: u8 = 0x80;
const CRC_ON: u8 = 0x20;
const IQ_STANDARD: u8 = 0x40;
const RAMP_20_US: u8 = 0xE0;

const FIRMWARE_VERSIONS: [u16; 2] = [0xB7A9, 0xB5A9];
const XTAL_HZ: u64 = 52_000_000;

const BANDWIDTHS: [Bandwidth; 4] = [
    Bandwidth { hz: 203_125, code: 0x34 },
    Bandwidth { hz: 406_250, code: 0x26 },
    Bandwidth { hz: 812_500, code: 0x18 },
    Bandwidth { hz: 1_625_000, code: 0x0A },
];

/// Bare chip output range
const CHIP_POWER_MIN: i8 = -18;
const CHIP_POWER_MAX: i8 = 13;

/// Chip level for each 0..=20 dBm antenna output through a 20 dBm PA
const PA20_CURVE: [i8; 21] = [
    -18, -18, -18, -17, -16, -15, -14, -13, -12, -11, -10, -9, -8, -7, -6, -5, -4, -3, -2, -1, 0,
];

/// Chip level for each 0..=27 dBm antenna output through a 27 dBm PA
const PA27_CURVE: [i8; 28] = [
    -18, -18, -18, -18, -18, -18, -18, -18, -18, -18, -17, -16, -15, -14, -13, -12, -11, -10, -9,
    -8, -7, -6, -5, -4, -3, -2, -1, 0,
];

/// Readings of the RSSI LSB folded into one random byte
const RANDOM_SAMPLES: usize = 8;

const MAX_COMMAND: usize = 16;

/// Antenna path selected through RXEN/TXEN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    Rx,
    Tx,
}

/// SX1280 / SX1281 driver
pub struct Sx128x<'a, T> {
    bus: Bus<T>,
    irq: &'a IrqBridge,
    board: BoardConfig,
    core: ModemCore,
}

impl<'a, T: Transport> Sx128x<'a, T> {
    pub fn new(transport: T, board: BoardConfig, irq: &'a IrqBridge) -> Self {
        Self {
            bus: Bus::new(transport, timing::BUSY_TIMEOUT_MS),
            irq,
            board,
            core: ModemCore::new(),
        }
    }

    async fn command(&mut self, opcode: u8, params: &[u8]) -> Result<(), RadioError> {
        let mut frame = [0u8; MAX_COMMAND];
        frame[0] = opcode;
        frame[1..=params.len()].copy_from_slice(params);
        self.bus.exchange(&mut frame[..=params.len()]).await?;
        Ok(())
    }

    async fn command_read(&mut self, opcode: u8, out: &mut [u8]) -> Result<(), RadioError> {
        let mut frame = [0u8; MAX_COMMAND];
        frame[0] = opcode;
        frame[1] = NOP;
        let len = 2 + out.len();
        self.bus.exchange(&mut frame[..len]).await?;
        out.copy_from_slice(&frame[2..len]);
        Ok(())
    }

    async fn read_register(&mut self, addr: u16) -> Result<u8, RadioError> {
        let [hi, lo] = addr.to_be_bytes();
        let mut frame = [op::READ_REGISTER, hi, lo, NOP, 0x00];
        self.bus.exchange(&mut frame).await?;
        Ok(frame[4])
    }

    async fn write_register(&mut self, addr: u16, value: u8) -> Result<(), RadioError> {
        let [hi, lo] = addr.to_be_bytes();
        let mut frame = [op::WRITE_REGISTER, hi, lo, value];
        self.bus.exchange(&mut frame).await?;
        Ok(())
    }

    async fn irq_status(&mut self) -> Result<u16, RadioError> {
        let mut status = [0u8; 2];
        self.command_read(op::GET_IRQ_STATUS, &mut status).await?;
        Ok(u16::from_be_bytes(status))
    }

    async fn clear_irq(&mut self, mask: u16) -> Result<(), RadioError> {
        self.command(op::CLEAR_IRQ_STATUS, &mask.to_be_bytes()).await
    }

    async fn detect(&mut self) -> Result<(), RadioError> {
        let start = self.bus.now_ms();
        loop {
            let msb = self.read_register(reg::FIRMWARE_VERSION_MSB).await?;
            let lsb = self.read_register(reg::FIRMWARE_VERSION_LSB).await?;
            let version = u16::from_be_bytes([msb, lsb]);
            if FIRMWARE_VERSIONS.contains(&version) {
                return Ok(());
            }
            if self.bus.now_ms() - start >= timing::DETECT_WINDOW_MS as u64 {
                warn!("sx128x not found, firmware version reads {:#06x}", version);
                return Err(RadioError::Init);
            }
            self.bus.delay_ms(timing::DETECT_RETRY_MS).await;
        }
    }

    async fn set_standby(&mut self) -> Result<(), RadioError> {
        let mode = if self.board.tcxo.is_some() {
            STANDBY_XOSC
        } else {
            STANDBY_RC
        };
        self.command(op::SET_STANDBY, &[mode]).await
    }

    /// Drop both switch lines before raising the new path
    async fn switch_antenna(&mut self, path: Path) -> Result<(), RadioError> {
        if !matches!(self.board.rf_switch, RfSwitch::Pins) {
            return Ok(());
        }
        self.bus.set_pin(ControlPin::RxEnable, false)?;
        self.bus.set_pin(ControlPin::TxEnable, false)?;
        let pin = match path {
            Path::Rx => ControlPin::RxEnable,
            Path::Tx => ControlPin::TxEnable,
        };
        self.bus.set_pin(pin, true)?;
        Ok(())
    }

    async fn send_modulation_params(&mut self) -> Result<(), RadioError> {
        let c = &self.core.config;
        let sf = c.spreading_factor;
        let block = [sf << 4, c.bandwidth_code, c.coding_rate - 4];
        self.command(op::SET_MODULATION_PARAMS, &block).await?;

        let sf_config = match sf {
            ..=6 => 0x1E,
            7..=8 => 0x37,
            _ => 0x32,
        };
        self.write_register(reg::SF_ADDITIONAL_CONFIG, sf_config).await?;
        self.write_register(reg::FREQ_ERROR_CORRECTION, 0x01).await
    }

    async fn send_packet_params(&mut self) -> Result<(), RadioError> {
        let c = &self.core.config;
        let preamble = quantize_preamble_u16(c.preamble_symbols);
        let block = [
            preamble.to_byte(),
            if c.implicit_header { HEADER_IMPLICIT } else { 0x00 },
            c.payload_length,
            if c.crc { CRC_ON } else { 0x00 },
            IQ_STANDARD,
            0,
            0,
        ];
        self.command(op::SET_PACKET_PARAMS, &block).await
    }

    async fn apply_frequency(&mut self, frequency_hz: u32) -> Result<(), RadioError> {
        let word = (((frequency_hz as u64) << 18) / XTAL_HZ) as u32;
        let [_, b2, b1, b0] = word.to_be_bytes();
        self.command(op::SET_RF_FREQUENCY, &[b2, b1, b0]).await?;
        self.core.config.frequency_hz = frequency_hz;
        Ok(())
    }

    async fn apply_modulation(&mut self) -> Result<(), RadioError> {
        self.core.retime();
        self.send_modulation_params().await
    }

    /// Returns the antenna output in dBm and the chip level to program
    fn power_level(&self, dbm: i8) -> (i8, i8) {
        let curve: Option<&[i8]> = match self.board.power_curve {
            PowerCurve::Chip => None,
            PowerCurve::ExternalPa20 => Some(&PA20_CURVE),
            PowerCurve::ExternalPa27 => Some(&PA27_CURVE),
        };
        let (min, max) = match curve {
            Some(curve) => (0, curve.len() as i8 - 1),
            None => (CHIP_POWER_MIN, CHIP_POWER_MAX),
        };
        let max = self.board.max_tx_power_dbm.map_or(max, |cap| cap.min(max));
        let output = dbm.clamp(min, max.max(min));
        let chip = match curve {
            Some(curve) => curve[output as usize],
            None => output,
        };
        (output, chip)
    }

    async fn apply_tx_power(&mut self, dbm: i8) -> Result<(), RadioError> {
        let (output, chip) = self.power_level(dbm);
        let level = (chip - CHIP_POWER_MIN) as u8;
        self.command(op::SET_TX_PARAMS, &[level, RAMP_20_US]).await?;
        self.core.config.tx_power_dbm = output;
        Ok(())
    }

    async fn route_irq(&mut self) -> Result<(), RadioError> {
        let [all_hi, all_lo] = irq::ALL.to_be_bytes();
        let [rx_hi, rx_lo] = irq::RX_DONE.to_be_bytes();
        self.command(
            op::SET_DIO_IRQ_PARAMS,
            &[all_hi, all_lo, rx_hi, rx_lo, 0, 0, 0, 0],
        )
        .await?;
        self.irq
            .set_enabled(self.core.online && self.core.handler.is_some());
        Ok(())
    }

    async fn start_rx(&mut self) -> Result<(), RadioError> {
        self.command(op::SET_RX, &RX_CONTINUOUS).await
    }

    async fn capture_signal(&mut self) -> Result<SignalSample, RadioError> {
        let mut status = [0u8; 5];
        self.command_read(op::GET_PACKET_STATUS, &mut status).await?;
        let rssi_raw = status[0];
        let snr_raw = status[1];
        Ok(SignalSample {
            rssi_raw,
            snr_raw,
            rssi_dbm: -(rssi_raw as i16) / 2,
            snr_db: snr_raw as i8 as f32 * 0.25,
            frequency_error_hz: 0,
        })
    }

    /// Runs from `poll()`, never from interrupt context, so the re-arm and
    /// the handler call cannot be split by another edge
    /// Send the staged packet and poll for tx-done
    async fn transmit(&mut self) -> Result<(), RadioError> {
        self.core.config.payload_length = self.core.buffer.len() as u8;
        self.send_packet_params().await?;
        self.switch_antenna(Path::Tx).await?;
        self.core.set_state(ModemState::Transmitting);
        self.command(op::SET_TX, &TX_NO_TIMEOUT).await?;

        let start = self.bus.now_ms();
        loop {
            if self.irq_status().await? & irq::TX_DONE != 0 {
                self.clear_irq(irq::TX_DONE).await?;
                return Ok(());
            }
            if self.bus.now_ms() - start >= timing::MODEM_TIMEOUT_SX128X_MS as u64 {
                warn!(
                    "sx128x: tx-done not seen within {} ms",
                    timing::MODEM_TIMEOUT_SX128X_MS
                );
                return Err(RadioError::TxTimeout);
            }
            self.bus.delay_ms(timing::TX_POLL_MS).await;
        }
    }

    async fn handle_irq(&mut self) -> Result<Option<usize>, RadioError> {
        let raw = self.irq_status().await?;
        self.clear_irq(raw).await?;
        let status = IrqStatus::from_raw(raw as u32, &IRQ_MAP);

        if !status.contains(IrqStatus::RX_DONE) {
            return Ok(None);
        }
        self.core.carrier.reset();

        let intact = status.packet_ok();
        if intact {
            let mut rx = [0u8; 2];
            self.command_read(op::GET_RX_BUFFER_STATUS, &mut rx).await?;
            let [len, start] = rx;
            let mut frame = [0u8; 3 + lora_defaults::MAX_PAYLOAD];
            frame[0] = op::READ_BUFFER;
            frame[1] = start;
            frame[2] = NOP;
            let end = 3 + len as usize;
            self.bus.exchange(&mut frame[..end]).await?;
            self.core.buffer.load(&frame[3..end]);
            self.core.signal = self.capture_signal().await?;
        } else {
            debug!("sx128x: crc error, packet dropped");
            self.core.buffer.reset();
        }

        if self.core.state == ModemState::Receiving {
            self.start_rx().await?;
        }

        if intact {
            Ok(Some(self.core.deliver()))
        } else {
            Ok(None)
        }
    }

    async fn init(&mut self, frequency_hz: u32) -> Result<(), RadioError> {
        self.bus.reset().await?;
        self.detect().await?;

        self.core.config = RadioConfig {
            frequency_hz,
            payload_length: lora_defaults::MAX_PAYLOAD as u8,
            ..RadioConfig::default()
        };
        let bw = select_bandwidth(&BANDWIDTHS, self.core.config.bandwidth_hz);
        self.core.config.bandwidth_hz = bw.hz;
        self.core.config.bandwidth_code = bw.code;
        self.core.config.preamble_symbols =
            quantize_preamble_u16(self.core.config.preamble_symbols).symbols() as u16;
        self.core.retime();

        self.set_standby().await?;
        self.command(op::SET_PACKET_TYPE, &[PACKET_TYPE_LORA]).await?;
        self.switch_antenna(Path::Rx).await?;
        self.apply_frequency(frequency_hz).await?;
        self.send_modulation_params().await?;
        self.send_packet_params().await?;
        self.apply_tx_power(lora_defaults::TX_POWER_DBM).await?;
        self.command(op::SET_BUFFER_BASE_ADDRESS, &[0x00, 0x00]).await?;
        Ok(())
    }
}

impl<'a, T: Transport> Modem for Sx128x<'a, T> {
    modem_accessors!();

    async fn begin(&mut self, frequency_hz: u32) -> Result<(), RadioError> {
        self.irq.set_enabled(false);
        self.core.go_offline();

        if let Err(e) = self.init(frequency_hz).await {
            self.core.go_offline();
            return Err(e);
        }

        self.core.online = true;
        self.core.set_state(ModemState::Standby);
        self.route_irq().await?;
        info!("sx128x online at {} Hz", frequency_hz);
        Ok(())
    }

    async fn end(&mut self) {
        self.irq.set_enabled(false);
        if self.core.online {
            let _ = self.command(op::SET_SLEEP, &[0x00]).await;
        }
        self.bus.release();
        self.core.go_offline();
    }

    async fn set_frequency(&mut self, frequency_hz: u32) -> Result<(), RadioError> {
        if !self.core.online {
            return Ok(());
        }
        self.apply_frequency(frequency_hz).await
    }

    async fn frequency(&mut self) -> Result<u32, RadioError> {
        Ok(self.core.config.frequency_hz)
    }

    async fn set_spreading_factor(&mut self, sf: u8) -> Result<(), RadioError> {
        if !self.core.online {
            return Ok(());
        }
        self.core.config.spreading_factor = sf.clamp(5, 12);
        self.apply_modulation().await
    }

    async fn set_signal_bandwidth(&mut self, bandwidth_hz: u32) -> Result<(), RadioError> {
        if !self.core.online {
            return Ok(());
        }
        let bw = select_bandwidth(&BANDWIDTHS, bandwidth_hz);
        self.core.config.bandwidth_hz = bw.hz;
        self.core.config.bandwidth_code = bw.code;
        self.apply_modulation().await
    }

    async fn set_coding_rate4(&mut self, denominator: u8) -> Result<(), RadioError> {
        if !self.core.online {
            return Ok(());
        }
        self.core.config.coding_rate = denominator.clamp(5, 8);
        self.apply_modulation().await
    }

    async fn set_tx_power(&mut self, dbm: i8) -> Result<(), RadioError> {
        if !self.core.online {
            return Ok(());
        }
        self.apply_tx_power(dbm).await
    }

    async fn set_preamble_length(&mut self, symbols: u16) -> Result<u16, RadioError> {
        if !self.core.online {
            return Ok(self.core.config.preamble_symbols);
        }
        self.core.config.preamble_symbols = quantize_preamble_u16(symbols).symbols() as u16;
        self.core.retime();
        self.send_packet_params().await?;
        Ok(self.core.config.preamble_symbols)
    }

    async fn set_crc(&mut self, enabled: bool) -> Result<(), RadioError> {
        if !self.core.online {
            return Ok(());
        }
        self.core.config.crc = enabled;
        self.send_packet_params().await
    }

    async fn begin_packet(&mut self, implicit_header: bool) -> Result<(), RadioError> {
        if !self.core.online {
            return Err(RadioError::Offline);
        }
        let listening = self.core.state == ModemState::Receiving;
        self.standby().await?;
        if listening || self.irq.is_pending() {
            // The TX payload reuses the buffer a received packet is waiting in
            self.irq.take();
            self.handle_irq().await?;
        }
        self.core.config.implicit_header = implicit_header;
        self.core.config.payload_length = 0;
        self.core.buffer.reset();
        self.send_packet_params().await
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, RadioError> {
        if !self.core.online {
            return Err(RadioError::Offline);
        }
        let staged = self.core.buffer.stage(data);
        if staged.len > 0 {
            let mut frame = [0u8; 2 + lora_defaults::MAX_PAYLOAD];
            frame[0] = op::WRITE_BUFFER;
            frame[1] = staged.offset;
            frame[2..2 + staged.len].copy_from_slice(&data[..staged.len]);
            self.bus.exchange(&mut frame[..2 + staged.len]).await?;
        }
        Ok(staged.len)
    }

    async fn end_packet(&mut self) -> Result<(), RadioError> {
        if !self.core.online {
            return Err(RadioError::Offline);
        }

        let outcome = self.transmit().await;
        if outcome.is_err() {
            let _ = self.set_standby().await;
        }
        let switched = self.switch_antenna(Path::Rx).await;
        self.core.buffer.reset();
        self.core.set_state(ModemState::Standby);
        outcome?;
        switched
    }

    async fn receive(&mut self, size: u8) -> Result<(), RadioError> {
        if !self.core.online {
            return Err(RadioError::Offline);
        }
        self.standby().await?;
        if size > 0 {
            self.core.config.implicit_header = true;
            self.core.config.payload_length = size;
        } else {
            self.core.config.implicit_header = false;
            self.core.config.payload_length = lora_defaults::MAX_PAYLOAD as u8;
        }
        self.send_packet_params().await?;
        self.switch_antenna(Path::Rx).await?;
        self.start_rx().await?;
        self.core.set_state(ModemState::Receiving);
        Ok(())
    }

    async fn carrier_detected(&mut self) -> Result<bool, RadioError> {
        if !self.core.online {
            return Ok(false);
        }
        let raw = self.irq_status().await?;
        let status = IrqStatus::from_raw(raw as u32, &IRQ_MAP);
        let now = self.bus.now_ms();
        let window = self.core.timing.preamble_window_ms();
        let verdict = self.core.carrier.evaluate(now, status, window);
        if verdict.clear_preamble {
            self.clear_irq(irq::PREAMBLE_DETECTED).await?;
        }
        Ok(verdict.carrier)
    }

    async fn current_rssi_raw(&mut self) -> Result<u8, RadioError> {
        if !self.core.online {
            return Ok(0);
        }
        let mut rssi = [0u8; 1];
        self.command_read(op::GET_RSSI_INST, &mut rssi).await?;
        Ok(rssi[0])
    }

    async fn current_rssi(&mut self) -> Result<i16, RadioError> {
        let raw = self.current_rssi_raw().await?;
        Ok(-(raw as i16) / 2)
    }

    async fn on_receive(&mut self, handler: Option<ReceiveHandler>) -> Result<(), RadioError> {
        self.core.handler = handler;
        if !self.core.online {
            return Ok(());
        }
        self.route_irq().await
    }

    async fn poll(&mut self) -> Result<Option<usize>, RadioError> {
        if !self.irq.take() || !self.core.online {
            return Ok(None);
        }
        self.handle_irq().await
    }

    async fn sleep(&mut self) -> Result<(), RadioError> {
        if !self.core.online {
            return Ok(());
        }
        self.command(op::SET_SLEEP, &[0x00]).await?;
        self.core.set_state(ModemState::Sleeping);
        Ok(())
    }

    async fn standby(&mut self) -> Result<(), RadioError> {
        if !self.core.online {
            return Ok(());
        }
        self.set_standby().await?;
        self.core.set_state(ModemState::Standby);
        Ok(())
    }

    /// No RNG on this chip; fold the noise bit of several RSSI readings
    async fn random(&mut self) -> Result<u8, RadioError> {
        if !self.core.online {
            return Ok(0);
        }
        let mut value = 0u8;
        for _ in 0..RANDOM_SAMPLES {
            let sample = self.current_rssi_raw().await?;
            value = (value << 1) | (sample & 0x01);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::boards;
    use crate::radio::mock::{mock_transport, ChipSim, MockHandle, MockTransport};
    use std::cell::RefCell;
    use std::vec::Vec;

    thread_local! {
        /// Chip commands and handler calls, interleaved as they happened
        static EVENTS: RefCell<Vec<&'static str>> = RefCell::new(Vec::new());
    }

    fn event(name: &'static str) {
        EVENTS.with(|e| e.borrow_mut().push(name));
    }

    fn events() -> Vec<&'static str> {
        EVENTS.with(|e| e.borrow().clone())
    }

    fn on_packet(_packet: &[u8]) {
        event("delivered");
    }

    struct Sx128xSim {
        regs: Vec<u8>,
        buffer: [u8; 256],
        irq: u16,
        rx_status: [u8; 2],
        packet_status: [u8; 5],
        packet_params: Vec<u8>,
        rssi: u8,
        hang_tx: bool,
        tx_done_at: Option<u64>,
        transmitted: Vec<Vec<u8>>,
    }

    impl Sx128xSim {
        fn new() -> Self {
            let mut regs = vec![0u8; 0x1000];
            regs[reg::FIRMWARE_VERSION_MSB as usize] = 0xB7;
            regs[reg::FIRMWARE_VERSION_LSB as usize] = 0xA9;
            Self {
                regs,
                buffer: [0; 256],
                irq: 0,
                rx_status: [0; 2],
                packet_status: [0; 5],
                packet_params: Vec::new(),
                rssi: 0,
                hang_tx: false,
                tx_done_at: None,
                transmitted: Vec::new(),
            }
        }

        fn inject_rx(&mut self, payload: &[u8], crc_ok: bool) {
            let start = 0x10;
            self.buffer[start..start + payload.len()].copy_from_slice(payload);
            self.rx_status = [payload.len() as u8, start as u8];
            self.packet_status = [0x96, 0x14, 0, 0, 0];
            self.irq |= irq::RX_DONE | irq::HEADER_VALID;
            if !crc_ok {
                self.irq |= irq::CRC_ERROR;
            }
        }
    }

    impl ChipSim for Sx128xSim {
        fn transfer(&mut self, now: u64, frame: &mut [u8]) {
            let addr = |f: &[u8]| u16::from_be_bytes([f[1], f[2]]) as usize;
            match frame[0] {
                op::READ_REGISTER => frame[4] = self.regs[addr(frame)],
                op::WRITE_REGISTER => self.regs[addr(frame)] = frame[3],
                op::WRITE_BUFFER => {
                    let offset = frame[1] as usize;
                    let data = &frame[2..];
                    self.buffer[offset..offset + data.len()].copy_from_slice(data);
                }
                op::READ_BUFFER => {
                    let offset = frame[1] as usize;
                    let len = frame.len() - 3;
                    frame[3..].copy_from_slice(&self.buffer[offset..offset + len]);
                }
                op::GET_IRQ_STATUS => frame[2..4].copy_from_slice(&self.irq.to_be_bytes()),
                op::CLEAR_IRQ_STATUS => self.irq &= !u16::from_be_bytes([frame[1], frame[2]]),
                op::GET_RX_BUFFER_STATUS => frame[2..4].copy_from_slice(&self.rx_status),
                op::GET_PACKET_STATUS => frame[2..7].copy_from_slice(&self.packet_status),
                op::GET_RSSI_INST => {
                    frame[2] = self.rssi;
                    self.rssi = self.rssi.wrapping_add(3);
                }
                op::SET_PACKET_PARAMS => self.packet_params = frame[1..].to_vec(),
                op::SET_RX => event("set_rx"),
                op::SET_TX => {
                    let len = self.packet_params[2] as usize;
                    self.transmitted.push(self.buffer[..len].to_vec());
                    if !self.hang_tx {
                        self.tx_done_at = Some(now + 3);
                    }
                }
                _ => {}
            }
        }

        fn tick(&mut self, now: u64) -> bool {
            if matches!(self.tx_done_at, Some(at) if at <= now) {
                self.tx_done_at = None;
                self.irq |= irq::TX_DONE;
            }
            false
        }
    }

    type Radio<'a> = Sx128x<'a, MockTransport<'a, Sx128xSim>>;

    fn online<'a>(irq: &'a IrqBridge, board: BoardConfig) -> (Radio<'a>, MockHandle<'a, Sx128xSim>) {
        let (transport, handle) = mock_transport(Sx128xSim::new(), Some(irq));
        let mut radio = Sx128x::new(transport, board, irq);
        futures::executor::block_on(radio.begin(2_400_000_000)).unwrap();
        (radio, handle)
    }

    fn last(handle: &MockHandle<'_, Sx128xSim>, opcode: u8) -> Vec<u8> {
        handle.frames_starting(&[opcode]).pop().unwrap()
    }

    #[test]
    fn test_begin_defaults() {
        let irq = IrqBridge::new();
        let (radio, handle) = online(&irq, boards::SX1280);

        assert_eq!(radio.state(), ModemState::Standby);
        assert_eq!(radio.signal_bandwidth(), 203_125);
        // 18 symbols is 9 * 2^1
        assert_eq!(radio.preamble_length(), 18);
        assert_eq!(last(&handle, op::SET_MODULATION_PARAMS), vec![0x8B, 0x70, 0x34, 0x01]);
        assert_eq!(
            last(&handle, op::SET_PACKET_PARAMS),
            vec![0x8C, 0x19, 0x00, 255, CRC_ON, IQ_STANDARD, 0, 0]
        );
        assert_eq!(handle.chip().regs[reg::SF_ADDITIONAL_CONFIG as usize], 0x37);
        assert_eq!(handle.chip().regs[reg::FREQ_ERROR_CORRECTION as usize], 0x01);
    }

    #[test]
    fn test_begin_fails_without_chip() {
        let irq = IrqBridge::new();
        let mut chip = Sx128xSim::new();
        chip.regs[reg::FIRMWARE_VERSION_MSB as usize] = 0x00;
        let (transport, _handle) = mock_transport(chip, Some(&irq));
        let mut radio = Sx128x::new(transport, boards::SX1280, &irq);
        assert_eq!(
            futures::executor::block_on(radio.begin(2_400_000_000)),
            Err(RadioError::Init)
        );
        assert_eq!(radio.state(), ModemState::Uninitialized);
    }

    #[test]
    fn test_frequency_word() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280);
        futures::executor::block_on(radio.set_frequency(2_425_000_000)).unwrap();
        // 2425e6 * 2^18 / 52e6 = 12_224_984.6, truncated to 0xBA89D8
        assert_eq!(last(&handle, op::SET_RF_FREQUENCY), vec![0x86, 0xBA, 0x89, 0xD8]);
        assert_eq!(futures::executor::block_on(radio.frequency()), Ok(2_425_000_000));
    }

    #[test]
    fn test_modulation_resends_sf_register() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280);

        futures::executor::block_on(async {
            radio.set_spreading_factor(5).await.unwrap();
            assert_eq!(handle.chip().regs[reg::SF_ADDITIONAL_CONFIG as usize], 0x1E);
            radio.set_spreading_factor(10).await.unwrap();
            assert_eq!(handle.chip().regs[reg::SF_ADDITIONAL_CONFIG as usize], 0x32);
            radio.set_signal_bandwidth(800_000).await.unwrap();
            radio.set_coding_rate4(8).await.unwrap();
        });
        assert_eq!(radio.signal_bandwidth(), 812_500);
        assert_eq!(last(&handle, op::SET_MODULATION_PARAMS), vec![0x8B, 0xA0, 0x18, 0x04]);

        futures::executor::block_on(radio.set_signal_bandwidth(5_000_000)).unwrap();
        assert_eq!(radio.signal_bandwidth(), 1_625_000);
    }

    #[test]
    fn test_preamble_reports_achieved_length() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280);

        futures::executor::block_on(async {
            assert_eq!(radio.set_preamble_length(12).await, Ok(12));
            assert_eq!(last(&handle, op::SET_PACKET_PARAMS)[1], 0x0C);
            // 33 is not m * 2^e with a 4 bit mantissa, next up is 9 * 2^2
            assert_eq!(radio.set_preamble_length(33).await, Ok(36));
            assert_eq!(last(&handle, op::SET_PACKET_PARAMS)[1], 0x29);
        });
    }

    #[test]
    fn test_power_curves() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280);
        futures::executor::block_on(async {
            radio.set_tx_power(20).await.unwrap();
            assert_eq!(radio.tx_power(), 13);
            assert_eq!(last(&handle, op::SET_TX_PARAMS), vec![0x8E, 31, RAMP_20_US]);
            radio.set_tx_power(-30).await.unwrap();
            assert_eq!(radio.tx_power(), -18);
            assert_eq!(last(&handle, op::SET_TX_PARAMS), vec![0x8E, 0, RAMP_20_US]);
        });

        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280_PA20);
        futures::executor::block_on(async {
            radio.set_tx_power(30).await.unwrap();
            assert_eq!(radio.tx_power(), 20);
            assert_eq!(last(&handle, op::SET_TX_PARAMS), vec![0x8E, 18, RAMP_20_US]);
            radio.set_tx_power(-3).await.unwrap();
            assert_eq!(radio.tx_power(), 0);
            assert_eq!(last(&handle, op::SET_TX_PARAMS), vec![0x8E, 0, RAMP_20_US]);
        });

        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280_PA27);
        futures::executor::block_on(async {
            radio.set_tx_power(27).await.unwrap();
            assert_eq!(radio.tx_power(), 27);
            assert_eq!(last(&handle, op::SET_TX_PARAMS), vec![0x8E, 18, RAMP_20_US]);
            radio.set_tx_power(14).await.unwrap();
            assert_eq!(last(&handle, op::SET_TX_PARAMS), vec![0x8E, 5, RAMP_20_US]);
        });
    }

    #[test]
    fn test_transmit_switches_antenna_break_before_make() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280);

        handle.clear_pins();
        futures::executor::block_on(async {
            radio.begin_packet(false).await.unwrap();
            radio.write(b"2.4").await.unwrap();
            radio.end_packet().await.unwrap();
        });

        assert_eq!(handle.chip().transmitted, vec![b"2.4".to_vec()]);
        assert_eq!(radio.state(), ModemState::Standby);
        assert_eq!(
            handle.pin_history(),
            vec![
                (ControlPin::RxEnable, false),
                (ControlPin::TxEnable, false),
                (ControlPin::TxEnable, true),
                (ControlPin::RxEnable, false),
                (ControlPin::TxEnable, false),
                (ControlPin::RxEnable, true),
            ]
        );
    }

    #[test]
    fn test_transmit_timeout() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280);
        handle.chip().hang_tx = true;

        let start = handle.now();
        futures::executor::block_on(async {
            radio.begin_packet(false).await.unwrap();
            radio.write(b"x").await.unwrap();
            assert_eq!(radio.end_packet().await, Err(RadioError::TxTimeout));
        });
        assert!(handle.now() - start >= timing::MODEM_TIMEOUT_SX128X_MS as u64);
        assert_eq!(radio.state(), ModemState::Standby);
    }

    #[test]
    fn test_rx_rearmed_before_delivery() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280);

        futures::executor::block_on(async {
            radio.on_receive(Some(on_packet)).await.unwrap();
            radio.receive(0).await.unwrap();

            handle.chip().inject_rx(b"bad", false);
            irq.raise();
            assert_eq!(radio.poll().await, Ok(None));

            handle.chip().inject_rx(b"fine", true);
            irq.raise();
            assert_eq!(radio.poll().await, Ok(Some(4)));
        });

        // Initial SetRx, re-arm after the CRC failure, re-arm then delivery
        assert_eq!(events(), vec!["set_rx", "set_rx", "set_rx", "delivered"]);
        assert_eq!(radio.available(), 4);
        assert_eq!(radio.packet_rssi(), -75);
        assert_eq!(radio.packet_snr(), 5.0);
        assert_eq!(radio.state(), ModemState::Receiving);
    }

    #[test]
    fn test_false_preamble_on_high_bit() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280);

        futures::executor::block_on(async {
            radio.receive(0).await.unwrap();
            handle.chip().irq |= irq::PREAMBLE_DETECTED;
            assert_eq!(radio.carrier_detected().await, Ok(true));
            handle.advance(radio.timing().preamble_window_ms() as u64 + 1);
            assert_eq!(radio.carrier_detected().await, Ok(false));
        });
        assert_eq!(radio.false_preambles(), 1);
        assert_eq!(handle.chip().irq, 0);
    }

    #[test]
    fn test_header_keeps_carrier_past_preamble_window() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280);

        futures::executor::block_on(async {
            radio.receive(0).await.unwrap();
            handle.chip().irq |= irq::PREAMBLE_DETECTED;
            assert_eq!(radio.carrier_detected().await, Ok(true));
            handle.chip().irq |= irq::HEADER_VALID;

            handle.advance(radio.timing().preamble_window_ms() as u64 + 1);
            assert_eq!(radio.carrier_detected().await, Ok(true));
            assert_eq!(handle.chip().irq, irq::HEADER_VALID);
            handle.advance(2);
            assert_eq!(radio.carrier_detected().await, Ok(true));
        });
        assert_eq!(radio.false_preambles(), 0);
    }

    #[test]
    fn test_packet_waiting_before_transmit_is_delivered() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280);

        futures::executor::block_on(async {
            radio.on_receive(Some(on_packet)).await.unwrap();
            radio.receive(0).await.unwrap();
            handle.chip().inject_rx(b"early", true);
            irq.raise();

            radio.begin_packet(false).await.unwrap();
            radio.write(b"reply").await.unwrap();
            radio.end_packet().await.unwrap();
            assert_eq!(radio.poll().await, Ok(None));
        });

        // Standby before the drain, so the early packet does not re-arm RX
        assert_eq!(events(), vec!["set_rx", "delivered"]);
        assert_eq!(handle.chip().transmitted, vec![b"reply".to_vec()]);
        assert_eq!(handle.chip().irq, 0);
    }

    #[test]
    fn test_transmit_bus_error_still_returns_to_standby() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280);

        futures::executor::block_on(async {
            radio.begin_packet(false).await.unwrap();
            radio.write(b"lost").await.unwrap();
            handle.clear_pins();
            handle.fail_transfers(true);
            assert_eq!(radio.end_packet().await, Err(RadioError::Bus));
        });

        assert_eq!(radio.state(), ModemState::Standby);
        assert_eq!(
            handle.pin_history(),
            vec![
                (ControlPin::RxEnable, false),
                (ControlPin::TxEnable, false),
                (ControlPin::RxEnable, true),
            ]
        );
    }

    #[test]
    fn test_longest_preamble_is_representable() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1280);

        assert_eq!(
            futures::executor::block_on(radio.set_preamble_length(u16::MAX)),
            Ok(61_440)
        );
        assert_eq!(radio.preamble_length(), 61_440);
        assert_eq!(last(&handle, op::SET_PACKET_PARAMS)[1], 0xCF);
    }

    #[test]
    fn test_random_folds_rssi_noise() {
        let irq = IrqBridge::new();
        let (mut radio, _handle) = online(&irq, boards::SX1280);
        // RSSI readings 0, 3, 6, 9, 12, 15, 18, 21 have LSBs 0,1,0,1,0,1,0,1
        assert_eq!(futures::executor::block_on(radio.random()), Ok(0b0101_0101));
    }
}
