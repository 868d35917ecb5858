//! SX1262/SX1268 LoRa backend
//!
//! Opcode protocol gated by the busy line. Modulation and packet parameters
//! have no register view, so every change resends the whole block.

use crate::config::{lora_defaults, timing, BoardConfig, RfSwitch};
use crate::radio::bus::{Bus, ControlPin, Transport};
use crate::radio::irq::{IrqBridge, IrqStatus};
use crate::radio::modulation::{select_bandwidth, Bandwidth};
use crate::radio::shared::{modem_accessors, ModemCore};
use crate::radio::traits::{Modem, ModemState, RadioConfig, RadioError, ReceiveHandler, SignalSample};
use log::{debug, info, warn};

/// Command opcodes
mod op {
    pub const CLEAR_IRQ_STATUS: u8 = 0x02;
    pub const SET_DIO_IRQ_PARAMS: u8 = 0x08;
    pub const WRITE_REGISTER: u8 = 0x0D;
    pub const WRITE_BUFFER: u8 = 0x0E;
    pub const GET_IRQ_STATUS: u8 = 0x12;
    pub const GET_RX_BUFFER_STATUS: u8 = 0x13;
    pub const GET_PACKET_STATUS: u8 = 0x14;
    pub const GET_RSSI_INST: u8 = 0x15;
    pub const READ_REGISTER: u8 = 0x1D;
    pub const READ_BUFFER: u8 = 0x1E;
    pub const SET_STANDBY: u8 = 0x80;
    pub const SET_RX: u8 = 0x82;
    pub const SET_TX: u8 = 0x83;
    pub const SET_SLEEP: u8 = 0x84;
    pub const SET_RF_FREQUENCY: u8 = 0x86;
    pub const CALIBRATE: u8 = 0x89;
    pub const SET_PACKET_TYPE: u8 = 0x8A;
    pub const SET_MODULATION_PARAMS: u8 = 0x8B;
    pub const SET_PACKET_PARAMS: u8 = 0x8C;
    pub const SET_TX_PARAMS: u8 = 0x8E;
    pub const SET_BUFFER_BASE_ADDRESS: u8 = 0x8F;
    pub const SET_PA_CONFIG: u8 = 0x95;
    pub const SET_DIO3_AS_TCXO_CTRL: u8 = 0x97;
    pub const CALIBRATE_IMAGE: u8 = 0x98;
    pub const SET_DIO2_AS_RF_SWITCH_CTRL: u8 = 0x9D;
}

/// Register addresses
mod reg {
    pub const SYNC_WORD_MSB: u16 = 0x0740;
    pub const SYNC_WORD_LSB: u16 = 0x0741;
    pub const RANDOM_NUMBER: u16 = 0x0819;
    pub const RX_GAIN: u16 = 0x08AC;
    pub const TX_CLAMP_CONFIG: u16 = 0x08D8;
    pub const OCP: u16 = 0x08E7;
}

/// IRQ status bits
mod irq {
    pub const TX_DONE: u16 = 0x0001;
    pub const RX_DONE: u16 = 0x0002;
    pub const PREAMBLE_DETECTED: u16 = 0x0004;
    pub const HEADER_VALID: u16 = 0x0010;
    pub const HEADER_ERROR: u16 = 0x0020;
    pub const CRC_ERROR: u16 = 0x0040;
    pub const ALL: u16 = 0xFFFF;
}

const IRQ_MAP: [(u32, IrqStatus); 6] = [
    (irq::TX_DONE as u32, IrqStatus::TX_DONE),
    (irq::RX_DONE as u32, IrqStatus::RX_DONE),
    (irq::PREAMBLE_DETECTED as u32, IrqStatus::PREAMBLE),
    (irq::HEADER_VALID as u32, IrqStatus::HEADER_VALID),
    (irq::HEADER_ERROR as u32, IrqStatus::HEADER_ERROR),
    (irq::CRC_ERROR as u32, IrqStatus::CRC_ERROR),
];

const NOP: u8 = 0x00;
const PACKET_TYPE_LORA: u8 = 0x01;
const STANDBY_XOSC: u8 = 0x01;
const CALIBRATE_ALL: u8 = 0x7F;
const RX_CONTINUOUS: [u8; 3] = [0xFF, 0xFF, 0xFF];
const TX_NO_TIMEOUT: [u8; 3] = [0x00, 0x00, 0x00];

/// Values the LoRa sync word registers come out of reset with
const RESET_SYNC_WORDS: [u16; 2] = [0x1424, 0x4434];
const SYNC_WORD: u16 = 0x1424;

/// SetPaConfig for the SX1262 high power PA: duty cycle, hpMax, device, lut
const PA_CONFIG_HP: [u8; 4] = [0x04, 0x07, 0x00, 0x01];
/// Antenna mismatch workaround, ORed into TX_CLAMP_CONFIG
const TX_CLAMP_MASK: u8 = 0x0F << 1;
/// 140 mA over current limit
const OCP_LIMIT: u8 = 0x38;
const RAMP_40_US: u8 = 0x02;
const RX_GAIN_BOOSTED: u8 = 0x96;
const TX_POWER_MIN: i8 = -9;
const TX_POWER_MAX: i8 = 22;

/// DIO3 TCXO start-up timeout in 15.625 us steps (5 ms)
const TCXO_TIMEOUT: u32 = 320;
const XTAL_HZ: u64 = 32_000_000;

/// Image calibration ranges, frequencies in 4 MHz steps
const IMAGE_BANDS: [(u32, u32, [u8; 2]); 5] = [
    (430_000_000, 440_000_000, [0x6B, 0x6F]),
    (470_000_000, 510_000_000, [0x75, 0x81]),
    (779_000_000, 787_000_000, [0xC1, 0xC5]),
    (863_000_000, 870_000_000, [0xD7, 0xDB]),
    (902_000_000, 928_000_000, [0xE1, 0xE9]),
];

const BANDWIDTHS: [Bandwidth; 10] = [
    Bandwidth { hz: 7_800, code: 0x00 },
    Bandwidth { hz: 10_400, code: 0x08 },
    Bandwidth { hz: 15_600, code: 0x01 },
    Bandwidth { hz: 20_800, code: 0x09 },
    Bandwidth { hz: 31_250, code: 0x02 },
    Bandwidth { hz: 41_700, code: 0x0A },
    Bandwidth { hz: 62_500, code: 0x03 },
    Bandwidth { hz: 125_000, code: 0x04 },
    Bandwidth { hz: 250_000, code: 0x05 },
    Bandwidth { hz: 500_000, code: 0x06 },
];

/// Largest opcode frame other than buffer transfers
const MAX_COMMAND: usize = 16;

/// SX1261 / SX1262 / SX1268 driver
pub struct Sx126x<'a, T> {
    bus: Bus<T>,
    irq: &'a IrqBridge,
    board: BoardConfig,
    core: ModemCore,
    image_band: Option<[u8; 2]>,
}

impl<'a, T: Transport> Sx126x<'a, T> {
    pub fn new(transport: T, board: BoardConfig, irq: &'a IrqBridge) -> Self {
        Self {
            bus: Bus::new(transport, timing::BUSY_TIMEOUT_MS),
            irq,
            board,
            core: ModemCore::new(),
            image_band: None,
        }
    }

    async fn command(&mut self, opcode: u8, params: &[u8]) -> Result<(), RadioError> {
        let mut frame = [0u8; MAX_COMMAND];
        frame[0] = opcode;
        frame[1..=params.len()].copy_from_slice(params);
        self.bus.exchange(&mut frame[..=params.len()]).await?;
        Ok(())
    }

    /// `[op, NOP, data...]`, response data lands in `out`
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

    async fn write_buffer(&mut self, offset: u8, data: &[u8]) -> Result<(), RadioError> {
        let mut frame = [0u8; 2 + lora_defaults::MAX_PAYLOAD];
        frame[0] = op::WRITE_BUFFER;
        frame[1] = offset;
        frame[2..2 + data.len()].copy_from_slice(data);
        self.bus.exchange(&mut frame[..2 + data.len()]).await?;
        Ok(())
    }

    async fn read_buffer(&mut self, offset: u8, len: usize) -> Result<(), RadioError> {
        let mut frame = [0u8; 3 + lora_defaults::MAX_PAYLOAD];
        frame[0] = op::READ_BUFFER;
        frame[1] = offset;
        frame[2] = NOP;
        self.bus.exchange(&mut frame[..3 + len]).await?;
        self.core.buffer.load(&frame[3..3 + len]);
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
            let msb = self.read_register(reg::SYNC_WORD_MSB).await?;
            let lsb = self.read_register(reg::SYNC_WORD_LSB).await?;
            let word = u16::from_be_bytes([msb, lsb]);
            if RESET_SYNC_WORDS.contains(&word) {
                return Ok(());
            }
            if self.bus.now_ms() - start >= timing::DETECT_WINDOW_MS as u64 {
                warn!("sx126x not found, sync word reads {:#06x}", word);
                return Err(RadioError::Init);
            }
            self.bus.delay_ms(timing::DETECT_RETRY_MS).await;
        }
    }

    async fn set_standby(&mut self) -> Result<(), RadioError> {
        self.command(op::SET_STANDBY, &[STANDBY_XOSC]).await
    }

    async fn send_modulation_params(&mut self) -> Result<(), RadioError> {
        let c = &self.core.config;
        let block = [
            c.spreading_factor,
            c.bandwidth_code,
            c.coding_rate - 4,
            self.core.timing.low_data_rate as u8,
            0,
            0,
            0,
            0,
        ];
        self.command(op::SET_MODULATION_PARAMS, &block).await
    }

    async fn send_packet_params(&mut self) -> Result<(), RadioError> {
        let c = &self.core.config;
        let [pre_hi, pre_lo] = c.preamble_symbols.to_be_bytes();
        let block = [
            pre_hi,
            pre_lo,
            c.implicit_header as u8,
            c.payload_length,
            c.crc as u8,
            0,
            0,
            0,
            0,
        ];
        self.command(op::SET_PACKET_PARAMS, &block).await
    }

    async fn calibrate_image(&mut self, frequency_hz: u32) -> Result<(), RadioError> {
        let Some(&(_, _, band)) = IMAGE_BANDS
            .iter()
            .find(|(lo, hi, _)| (*lo..=*hi).contains(&frequency_hz))
        else {
            debug!("sx126x: no image calibration band for {} Hz", frequency_hz);
            return Ok(());
        };
        if self.image_band == Some(band) {
            return Ok(());
        }
        self.command(op::CALIBRATE_IMAGE, &band).await?;
        self.image_band = Some(band);
        Ok(())
    }

    async fn apply_frequency(&mut self, frequency_hz: u32) -> Result<(), RadioError> {
        self.calibrate_image(frequency_hz).await?;
        let word = (((frequency_hz as u64) << 25) / XTAL_HZ) as u32;
        self.command(op::SET_RF_FREQUENCY, &word.to_be_bytes()).await?;
        self.core.config.frequency_hz = frequency_hz;
        Ok(())
    }

    async fn apply_modulation(&mut self) -> Result<(), RadioError> {
        self.core.retime();
        self.send_modulation_params().await
    }

    async fn apply_tx_power(&mut self, dbm: i8) -> Result<(), RadioError> {
        let clamp = self.read_register(reg::TX_CLAMP_CONFIG).await?;
        self.write_register(reg::TX_CLAMP_CONFIG, clamp | TX_CLAMP_MASK).await?;
        self.command(op::SET_PA_CONFIG, &PA_CONFIG_HP).await?;

        let ceiling = self
            .board
            .max_tx_power_dbm
            .map_or(TX_POWER_MAX, |max| max.min(TX_POWER_MAX));
        let level = dbm.clamp(TX_POWER_MIN, ceiling.max(TX_POWER_MIN));

        self.write_register(reg::OCP, OCP_LIMIT).await?;
        self.command(op::SET_TX_PARAMS, &[level as u8, RAMP_40_US]).await?;
        self.core.config.tx_power_dbm = level;
        Ok(())
    }

    async fn switch_antenna(&mut self, transmit: bool) -> Result<(), RadioError> {
        if self.board.rf_switch == RfSwitch::Pins {
            self.bus.set_pin(ControlPin::RxEnable, !transmit)?;
            self.bus.set_pin(ControlPin::TxEnable, transmit)?;
        }
        Ok(())
    }

    /// All flags visible in the status, only rx-done on DIO1
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

    async fn capture_signal(&mut self) -> Result<SignalSample, RadioError> {
        let mut status = [0u8; 3];
        self.command_read(op::GET_PACKET_STATUS, &mut status).await?;
        let [rssi_raw, snr_raw, _] = status;
        Ok(SignalSample {
            rssi_raw,
            snr_raw,
            rssi_dbm: -(rssi_raw as i16) / 2,
            snr_db: snr_raw as i8 as f32 * 0.25,
            frequency_error_hz: 0,
        })
    }

    /// Send the staged packet and poll for tx-done
    async fn transmit(&mut self) -> Result<(), RadioError> {
        self.core.config.payload_length = self.core.buffer.len() as u8;
        self.send_packet_params().await?;
        self.switch_antenna(true).await?;
        self.core.set_state(ModemState::Transmitting);
        self.command(op::SET_TX, &TX_NO_TIMEOUT).await?;

        let start = self.bus.now_ms();
        loop {
            if self.irq_status().await? & irq::TX_DONE != 0 {
                self.clear_irq(irq::TX_DONE).await?;
                return Ok(());
            }
            if self.bus.now_ms() - start >= timing::MODEM_TIMEOUT_MS as u64 {
                warn!("sx126x: tx-done not seen within {} ms", timing::MODEM_TIMEOUT_MS);
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
        if !status.packet_ok() {
            debug!("sx126x: crc error, packet dropped");
            self.core.buffer.reset();
            return Ok(None);
        }

        let mut rx = [0u8; 2];
        self.command_read(op::GET_RX_BUFFER_STATUS, &mut rx).await?;
        let [len, start] = rx;
        self.read_buffer(start, len as usize).await?;
        self.core.signal = self.capture_signal().await?;
        Ok(Some(self.core.deliver()))
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
        self.core.config.bandwidth_code = bw.code;
        self.core.retime();
        self.image_band = None;

        self.command(op::SET_PACKET_TYPE, &[PACKET_TYPE_LORA]).await?;
        self.set_standby().await?;

        if let Some(voltage) = self.board.tcxo {
            let [_, t2, t1, t0] = TCXO_TIMEOUT.to_be_bytes();
            self.command(op::SET_DIO3_AS_TCXO_CTRL, &[voltage.code(), t2, t1, t0])
                .await?;
        }
        if self.board.rf_switch == RfSwitch::Dio2 {
            self.command(op::SET_DIO2_AS_RF_SWITCH_CTRL, &[0x01]).await?;
        }
        self.switch_antenna(false).await?;

        let [sync_hi, sync_lo] = SYNC_WORD.to_be_bytes();
        self.write_register(reg::SYNC_WORD_MSB, sync_hi).await?;
        self.write_register(reg::SYNC_WORD_LSB, sync_lo).await?;

        self.command(op::CALIBRATE, &[CALIBRATE_ALL]).await?;
        self.apply_frequency(frequency_hz).await?;
        self.apply_tx_power(lora_defaults::TX_POWER_DBM).await?;

        self.write_register(reg::RX_GAIN, RX_GAIN_BOOSTED).await?;
        self.command(op::SET_BUFFER_BASE_ADDRESS, &[0x00, 0x00]).await?;

        self.send_modulation_params().await?;
        self.send_packet_params().await?;
        Ok(())
    }
}

impl<'a, T: Transport> Modem for Sx126x<'a, T> {
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
        info!("sx126x online at {} Hz", frequency_hz);
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

    /// The frequency word cannot be read back, so this is the cached request
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
        self.core.config.preamble_symbols = symbols;
        self.core.retime();
        self.send_packet_params().await?;
        Ok(symbols)
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
            self.write_buffer(staged.offset, &data[..staged.len]).await?;
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
        self.core.buffer.reset();
        self.core.set_state(ModemState::Standby);
        let switched = self.switch_antenna(false).await;
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
        self.switch_antenna(false).await?;
        self.command(op::SET_RX, &RX_CONTINUOUS).await?;
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

    async fn random(&mut self) -> Result<u8, RadioError> {
        if !self.core.online {
            return Ok(0);
        }
        self.read_register(reg::RANDOM_NUMBER).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::boards;
    use crate::radio::mock::{mock_transport, ChipSim, MockHandle, MockTransport};
    use std::cell::RefCell;
    use std::vec::Vec;

    struct Sx126xSim {
        regs: Vec<u8>,
        buffer: [u8; 256],
        irq: u16,
        rx_status: [u8; 2],
        packet_status: [u8; 3],
        packet_params: Vec<u8>,
        hang_tx: bool,
        stuck_busy: bool,
        tx_done_at: Option<u64>,
        transmitted: Vec<Vec<u8>>,
    }

    impl Sx126xSim {
        fn new() -> Self {
            let mut regs = vec![0u8; 0x1000];
            regs[reg::SYNC_WORD_MSB as usize] = 0x14;
            regs[reg::SYNC_WORD_LSB as usize] = 0x24;
            regs[reg::TX_CLAMP_CONFIG as usize] = 0xC8;
            Self {
                regs,
                buffer: [0; 256],
                irq: 0,
                rx_status: [0; 2],
                packet_status: [0; 3],
                packet_params: Vec::new(),
                hang_tx: false,
                stuck_busy: false,
                tx_done_at: None,
                transmitted: Vec::new(),
            }
        }

        fn inject_rx(&mut self, payload: &[u8], crc_ok: bool, packet_status: [u8; 3]) {
            let start = 0x40;
            self.buffer[start..start + payload.len()].copy_from_slice(payload);
            self.rx_status = [payload.len() as u8, start as u8];
            self.packet_status = packet_status;
            self.irq |= irq::RX_DONE | irq::HEADER_VALID | irq::PREAMBLE_DETECTED;
            if !crc_ok {
                self.irq |= irq::CRC_ERROR;
            }
        }
    }

    impl ChipSim for Sx126xSim {
        fn transfer(&mut self, now: u64, frame: &mut [u8]) {
            let addr = |f: &[u8]| u16::from_be_bytes([f[1], f[2]]) as usize;
            match frame[0] {
                op::READ_REGISTER => frame[4] = self.regs[addr(frame)],
                op::WRITE_REGISTER => {
                    let base = addr(frame);
                    for (i, v) in frame[3..].iter().enumerate() {
                        self.regs[base + i] = *v;
                    }
                }
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
                op::GET_IRQ_STATUS => {
                    frame[2..4].copy_from_slice(&self.irq.to_be_bytes());
                }
                op::CLEAR_IRQ_STATUS => self.irq &= !u16::from_be_bytes([frame[1], frame[2]]),
                op::GET_RX_BUFFER_STATUS => frame[2..4].copy_from_slice(&self.rx_status),
                op::GET_PACKET_STATUS => frame[2..5].copy_from_slice(&self.packet_status),
                op::GET_RSSI_INST => frame[2] = 0xA0,
                op::SET_PACKET_PARAMS => self.packet_params = frame[1..].to_vec(),
                op::SET_TX => {
                    let len = self.packet_params[3] as usize;
                    self.transmitted.push(self.buffer[..len].to_vec());
                    if !self.hang_tx {
                        self.tx_done_at = Some(now + 5);
                    }
                }
                _ => {}
            }
        }

        fn busy(&self, _now: u64) -> bool {
            self.stuck_busy
        }

        fn tick(&mut self, now: u64) -> bool {
            if matches!(self.tx_done_at, Some(at) if at <= now) {
                self.tx_done_at = None;
                self.irq |= irq::TX_DONE;
            }
            // DIO1 only carries rx-done
            false
        }
    }

    thread_local! {
        static RECEIVED: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    }

    fn record(packet: &[u8]) {
        RECEIVED.with(|r| r.borrow_mut().push(packet.to_vec()));
    }

    type Radio<'a> = Sx126x<'a, MockTransport<'a, Sx126xSim>>;

    fn online<'a>(irq: &'a IrqBridge, board: BoardConfig) -> (Radio<'a>, MockHandle<'a, Sx126xSim>) {
        let (transport, handle) = mock_transport(Sx126xSim::new(), Some(irq));
        let mut radio = Sx126x::new(transport, board, irq);
        futures::executor::block_on(radio.begin(868_000_000)).unwrap();
        (radio, handle)
    }

    fn opcodes(frames: &[Vec<u8>]) -> Vec<u8> {
        frames.iter().map(|f| f[0]).collect()
    }

    fn last(handle: &MockHandle<'_, Sx126xSim>, opcode: u8) -> Vec<u8> {
        handle.frames_starting(&[opcode]).pop().unwrap()
    }

    #[test]
    fn test_begin_sequence() {
        let irq = IrqBridge::new();
        let (radio, handle) = online(&irq, boards::WIO_SX1262);
        assert_eq!(radio.state(), ModemState::Standby);

        let ops = opcodes(&handle.frames());
        let expected = [
            op::SET_PACKET_TYPE,
            op::SET_STANDBY,
            op::SET_DIO3_AS_TCXO_CTRL,
            op::SET_DIO2_AS_RF_SWITCH_CTRL,
            op::CALIBRATE,
            op::CALIBRATE_IMAGE,
            op::SET_RF_FREQUENCY,
            op::SET_TX_PARAMS,
            op::SET_BUFFER_BASE_ADDRESS,
            op::SET_MODULATION_PARAMS,
            op::SET_PACKET_PARAMS,
            op::SET_DIO_IRQ_PARAMS,
        ];
        let mut remaining = ops.iter();
        for want in expected {
            assert!(remaining.any(|&o| o == want), "missing {:#04x} in order", want);
        }

        assert_eq!(last(&handle, op::SET_DIO3_AS_TCXO_CTRL), vec![0x97, 0x02, 0x00, 0x01, 0x40]);
        assert_eq!(last(&handle, op::CALIBRATE_IMAGE), vec![0x98, 0xD7, 0xDB]);
        assert_eq!(
            last(&handle, op::SET_MODULATION_PARAMS),
            vec![0x8B, 7, 0x04, 1, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            last(&handle, op::SET_PACKET_PARAMS),
            vec![0x8C, 0, 18, 0, 255, 1, 0, 0, 0, 0]
        );
        assert_eq!(handle.chip().regs[reg::RX_GAIN as usize], RX_GAIN_BOOSTED);
    }

    #[test]
    fn test_begin_fails_without_chip() {
        let irq = IrqBridge::new();
        let mut chip = Sx126xSim::new();
        chip.regs[reg::SYNC_WORD_MSB as usize] = 0;
        let (transport, handle) = mock_transport(chip, Some(&irq));
        let mut radio = Sx126x::new(transport, boards::WIO_SX1262, &irq);

        let result = futures::executor::block_on(radio.begin(868_000_000));
        assert_eq!(result, Err(RadioError::Init));
        assert!(!radio.is_online());
        assert!(handle.now() >= timing::DETECT_WINDOW_MS as u64);
    }

    #[test]
    fn test_begin_twice() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);
        futures::executor::block_on(async {
            radio.set_coding_rate4(8).await.unwrap();
            radio.begin(868_000_000).await.unwrap();
        });
        assert_eq!(radio.state(), ModemState::Standby);
        assert_eq!(radio.coding_rate4(), 5);
        assert_eq!(last(&handle, op::SET_MODULATION_PARAMS)[3], 1);
    }

    #[test]
    fn test_modulation_block_resent_whole() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);

        futures::executor::block_on(async {
            radio.set_spreading_factor(12).await.unwrap();
            assert_eq!(
                last(&handle, op::SET_MODULATION_PARAMS),
                vec![0x8B, 12, 0x04, 1, 1, 0, 0, 0, 0]
            );
            radio.set_signal_bandwidth(10_000).await.unwrap();
            assert_eq!(radio.signal_bandwidth(), 10_400);
            assert_eq!(
                last(&handle, op::SET_MODULATION_PARAMS),
                vec![0x8B, 12, 0x08, 1, 1, 0, 0, 0, 0]
            );
            radio.set_signal_bandwidth(500_000).await.unwrap();
            radio.set_spreading_factor(4).await.unwrap();
            assert_eq!(radio.spreading_factor(), 5);
            assert_eq!(
                last(&handle, op::SET_MODULATION_PARAMS),
                vec![0x8B, 5, 0x06, 1, 0, 0, 0, 0, 0]
            );
        });
    }

    #[test]
    fn test_frequency_cached_exactly() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);

        futures::executor::block_on(async {
            radio.set_frequency(915_000_000).await.unwrap();
            assert_eq!(radio.frequency().await, Ok(915_000_000));
        });
        assert_eq!(
            last(&handle, op::SET_RF_FREQUENCY),
            vec![0x86, 0x39, 0x30, 0x00, 0x00]
        );
        assert_eq!(last(&handle, op::CALIBRATE_IMAGE), vec![0x98, 0xE1, 0xE9]);

        // Same band, no second calibration
        handle.clear_frames();
        futures::executor::block_on(radio.set_frequency(916_000_000)).unwrap();
        assert!(handle.frames_starting(&[op::CALIBRATE_IMAGE]).is_empty());
    }

    #[test]
    fn test_tx_power_errata_and_clamp() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);

        handle.clear_frames();
        futures::executor::block_on(radio.set_tx_power(30)).unwrap();
        assert_eq!(
            handle.frames(),
            vec![
                vec![0x1D, 0x08, 0xD8, 0x00, 0x00],
                vec![0x0D, 0x08, 0xD8, 0xDE],
                vec![0x95, 0x04, 0x07, 0x00, 0x01],
                vec![0x0D, 0x08, 0xE7, 0x38],
                vec![0x8E, 22, 0x02],
            ]
        );
        assert_eq!(radio.tx_power(), 22);

        futures::executor::block_on(radio.set_tx_power(-20)).unwrap();
        assert_eq!(radio.tx_power(), -9);
        assert_eq!(last(&handle, op::SET_TX_PARAMS), vec![0x8E, 0xF7, 0x02]);

        let irq = IrqBridge::new();
        let (mut radio, _handle) = online(&irq, boards::SX1268_RXEN_TXEN);
        futures::executor::block_on(radio.set_tx_power(22)).unwrap();
        assert_eq!(radio.tx_power(), 20);
    }

    #[test]
    fn test_write_truncates_and_tracks_offsets() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);

        futures::executor::block_on(async {
            radio.begin_packet(false).await.unwrap();
            assert_eq!(radio.write(&[1; 200]).await, Ok(200));
            assert_eq!(radio.write(&[2; 100]).await, Ok(55));
            assert_eq!(radio.write(&[3; 4]).await, Ok(0));
        });

        let writes = handle.frames_starting(&[op::WRITE_BUFFER]);
        assert_eq!(writes.len(), 2);
        assert_eq!((writes[0][1], writes[0].len() - 2), (0, 200));
        assert_eq!((writes[1][1], writes[1].len() - 2), (200, 55));
    }

    #[test]
    fn test_transmit() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1268_RXEN_TXEN);

        handle.clear_pins();
        futures::executor::block_on(async {
            radio.begin_packet(false).await.unwrap();
            radio.write(b"hello").await.unwrap();
            radio.end_packet().await.unwrap();
        });

        assert_eq!(radio.state(), ModemState::Standby);
        assert_eq!(handle.chip().transmitted, vec![b"hello".to_vec()]);
        assert_eq!(last(&handle, op::SET_PACKET_PARAMS)[4], 5);
        assert_eq!(last(&handle, op::CLEAR_IRQ_STATUS), vec![0x02, 0x00, 0x01]);
        assert_eq!(handle.chip().irq & irq::TX_DONE, 0);
        assert_eq!(
            handle.pin_history(),
            vec![
                (ControlPin::RxEnable, false),
                (ControlPin::TxEnable, true),
                (ControlPin::RxEnable, true),
                (ControlPin::TxEnable, false),
            ]
        );
    }

    #[test]
    fn test_transmit_timeout_forces_standby() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);
        handle.chip().hang_tx = true;

        futures::executor::block_on(async {
            radio.begin_packet(false).await.unwrap();
            radio.write(b"x").await.unwrap();
            handle.clear_frames();
            assert_eq!(radio.end_packet().await, Err(RadioError::TxTimeout));
        });

        assert_eq!(radio.state(), ModemState::Standby);
        assert_eq!(last(&handle, op::SET_STANDBY), vec![0x80, 0x01]);
    }

    #[test]
    fn test_receive_skips_crc_errors() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);

        futures::executor::block_on(async {
            radio.on_receive(Some(record)).await.unwrap();
            assert!(irq.is_enabled());
            radio.receive(0).await.unwrap();
            assert_eq!(last(&handle, op::SET_RX), vec![0x82, 0xFF, 0xFF, 0xFF]);

            handle.chip().inject_rx(b"bad", false, [0xB4, 0x1C, 0xB0]);
            irq.raise();
            assert_eq!(radio.poll().await, Ok(None));
            assert_eq!(radio.available(), 0);

            handle.chip().inject_rx(b"good", true, [0xB4, 0x1C, 0xB0]);
            irq.raise();
            assert_eq!(radio.poll().await, Ok(Some(4)));
        });

        assert_eq!(RECEIVED.with(|r| r.borrow().clone()), vec![b"good".to_vec()]);
        assert_eq!(radio.available(), 4);
        assert_eq!(radio.read(), Some(b'g'));
        assert_eq!(radio.packet_rssi(), -90);
        assert_eq!(radio.packet_snr(), 7.0);
        assert_eq!(radio.packet_frequency_error(), 0);
        assert_eq!(handle.chip().irq, 0);
    }

    #[test]
    fn test_implicit_receive() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);
        futures::executor::block_on(radio.receive(12)).unwrap();
        assert_eq!(
            last(&handle, op::SET_PACKET_PARAMS),
            vec![0x8C, 0, 18, 1, 12, 1, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_false_preamble_expires() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);

        futures::executor::block_on(async {
            radio.receive(0).await.unwrap();
            assert_eq!(radio.carrier_detected().await, Ok(false));

            handle.chip().irq |= irq::PREAMBLE_DETECTED;
            assert_eq!(radio.carrier_detected().await, Ok(true));

            handle.advance(radio.timing().preamble_window_ms() as u64 + 1);
            assert_eq!(radio.carrier_detected().await, Ok(false));
            assert_eq!(radio.false_preambles(), 1);
            assert_eq!(handle.chip().irq & irq::PREAMBLE_DETECTED, 0);

            handle.chip().irq |= irq::HEADER_VALID;
            assert_eq!(radio.carrier_detected().await, Ok(true));
        });
    }

    #[test]
    fn test_header_keeps_carrier_past_preamble_window() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);

        futures::executor::block_on(async {
            radio.set_spreading_factor(12).await.unwrap();
            radio.receive(0).await.unwrap();

            handle.chip().irq |= irq::PREAMBLE_DETECTED;
            assert_eq!(radio.carrier_detected().await, Ok(true));
            handle.chip().irq |= irq::HEADER_VALID;

            handle.advance(radio.timing().preamble_window_ms() as u64 + 1);
            assert_eq!(radio.carrier_detected().await, Ok(true));
            assert_eq!(handle.chip().irq, irq::HEADER_VALID);

            // Payload still arriving, no rx-done yet
            handle.advance(5);
            assert_eq!(radio.carrier_detected().await, Ok(true));
        });
        assert_eq!(radio.false_preambles(), 0);
    }

    #[test]
    fn test_packet_waiting_before_transmit_is_delivered() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);

        futures::executor::block_on(async {
            radio.on_receive(Some(record)).await.unwrap();
            radio.receive(0).await.unwrap();
            handle.chip().inject_rx(b"early", true, [0xB4, 0x1C, 0xB0]);
            irq.raise();

            radio.begin_packet(false).await.unwrap();
            radio.write(b"reply").await.unwrap();
            radio.end_packet().await.unwrap();
            assert_eq!(radio.poll().await, Ok(None));

            radio.receive(0).await.unwrap();
            handle.chip().inject_rx(b"later", true, [0xB4, 0x1C, 0xB0]);
            irq.raise();
            assert_eq!(radio.poll().await, Ok(Some(5)));
        });

        assert_eq!(
            RECEIVED.with(|r| r.borrow().clone()),
            vec![b"early".to_vec(), b"later".to_vec()]
        );
        assert_eq!(handle.chip().transmitted, vec![b"reply".to_vec()]);
        assert_eq!(handle.chip().irq, 0);
    }

    #[test]
    fn test_transmit_bus_error_still_returns_to_standby() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::SX1268_RXEN_TXEN);

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
            vec![(ControlPin::RxEnable, true), (ControlPin::TxEnable, false)]
        );
    }

    #[test]
    fn test_stuck_busy_is_counted() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);
        assert_eq!(radio.busy_timeouts(), 0);

        handle.chip().stuck_busy = true;
        let before = handle.now();
        futures::executor::block_on(radio.disable_crc()).unwrap();

        assert_eq!(radio.busy_timeouts(), 1);
        assert!(handle.now() - before >= timing::BUSY_TIMEOUT_MS as u64);
        // The command still went out
        assert_eq!(last(&handle, op::SET_PACKET_PARAMS)[5], 0);
    }

    #[test]
    fn test_rssi_and_random() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);
        handle.chip().regs[reg::RANDOM_NUMBER as usize] = 0x5A;

        futures::executor::block_on(async {
            assert_eq!(radio.current_rssi_raw().await, Ok(0xA0));
            assert_eq!(radio.current_rssi().await, Ok(-80));
            assert_eq!(radio.random().await, Ok(0x5A));
        });
    }

    #[test]
    fn test_end_sleeps_and_releases() {
        let irq = IrqBridge::new();
        let (mut radio, handle) = online(&irq, boards::WIO_SX1262);
        futures::executor::block_on(async {
            radio.on_receive(Some(record)).await.unwrap();
            radio.end().await;
            assert_eq!(radio.receive(0).await, Err(RadioError::Offline));
        });
        assert!(!irq.is_enabled());
        assert!(handle.released());
        assert_eq!(radio.state(), ModemState::Uninitialized);
        assert_eq!(last(&handle, op::SET_SLEEP), vec![0x84, 0x00]);
    }
}
