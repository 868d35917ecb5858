//! LR1110/LR1120/LR1121 backend
//!
//! Commands carry a 16-bit opcode. Anything that returns data does so in a
//! second chip-select window once the busy line drops, and every byte stream
//! the chip sends back opens with stat1. While a command is being clocked in
//! the chip shifts out stat1, stat2 and the low IRQ status word, which is how
//! the IRQ status is read here.
//!
//! TX completion is interrupt driven: DIO carries tx-done as well as
//! rx-done, and `end_packet` waits on the bridge rather than polling SPI.

use crate::config::{lora_defaults, timing, BoardConfig, RfSwitch};
use crate::radio::bus::{Bus, Transport};
use crate::radio::irq::{IrqBridge, IrqStatus};
use crate::radio::modulation::{quantize_preamble_u16, select_bandwidth, Bandwidth};
use crate::radio::shared::{modem_accessors, ModemCore};
use crate::radio::traits::{Modem, ModemState, RadioConfig, RadioError, ReceiveHandler, SignalSample};
use log::{debug, info, warn};

mod op {
    pub const GET_STATUS: u16 = 0x0100;
    pub const GET_VERSION: u16 = 0x0101;
    pub const WRITE_BUFFER8: u16 = 0x0109;
    pub const READ_BUFFER8: u16 = 0x010A;
    pub const GET_ERRORS: u16 = 0x010D;
    pub const CLEAR_ERRORS: u16 = 0x010E;
    pub const CALIBRATE: u16 = 0x010F;
    pub const SET_REG_MODE: u16 = 0x0110;
    pub const CALIB_IMAGE: u16 = 0x0111;
    pub const SET_DIO_AS_RF_SWITCH: u16 = 0x0112;
    pub const SET_DIO_IRQ_PARAMS: u16 = 0x0113;
    pub const CLEAR_IRQ: u16 = 0x0114;
    pub const SET_TCXO_MODE: u16 = 0x0117;
    pub const SET_SLEEP: u16 = 0x011B;
    pub const SET_STANDBY: u16 = 0x011C;
    pub const GET_RANDOM_NUMBER: u16 = 0x0120;
    pub const GET_RX_BUFFER_STATUS: u16 = 0x0203;
    pub const GET_PACKET_STATUS: u16 = 0x0204;
    pub const GET_RSSI_INST: u16 = 0x0205;
    pub const SET_RX: u16 = 0x0209;
    pub const SET_TX: u16 = 0x020A;
    pub const SET_RF_FREQUENCY: u16 = 0x020B;
    pub const SET_PACKET_TYPE: u16 = 0x020E;
    pub const SET_MODULATION_PARAMS: u16 = 0x020F;
    pub const SET_PACKET_PARAMS: u16 = 0x0210;
    pub const SET_TX_PARAMS: u16 = 0x0211;
    pub const SET_PA_CONFIG: u16 = 0x0215;
    pub const SET_RX_BOOSTED: u16 = 0x0227;
    pub const SET_RSSI_CALIBRATION: u16 = 0x0229;
    pub const SET_LORA_SYNC_WORD: u16 = 0x022B;
}

mod irq {
    pub const TX_DONE: u32 = 1 << 2;
    pub const RX_DONE: u32 = 1 << 3;
    pub const PREAMBLE_DETECTED: u32 = 1 << 4;
    pub const HEADER_VALID: u32 = 1 << 5;
    pub const HEADER_ERROR: u32 = 1 << 6;
    pub const CRC_ERROR: u32 = 1 << 7;
}

const IRQ_MAP: [(u32, IrqStatus); 6] = [
    (irq::TX_DONE, IrqStatus::TX_DONE),
    (irq::RX_DONE, IrqStatus::RX_DONE),
    (irq::PREAMBLE_DETECTED, IrqStatus::PREAMBLE),
    (irq::HEADER_VALID, IrqStatus::HEADER_VALID),
    (irq::HEADER_ERROR, IrqStatus::HEADER_ERROR),
    (irq::CRC_ERROR, IrqStatus::CRC_ERROR),
];

const PACKET_TYPE_LORA: u8 = 0x02;
const STANDBY_RC: u8 = 0x00;
const STANDBY_XOSC: u8 = 0x01;
const SLEEP_RETAIN_CONFIG: u8 = 0x01;
const REG_MODE_LDO: u8 = 0x00;
const CALIBRATE_ALL: u8 = 0x3F;
const SYNC_WORD: u8 = 0x12;
/// 0xA4 steps of 30.52 us, about 5 ms
const TCXO_STARTUP: [u8; 3] = [0x00, 0x00, 0xA4];
const RAMP_48_US: u8 = 0x02;
const RX_CONTINUOUS: [u8; 3] = [0xFF, 0xFF, 0xFF];
const TX_NO_TIMEOUT: [u8; 3] = [0x00, 0x00, 0x00];

/// Gain offsets for the 600 MHz to 2 GHz range
const RSSI_CALIBRATION: [u8; 11] = [
    0x22, 0x32, 0x43, 0x45, 0x64, 0x55, 0x66, 0x76, 0x06, 0x00, 0x00,
];

/// Sub-GHz range the LoRa front end accepts
const FREQUENCY_MIN_HZ: u32 = 400_000_000;
const FREQUENCY_MAX_HZ: u32 = 930_000_000;

const POWER_MIN_DBM: i8 = -17;
const POWER_MAX_DBM: i8 = 22;

const BANDWIDTHS: [Bandwidth; 4] = [
    Bandwidth { hz: 62_500, code: 0x03 },
    Bandwidth { hz: 125_000, code: 0x04 },
    Bandwidth { hz: 250_000, code: 0x05 },
    Bandwidth { hz: 500_000, code: 0x06 },
];

/// Image calibration frequencies per band, in 4 MHz steps
const IMAGE_BANDS: [(u32, u32, [u8; 2]); 5] = [
    (430_000_000, 440_000_000, [0x6B, 0x6E]),
    (470_000_000, 510_000_000, [0x75, 0x81]),
    (779_000_000, 787_000_000, [0xC1, 0xC5]),
    (863_000_000, 870_000_000, [0xD7, 0xDB]),
    (902_000_000, 928_000_000, [0xE1, 0xE9]),
];

const MAX_COMMAND: usize = 16;
/// stat1, stat2 and the low IRQ status word
const ECHO_LEN: usize = 6;

/// Result of the previous command, from stat1 bits 3:1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Fail,
    ParameterError,
    Ok,
    /// Command is returning data, so no IRQ status follows
    Data,
}

/// Operating mode from stat2 bits 3:1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipMode {
    Sleep,
    StandbyRc,
    StandbyXosc,
    Fs,
    Rx,
    Tx,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipStatus {
    pub command: CommandStatus,
    pub irq_pending: bool,
    pub mode: ChipMode,
    /// Cause of the last reset, cleared by GetStatus
    pub reset_source: u8,
}

impl ChipStatus {
    pub fn decode(stat1: u8, stat2: u8) -> Self {
        let command = match (stat1 >> 1) & 0x07 {
            1 => CommandStatus::ParameterError,
            2 => CommandStatus::Ok,
            3 => CommandStatus::Data,
            _ => CommandStatus::Fail,
        };
        let mode = match (stat2 >> 1) & 0x07 {
            0 => ChipMode::Sleep,
            1 => ChipMode::StandbyRc,
            2 => ChipMode::StandbyXosc,
            3 => ChipMode::Fs,
            4 => ChipMode::Rx,
            5 => ChipMode::Tx,
            other => ChipMode::Other(other),
        };
        Self {
            command,
            irq_pending: stat1 & 0x01 != 0,
            mode,
            reset_source: stat2 >> 4,
        }
    }
}

/// Bytes the chip shifted out while a command was shifted in
#[derive(Debug, Clone, Copy, Default)]
struct Echo([u8; ECHO_LEN]);

impl Echo {
    fn status(&self) -> ChipStatus {
        ChipStatus::decode(self.0[0], self.0[1])
    }

    fn stat2(&self) -> u8 {
        self.0[1]
    }

    fn irq(&self) -> u32 {
        u32::from_be_bytes([self.0[2], self.0[3], self.0[4], self.0[5]])
    }
}

fn chip_name(use_case: u8) -> Option<&'static str> {
    match use_case {
        0x01 => Some("LR1110"),
        0x02 => Some("LR1120"),
        0x03 => Some("LR1121"),
        _ => None,
    }
}

/// `SetPaConfig` parameters `[pa_sel, reg_pa_supply, duty_cycle, hp_sel]`
///
/// The high power PA takes over above 15 dBm.
fn pa_config(level: i8) -> [u8; 4] {
    match level {
        22..=i8::MAX => [1, 1, 4, 7],
        20..=21 => [1, 1, 2, 7],
        17..=19 => [1, 1, 4, 3],
        16 => [1, 1, 2, 2],
        15 => [0, 0, 7, 0],
        14 => [0, 0, 4, 0],
        _ => [0, 0, 0, 0],
    }
}

/// Preamble length actually programmed for a requested `symbols`
fn achieved_preamble(symbols: u16) -> u16 {
    quantize_preamble_u16(symbols).symbols() as u16
}

fn image_band(frequency_hz: u32) -> Option<[u8; 2]> {
    IMAGE_BANDS
        .iter()
        .find(|(low, high, _)| (*low..=*high).contains(&frequency_hz))
        .map(|(_, _, band)| *band)
}

/// LR1110 / LR1120 / LR1121 driver
pub struct Lr11xx<'a, T> {
    bus: Bus<T>,
    irq: &'a IrqBridge,
    board: BoardConfig,
    core: ModemCore,
    image_band: Option<[u8; 2]>,
    last_opcode: u16,
}

impl<'a, T: Transport> Lr11xx<'a, T> {
    pub fn new(transport: T, board: BoardConfig, irq: &'a IrqBridge) -> Self {
        Self {
            bus: Bus::new(transport, timing::BUSY_TIMEOUT_LR11XX_MS),
            irq,
            board,
            core: ModemCore::new(),
            image_band: None,
            last_opcode: op::GET_STATUS,
        }
    }

    /// Send one command, returning what the chip shifted out meanwhile
    ///
    /// stat1 in the echo reports on the command sent before this one.
    async fn command(&mut self, opcode: u16, params: &[u8]) -> Result<Echo, RadioError> {
        let mut frame = [0u8; MAX_COMMAND];
        let len = 2 + params.len();
        frame[..2].copy_from_slice(&opcode.to_be_bytes());
        frame[2..len].copy_from_slice(params);
        self.bus.exchange(&mut frame[..len]).await?;

        let mut echo = Echo::default();
        let n = len.min(ECHO_LEN);
        echo.0[..n].copy_from_slice(&frame[..n]);
        if echo.status().command == CommandStatus::Fail {
            warn!("lr11xx: command {:#06x} failed", self.last_opcode);
        }
        self.last_opcode = opcode;
        Ok(echo)
    }

    /// Send a command and collect `out.len()` response bytes after stat1
    async fn command_read(
        &mut self,
        opcode: u16,
        params: &[u8],
        out: &mut [u8],
    ) -> Result<Echo, RadioError> {
        let echo = self.command(opcode, params).await?;
        let mut frame = [0u8; 1 + lora_defaults::MAX_PAYLOAD];
        let len = 1 + out.len();
        self.bus.exchange(&mut frame[..len]).await?;
        out.copy_from_slice(&frame[1..len]);
        Ok(echo)
    }

    /// Read the IRQ status through a ClearIrq that clears nothing
    async fn irq_status(&mut self) -> Result<u32, RadioError> {
        let mut echo = self.command(op::CLEAR_IRQ, &[0; 4]).await?;
        if echo.status().command == CommandStatus::Data {
            echo = self.command(op::CLEAR_IRQ, &[0; 4]).await?;
        }
        Ok(echo.irq())
    }

    async fn clear_irq(&mut self, mask: u32) -> Result<(), RadioError> {
        self.command(op::CLEAR_IRQ, &mask.to_be_bytes()).await?;
        Ok(())
    }

    async fn detect(&mut self) -> Result<(), RadioError> {
        let start = self.bus.now_ms();
        loop {
            let mut version = [0u8; 4];
            self.command_read(op::GET_VERSION, &[], &mut version).await?;
            let [hardware, use_case, fw_major, fw_minor] = version;
            if let Some(name) = chip_name(use_case) {
                info!(
                    "{} hw {:#04x} firmware {}.{}",
                    name, hardware, fw_major, fw_minor
                );
                return Ok(());
            }
            if self.bus.now_ms() - start >= timing::DETECT_WINDOW_MS as u64 {
                warn!("lr11xx not found, use case reads {:#04x}", use_case);
                return Err(RadioError::Init);
            }
            self.bus.delay_ms(timing::DETECT_RETRY_MS).await;
        }
    }

    async fn check_errors(&mut self) -> Result<(), RadioError> {
        let mut errors = [0u8; 2];
        self.command_read(op::GET_ERRORS, &[], &mut errors).await?;
        let errors = u16::from_be_bytes(errors);
        if errors != 0 {
            warn!("lr11xx: error flags {:#06x}", errors);
            self.command(op::CLEAR_ERRORS, &[]).await?;
        }
        Ok(())
    }

    async fn set_standby(&mut self) -> Result<(), RadioError> {
        let mode = if self.board.tcxo.is_some() {
            STANDBY_XOSC
        } else {
            STANDBY_RC
        };
        self.command(op::SET_STANDBY, &[mode]).await?;
        Ok(())
    }

    async fn send_modulation_params(&mut self) -> Result<(), RadioError> {
        let c = &self.core.config;
        let block = [
            c.spreading_factor,
            c.bandwidth_code,
            c.coding_rate - 4,
            self.core.timing.low_data_rate as u8,
        ];
        self.command(op::SET_MODULATION_PARAMS, &block).await?;
        Ok(())
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
            0x00,
        ];
        self.command(op::SET_PACKET_PARAMS, &block).await?;
        Ok(())
    }

    async fn apply_modulation(&mut self) -> Result<(), RadioError> {
        self.core.retime();
        self.send_modulation_params().await
    }

    /// Out-of-range requests are remembered but never reach the chip
    async fn apply_frequency(&mut self, frequency_hz: u32) -> Result<(), RadioError> {
        self.core.config.frequency_hz = frequency_hz;
        if !(FREQUENCY_MIN_HZ..=FREQUENCY_MAX_HZ).contains(&frequency_hz) {
            warn!("lr11xx: {} Hz out of range, not set", frequency_hz);
            return Ok(());
        }
        self.command(op::SET_RF_FREQUENCY, &frequency_hz.to_be_bytes())
            .await?;

        match image_band(frequency_hz) {
            Some(band) if self.image_band != Some(band) => {
                self.command(op::CALIB_IMAGE, &band).await?;
                self.image_band = Some(band);
            }
            Some(_) => {}
            None => debug!("lr11xx: no image calibration for {} Hz", frequency_hz),
        }
        Ok(())
    }

    async fn apply_tx_power(&mut self, dbm: i8) -> Result<(), RadioError> {
        let max = self
            .board
            .max_tx_power_dbm
            .map_or(POWER_MAX_DBM, |cap| cap.min(POWER_MAX_DBM));
        let level = dbm.clamp(POWER_MIN_DBM, max.max(POWER_MIN_DBM));

        self.command(op::SET_PA_CONFIG, &pa_config(level)).await?;
        self.command(op::SET_TX_PARAMS, &[level as u8, RAMP_48_US])
            .await?;
        self.command(op::SET_RX_BOOSTED, &[0x01]).await?;
        self.core.config.tx_power_dbm = level;
        Ok(())
    }

    async fn route_irq(&mut self) -> Result<(), RadioError> {
        let [.., dio] = (irq::TX_DONE | irq::RX_DONE).to_be_bytes();
        self.command(op::SET_DIO_IRQ_PARAMS, &[0, 0, 0, dio, 0, 0, 0, 0])
            .await?;
        self.irq
            .set_enabled(self.core.online && self.core.handler.is_some());
        Ok(())
    }

    /// Payload length and start offset of the last received packet
    ///
    /// `None` when the chip rejected the request.
    async fn rx_buffer_status(&mut self) -> Result<Option<(u8, u8)>, RadioError> {
        let mut out = [0u8; 2];
        let echo = self
            .command_read(op::GET_RX_BUFFER_STATUS, &[], &mut out)
            .await?;
        let len = match echo.status().command {
            CommandStatus::Data => echo.stat2(),
            CommandStatus::Ok => out[0],
            CommandStatus::Fail | CommandStatus::ParameterError => return Ok(None),
        };
        Ok(Some((len, out[1])))
    }

    async fn capture_signal(&mut self) -> Result<SignalSample, RadioError> {
        let mut status = [0u8; 3];
        self.command_read(op::GET_PACKET_STATUS, &[], &mut status)
            .await?;
        let [rssi_raw, snr_raw, _] = status;
        Ok(SignalSample {
            rssi_raw,
            snr_raw,
            rssi_dbm: -(rssi_raw as i16) / 2,
            snr_db: ((snr_raw as i8 as i16 + 2) >> 2) as f32,
            frequency_error_hz: 0,
        })
    }

    /// Send the staged packet and wait for the tx-done edge
    ///
    /// Returns whether an rx-done shared an edge with the transmission, so
    /// the caller can hand it back to `poll`.
    async fn transmit(&mut self) -> Result<bool, RadioError> {
        let len = self.core.buffer.len();
        self.core.config.payload_length = len as u8;
        self.send_packet_params().await?;

        let mut frame = [0u8; 2 + lora_defaults::MAX_PAYLOAD];
        frame[..2].copy_from_slice(&op::WRITE_BUFFER8.to_be_bytes());
        frame[2..2 + len].copy_from_slice(self.core.buffer.as_slice());
        self.bus.exchange(&mut frame[..2 + len]).await?;

        // tx-done arrives on the DIO line even with no receive handler
        self.irq.set_enabled(true);
        self.core.set_state(ModemState::Transmitting);
        self.command(op::SET_TX, &TX_NO_TIMEOUT).await?;

        let start = self.bus.now_ms();
        let mut deferred = false;
        loop {
            if self.irq.take() {
                let raw = self.irq_status().await?;
                deferred |= raw & irq::RX_DONE != 0;
                if raw & irq::TX_DONE != 0 {
                    self.clear_irq(irq::TX_DONE).await?;
                    return Ok(deferred);
                }
            }
            if self.bus.now_ms() - start >= timing::MODEM_TIMEOUT_MS as u64 {
                warn!(
                    "lr11xx: tx-done not seen within {} ms",
                    timing::MODEM_TIMEOUT_MS
                );
                return Err(RadioError::TxTimeout);
            }
            self.bus.delay_ms(timing::TX_POLL_MS).await;
        }
    }

    async fn handle_irq(&mut self) -> Result<Option<usize>, RadioError> {
        let raw = self.irq_status().await?;
        if raw != 0 {
            self.clear_irq(raw).await?;
        }
        let status = IrqStatus::from_raw(raw, &IRQ_MAP);

        if !status.contains(IrqStatus::RX_DONE) {
            return Ok(None);
        }
        self.core.carrier.reset();

        if !status.packet_ok() {
            debug!("lr11xx: crc error, packet dropped");
            self.core.buffer.reset();
            return Ok(None);
        }

        let (len, start) = match self.rx_buffer_status().await? {
            Some((len, start)) if len > 0 => (len, start),
            _ => {
                debug!("lr11xx: no rx buffer status, packet dropped");
                self.core.buffer.reset();
                return Ok(None);
            }
        };
        let mut packet = [0u8; lora_defaults::MAX_PAYLOAD];
        let packet = &mut packet[..len as usize];
        self.command_read(op::READ_BUFFER8, &[start, len], packet)
            .await?;
        self.core.buffer.load(packet);
        self.core.signal = self.capture_signal().await?;
        Ok(Some(self.core.deliver()))
    }

    async fn init(&mut self, frequency_hz: u32) -> Result<(), RadioError> {
        self.bus.reset().await?;
        let echo = self.command(op::GET_STATUS, &[0; 4]).await?;
        debug!("lr11xx reset source {}", echo.status().reset_source);
        self.detect().await?;

        self.core.config = RadioConfig {
            frequency_hz,
            payload_length: lora_defaults::MAX_PAYLOAD as u8,
            ..RadioConfig::default()
        };
        let bw = select_bandwidth(&BANDWIDTHS, self.core.config.bandwidth_hz);
        self.core.config.bandwidth_hz = bw.hz;
        self.core.config.bandwidth_code = bw.code;
        self.core.config.preamble_symbols = achieved_preamble(self.core.config.preamble_symbols);
        self.core.retime();
        self.image_band = None;

        if let Some(tcxo) = self.board.tcxo {
            let [t0, t1, t2] = TCXO_STARTUP;
            self.command(op::SET_TCXO_MODE, &[tcxo.code(), t0, t1, t2])
                .await?;
        }
        self.command(op::SET_REG_MODE, &[REG_MODE_LDO]).await?;
        if let RfSwitch::DioTable(table) = self.board.rf_switch {
            self.command(op::SET_DIO_AS_RF_SWITCH, &table.to_bytes())
                .await?;
        }
        self.command(op::SET_LORA_SYNC_WORD, &[SYNC_WORD]).await?;
        self.command(op::SET_RSSI_CALIBRATION, &RSSI_CALIBRATION)
            .await?;
        self.command(op::SET_PACKET_TYPE, &[PACKET_TYPE_LORA]).await?;
        self.set_standby().await?;
        self.command(op::CALIBRATE, &[CALIBRATE_ALL]).await?;
        self.apply_frequency(frequency_hz).await?;
        self.check_errors().await?;
        self.apply_tx_power(lora_defaults::TX_POWER_DBM).await?;
        self.send_modulation_params().await?;
        self.send_packet_params().await?;
        Ok(())
    }
}

impl<'a, T: Transport> Modem for Lr11xx<'a, T> {
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
        info!("lr11xx online at {} Hz", frequency_hz);
        Ok(())
    }

    async fn end(&mut self) {
        self.irq.set_enabled(false);
        if self.core.online {
            let _ = self
                .command(op::SET_SLEEP, &[SLEEP_RETAIN_CONFIG, 0, 0, 0, 0])
                .await;
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
        let achieved = achieved_preamble(symbols);
        self.core.config.preamble_symbols = achieved;
        self.core.retime();
        self.send_packet_params().await?;
        Ok(achieved)
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
            self.irq.take();
            self.handle_irq().await?;
        }
        self.core.config.implicit_header = implicit_header;
        self.core.config.payload_length = 0;
        self.core.buffer.reset();
        Ok(())
    }

    /// Stages bytes locally; the whole packet goes out in `end_packet`
    async fn write(&mut self, data: &[u8]) -> Result<usize, RadioError> {
        if !self.core.online {
            return Err(RadioError::Offline);
        }
        Ok(self.core.buffer.stage(data).len)
    }

    async fn end_packet(&mut self) -> Result<(), RadioError> {
        if !self.core.online {
            return Err(RadioError::Offline);
        }

        let outcome = self.transmit().await;
        if outcome.is_err() {
            let _ = self.set_standby().await;
        }
        self.irq.set_enabled(self.core.handler.is_some());
        self.core.buffer.reset();
        self.core.set_state(ModemState::Standby);
        if outcome? {
            self.irq.raise();
        }
        Ok(())
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
        self.command(op::SET_RX, &RX_CONTINUOUS).await?;
        self.core.set_state(ModemState::Receiving);
        Ok(())
    }

    async fn carrier_detected(&mut self) -> Result<bool, RadioError> {
        if !self.core.online {
            return Ok(false);
        }
        let raw = self.irq_status().await?;
        let status = IrqStatus::from_raw(raw, &IRQ_MAP);
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
        self.command_read(op::GET_RSSI_INST, &[], &mut rssi).await?;
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
        self.command(op::SET_SLEEP, &[SLEEP_RETAIN_CONFIG, 0, 0, 0, 0])
            .await?;
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
        let mut number = [0u8; 4];
        self.command_read(op::GET_RANDOM_NUMBER, &[], &mut number)
            .await?;
        Ok(number.iter().fold(0, |acc, b| acc ^ b))
    }
}
