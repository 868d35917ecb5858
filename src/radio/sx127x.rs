//! SX1276/SX1278 LoRa backend
//!
//! Register-mapped modem: every access is one address byte carrying the
//! read/write bit followed by one value byte, each in its own chip-select
//! window. The chip has no busy line.

use crate::config::{lora_defaults, timing, BoardConfig, PaOutput};
use crate::radio::bus::{Bus, Transport};
use crate::radio::irq::{IrqBridge, IrqStatus};
use crate::radio::modulation::{select_bandwidth, Bandwidth};
use crate::radio::shared::{modem_accessors, ModemCore};
use crate::radio::traits::{Modem, ModemState, RadioConfig, RadioError, ReceiveHandler, SignalSample};
use log::{debug, info, warn};

/// Register addresses
mod reg {
    pub const FIFO: u8 = 0x00;
    pub const OP_MODE: u8 = 0x01;
    pub const FRF_MSB: u8 = 0x06;
    pub const FRF_MID: u8 = 0x07;
    pub const FRF_LSB: u8 = 0x08;
    pub const PA_CONFIG: u8 = 0x09;
    pub const LNA: u8 = 0x0C;
    pub const FIFO_ADDR_PTR: u8 = 0x0D;
    pub const FIFO_TX_BASE_ADDR: u8 = 0x0E;
    pub const FIFO_RX_BASE_ADDR: u8 = 0x0F;
    pub const FIFO_RX_CURRENT_ADDR: u8 = 0x10;
    pub const IRQ_FLAGS: u8 = 0x12;
    pub const RX_NB_BYTES: u8 = 0x13;
    pub const MODEM_STAT: u8 = 0x18;
    pub const PKT_SNR_VALUE: u8 = 0x19;
    pub const PKT_RSSI_VALUE: u8 = 0x1A;
    pub const RSSI_VALUE: u8 = 0x1B;
    pub const MODEM_CONFIG_1: u8 = 0x1D;
    pub const MODEM_CONFIG_2: u8 = 0x1E;
    pub const PREAMBLE_MSB: u8 = 0x20;
    pub const PREAMBLE_LSB: u8 = 0x21;
    pub const PAYLOAD_LENGTH: u8 = 0x22;
    pub const MODEM_CONFIG_3: u8 = 0x26;
    pub const FREQ_ERROR_MSB: u8 = 0x28;
    pub const FREQ_ERROR_MID: u8 = 0x29;
    pub const FREQ_ERROR_LSB: u8 = 0x2A;
    pub const RSSI_WIDEBAND: u8 = 0x2C;
    pub const DETECTION_OPTIMIZE: u8 = 0x31;
    pub const HIGH_BW_OPTIMIZE_1: u8 = 0x36;
    pub const DETECTION_THRESHOLD: u8 = 0x37;
    pub const SYNC_WORD: u8 = 0x39;
    pub const HIGH_BW_OPTIMIZE_2: u8 = 0x3A;
    pub const DIO_MAPPING_1: u8 = 0x40;
    pub const VERSION: u8 = 0x42;
    pub const TCXO: u8 = 0x4B;
    pub const PA_DAC: u8 = 0x4D;
}

/// OP_MODE values, always combined with LONG_RANGE
mod mode {
    pub const LONG_RANGE: u8 = 0x80;
    pub const SLEEP: u8 = 0x00;
    pub const STDBY: u8 = 0x01;
    pub const TX: u8 = 0x03;
    pub const RX_CONTINUOUS: u8 = 0x05;
}

/// IRQ_FLAGS bits
mod irq {
    pub const HEADER_VALID: u8 = 0x10;
    pub const CRC_ERROR: u8 = 0x20;
    pub const RX_DONE: u8 = 0x40;
    pub const TX_DONE: u8 = 0x08;
}

const IRQ_MAP: [(u32, IrqStatus); 4] = [
    (irq::TX_DONE as u32, IrqStatus::TX_DONE),
    (irq::RX_DONE as u32, IrqStatus::RX_DONE),
    (irq::CRC_ERROR as u32, IrqStatus::CRC_ERROR),
    (irq::HEADER_VALID as u32, IrqStatus::HEADER_VALID),
];

/// MODEM_STAT bits
mod modem_stat {
    pub const SIGNAL_DETECTED: u8 = 0x01;
    pub const SIGNAL_SYNCED: u8 = 0x02;
}

const CHIP_VERSION: u8 = 0x12;
const SYNC_WORD: u8 = 0x12;
const XTAL_HZ: u64 = 32_000_000;

/// RSSI offsets for the HF and LF ports
const RSSI_OFFSET_HF: i16 = 157;
const RSSI_OFFSET_LF: i16 = 164;
const LF_PORT_MAX_HZ: u32 = 820_000_000;

const MC1_IMPLICIT_HEADER: u8 = 0x01;
const MC2_CRC_ON: u8 = 0x04;
const MC3_AGC_AUTO: u8 = 0x04;
const MC3_LOW_DATA_RATE: u8 = 0x08;
const TCXO_INPUT_ON: u8 = 0x10;
const PA_SELECT_BOOST: u8 = 0x80;
const PA_RFO_MAX_POWER: u8 = 0x70;
const PA_DAC_DEFAULT: u8 = 0x84;

/// MODEM_CONFIG_1 bits 7:4
const BANDWIDTHS: [Bandwidth; 10] = [
    Bandwidth { hz: 7_800, code: 0 },
    Bandwidth { hz: 10_400, code: 1 },
    Bandwidth { hz: 15_600, code: 2 },
    Bandwidth { hz: 20_800, code: 3 },
    Bandwidth { hz: 31_250, code: 4 },
    Bandwidth { hz: 41_700, code: 5 },
    Bandwidth { hz: 62_500, code: 6 },
    Bandwidth { hz: 125_000, code: 7 },
    Bandwidth { hz: 250_000, code: 8 },
    Bandwidth { hz: 500_000, code: 9 },
];

/// SX1276 / SX1278 driver
pub struct Sx127x<'a, T> {
    bus: Bus<T>,
    irq: &'a IrqBridge,
    board: BoardConfig,
    core: ModemCore,
}

impl<'a, T: Transport> Sx127x<'a, T> {
    pub fn new(transport: T, board: BoardConfig, irq: &'a IrqBridge) -> Self {
        Self {
            bus: Bus::new(transport, timing::BUSY_TIMEOUT_MS),
            irq,
            board,
            core: ModemCore::new(),
        }
    }

    async fn read_register(&mut self, addr: u8) -> Result<u8, RadioError> {
        let mut frame = [addr & 0x7F, 0x00];
        self.bus.exchange(&mut frame).await?;
        Ok(frame[1])
    }

    async fn write_register(&mut self, addr: u8, value: u8) -> Result<(), RadioError> {
        let mut frame = [addr | 0x80, value];
        self.bus.exchange(&mut frame).await?;
        Ok(())
    }

    async fn update_register(&mut self, addr: u8, mask: u8, bits: u8) -> Result<(), RadioError> {
        let value = self.read_register(addr).await?;
        self.write_register(addr, (value & !mask) | (bits & mask)).await
    }

    async fn set_op_mode(&mut self, op: u8) -> Result<(), RadioError> {
        self.write_register(reg::OP_MODE, mode::LONG_RANGE | op).await
    }

    async fn detect(&mut self) -> Result<(), RadioError> {
        let start = self.bus.now_ms();
        loop {
            let version = self.read_register(reg::VERSION).await?;
            if version == CHIP_VERSION {
                return Ok(());
            }
            if self.bus.now_ms() - start >= timing::DETECT_WINDOW_SX127X_MS as u64 {
                warn!("sx127x not found, version register reads {:#04x}", version);
                return Err(RadioError::Init);
            }
            self.bus.delay_ms(timing::DETECT_RETRY_MS).await;
        }
    }

    async fn apply_frequency(&mut self, frequency_hz: u32) -> Result<(), RadioError> {
        let frf = (((frequency_hz as u64) << 19) + XTAL_HZ / 2) / XTAL_HZ;
        self.write_register(reg::FRF_MSB, (frf >> 16) as u8).await?;
        self.write_register(reg::FRF_MID, (frf >> 8) as u8).await?;
        self.write_register(reg::FRF_LSB, frf as u8).await?;
        self.core.config.frequency_hz = frequency_hz;
        self.optimize_sensitivity().await
    }

    async fn read_frequency(&mut self) -> Result<u32, RadioError> {
        let msb = self.read_register(reg::FRF_MSB).await? as u64;
        let mid = self.read_register(reg::FRF_MID).await? as u64;
        let lsb = self.read_register(reg::FRF_LSB).await? as u64;
        let frf = (msb << 16) | (mid << 8) | lsb;
        Ok(((frf * XTAL_HZ + (1 << 18)) >> 19) as u32)
    }

    /// 500 kHz sensitivity settings, per band
    async fn optimize_sensitivity(&mut self) -> Result<(), RadioError> {
        let freq = self.core.config.frequency_hz;
        if self.core.config.bandwidth_hz == 500_000 {
            if (410_000_000..=525_000_000).contains(&freq) {
                self.write_register(reg::HIGH_BW_OPTIMIZE_1, 0x02).await?;
                self.write_register(reg::HIGH_BW_OPTIMIZE_2, 0x7F).await?;
            } else if (820_000_000..=1_020_000_000).contains(&freq) {
                self.write_register(reg::HIGH_BW_OPTIMIZE_1, 0x02).await?;
                self.write_register(reg::HIGH_BW_OPTIMIZE_2, 0x64).await?;
            }
        } else {
            self.write_register(reg::HIGH_BW_OPTIMIZE_1, 0x03).await?;
        }
        Ok(())
    }

    async fn apply_spreading_factor(&mut self, sf: u8) -> Result<(), RadioError> {
        let sf = sf.clamp(6, 12);
        let (optimize, threshold) = if sf == 6 { (0xC5, 0x0C) } else { (0xC3, 0x0A) };
        self.write_register(reg::DETECTION_OPTIMIZE, optimize).await?;
        self.write_register(reg::DETECTION_THRESHOLD, threshold).await?;
        self.update_register(reg::MODEM_CONFIG_2, 0xF0, sf << 4).await?;
        self.core.config.spreading_factor = sf;
        self.core.retime();
        self.apply_low_data_rate().await
    }

    async fn apply_bandwidth(&mut self, bandwidth_hz: u32) -> Result<(), RadioError> {
        let bw = select_bandwidth(&BANDWIDTHS, bandwidth_hz);
        self.update_register(reg::MODEM_CONFIG_1, 0xF0, bw.code << 4).await?;
        self.core.config.bandwidth_hz = bw.hz;
        self.core.config.bandwidth_code = bw.code;
        self.core.retime();
        self.apply_low_data_rate().await?;
        self.optimize_sensitivity().await
    }

    async fn apply_coding_rate(&mut self, denominator: u8) -> Result<(), RadioError> {
        let denominator = denominator.clamp(5, 8);
        self.update_register(reg::MODEM_CONFIG_1, 0x0E, (denominator - 4) << 1).await?;
        self.core.config.coding_rate = denominator;
        self.core.retime();
        Ok(())
    }

    async fn apply_preamble(&mut self, symbols: u16) -> Result<u16, RadioError> {
        // The modem adds 4.25 symbols to the programmed length
        let length = symbols.saturating_sub(4);
        self.write_register(reg::PREAMBLE_MSB, (length >> 8) as u8).await?;
        self.write_register(reg::PREAMBLE_LSB, length as u8).await?;
        let achieved = length + 4;
        self.core.config.preamble_symbols = achieved;
        self.core.retime();
        Ok(achieved)
    }

    async fn apply_tx_power(&mut self, dbm: i8) -> Result<(), RadioError> {
        let ceiling = self.board.max_tx_power_dbm.unwrap_or(i8::MAX);
        let level = match self.board.pa_output {
            PaOutput::Rfo => {
                let level = dbm.clamp(0, 14.min(ceiling).max(0));
                self.write_register(reg::PA_DAC, PA_DAC_DEFAULT).await?;
                self.write_register(reg::PA_CONFIG, PA_RFO_MAX_POWER | level as u8).await?;
                level
            }
            PaOutput::PaBoost => {
                let level = dbm.clamp(2, 17.min(ceiling).max(2));
                self.write_register(reg::PA_DAC, PA_DAC_DEFAULT).await?;
                self.write_register(reg::PA_CONFIG, PA_SELECT_BOOST | (level - 2) as u8).await?;
                level
            }
        };
        self.core.config.tx_power_dbm = level;
        Ok(())
    }

    async fn apply_crc(&mut self, enabled: bool) -> Result<(), RadioError> {
        let bits = if enabled { MC2_CRC_ON } else { 0 };
        self.update_register(reg::MODEM_CONFIG_2, MC2_CRC_ON, bits).await?;
        self.core.config.crc = enabled;
        Ok(())
    }

    async fn apply_header_mode(&mut self, implicit: bool) -> Result<(), RadioError> {
        let bits = if implicit { MC1_IMPLICIT_HEADER } else { 0 };
        self.update_register(reg::MODEM_CONFIG_1, MC1_IMPLICIT_HEADER, bits).await?;
        self.core.config.implicit_header = implicit;
        Ok(())
    }

    async fn apply_low_data_rate(&mut self) -> Result<(), RadioError> {
        let bits = if self.core.timing.low_data_rate {
            MC3_LOW_DATA_RATE
        } else {
            0
        };
        self.update_register(reg::MODEM_CONFIG_3, MC3_LOW_DATA_RATE, bits).await
    }

    /// DIO0 signals RxDone while a handler is registered
    async fn route_irq(&mut self) -> Result<(), RadioError> {
        let mapped = if self.core.handler.is_some() {
            self.write_register(reg::DIO_MAPPING_1, 0x00).await
        } else {
            Ok(())
        };
        self.irq.set_enabled(self.core.online && self.core.handler.is_some());
        mapped
    }

    fn rssi_offset(&self) -> i16 {
        if self.core.config.frequency_hz < LF_PORT_MAX_HZ {
            RSSI_OFFSET_LF
        } else {
            RSSI_OFFSET_HF
        }
    }

    async fn read_frequency_error(&mut self) -> Result<i32, RadioError> {
        let msb = self.read_register(reg::FREQ_ERROR_MSB).await? as i32;
        let mid = self.read_register(reg::FREQ_ERROR_MID).await? as i32;
        let lsb = self.read_register(reg::FREQ_ERROR_LSB).await? as i32;
        let mut raw = ((msb & 0x07) << 16) | (mid << 8) | lsb;
        if msb & 0x08 != 0 {
            raw -= 1 << 19;
        }
        let error = raw as i64 * (1 << 24) * self.core.config.bandwidth_hz as i64
            / (XTAL_HZ as i64 * 500_000);
        Ok(error as i32)
    }

    async fn capture_signal(&mut self) -> Result<SignalSample, RadioError> {
        let rssi_raw = self.read_register(reg::PKT_RSSI_VALUE).await?;
        let snr_raw = self.read_register(reg::PKT_SNR_VALUE).await?;
        let snr_whole = (snr_raw as i8 as i16) / 4;

        let mut rssi_dbm = rssi_raw as i16 - self.rssi_offset();
        if snr_whole < 0 {
            rssi_dbm += snr_whole;
        } else {
            // 16/15 slope correction
            rssi_dbm = (rssi_dbm as i32 * 1066 / 1000) as i16;
        }

        Ok(SignalSample {
            rssi_raw,
            snr_raw,
            rssi_dbm,
            snr_db: snr_raw as i8 as f32 * 0.25,
            frequency_error_hz: self.read_frequency_error().await?,
        })
    }

    /// Key the transmitter and wait for TxDone
    ///
    /// Returns whether RxDone was latched alongside, so the caller can hand
    /// it back to the bridge once DIO0 is routed again.
    async fn transmit(&mut self) -> Result<bool, RadioError> {
        self.set_op_mode(mode::TX).await?;
        let start = self.bus.now_ms();
        loop {
            let flags = self.read_register(reg::IRQ_FLAGS).await?;
            if flags & irq::TX_DONE != 0 {
                self.write_register(reg::IRQ_FLAGS, irq::TX_DONE).await?;
                return Ok(flags & irq::RX_DONE != 0);
            }
            if self.bus.now_ms() - start >= timing::MODEM_TIMEOUT_MS as u64 {
                warn!("sx127x: tx-done not seen within {} ms", timing::MODEM_TIMEOUT_MS);
                return Err(RadioError::TxTimeout);
            }
            self.bus.delay_ms(timing::TX_POLL_MS).await;
        }
    }

    async fn handle_irq(&mut self) -> Result<Option<usize>, RadioError> {
        let flags = self.read_register(reg::IRQ_FLAGS).await?;
        self.write_register(reg::IRQ_FLAGS, flags).await?;
        let status = IrqStatus::from_raw(flags as u32, &IRQ_MAP);

        if !status.contains(IrqStatus::RX_DONE) {
            return Ok(None);
        }
        if !status.packet_ok() {
            debug!("sx127x: crc error, packet dropped");
            self.core.buffer.reset();
            return Ok(None);
        }

        let len = if self.core.config.implicit_header {
            self.read_register(reg::PAYLOAD_LENGTH).await?
        } else {
            self.read_register(reg::RX_NB_BYTES).await?
        } as usize;
        let origin = self.read_register(reg::FIFO_RX_CURRENT_ADDR).await?;
        self.write_register(reg::FIFO_ADDR_PTR, origin).await?;

        let mut data = [0u8; lora_defaults::MAX_PAYLOAD];
        for byte in data.iter_mut().take(len) {
            *byte = self.read_register(reg::FIFO).await?;
        }
        self.core.buffer.load(&data[..len]);
        self.core.signal = self.capture_signal().await?;

        let delivered = self.core.deliver();
        self.write_register(reg::FIFO_ADDR_PTR, 0).await?;
        Ok(Some(delivered))
    }

    async fn init(&mut self, frequency_hz: u32) -> Result<(), RadioError> {
        self.bus.reset().await?;
        self.detect().await?;
        self.set_op_mode(mode::SLEEP).await?;

        self.core.config = RadioConfig {
            frequency_hz,
            ..RadioConfig::default()
        };
        self.apply_frequency(frequency_hz).await?;
        self.write_register(reg::FIFO_TX_BASE_ADDR, 0).await?;
        self.write_register(reg::FIFO_RX_BASE_ADDR, 0).await?;
        self.update_register(reg::LNA, 0x03, 0x03).await?;
        self.write_register(reg::MODEM_CONFIG_3, MC3_AGC_AUTO).await?;
        self.write_register(reg::SYNC_WORD, SYNC_WORD).await?;
        if self.board.tcxo.is_some() {
            self.update_register(reg::TCXO, TCXO_INPUT_ON, TCXO_INPUT_ON).await?;
        }

        self.apply_crc(lora_defaults::CRC).await?;
        self.apply_tx_power(lora_defaults::TX_POWER_DBM).await?;
        self.apply_bandwidth(lora_defaults::BANDWIDTH_HZ).await?;
        self.apply_spreading_factor(lora_defaults::SPREADING_FACTOR).await?;
        self.apply_coding_rate(lora_defaults::CODING_RATE).await?;
        self.apply_preamble(lora_defaults::PREAMBLE_SYMBOLS).await?;
        self.apply_header_mode(false).await?;

        self.set_op_mode(mode::STDBY).await?;
        Ok(())
    }
}

impl<'a, T: Transport> Modem for Sx127x<'a, T> {
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
        info!("sx127x online at {} Hz", frequency_hz);
        Ok(())
    }

    async fn end(&mut self) {
        self.irq.set_enabled(false);
        if self.core.online {
            let _ = self.set_op_mode(mode::SLEEP).await;
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
        if !self.core.online {
            return Ok(self.core.config.frequency_hz);
        }
        self.read_frequency().await
    }

    async fn set_spreading_factor(&mut self, sf: u8) -> Result<(), RadioError> {
        if !self.core.online {
            return Ok(());
        }
        self.apply_spreading_factor(sf).await
    }

    async fn set_signal_bandwidth(&mut self, bandwidth_hz: u32) -> Result<(), RadioError> {
        if !self.core.online {
            return Ok(());
        }
        self.apply_bandwidth(bandwidth_hz).await
    }

    async fn set_coding_rate4(&mut self, denominator: u8) -> Result<(), RadioError> {
        if !self.core.online {
            return Ok(());
        }
        self.apply_coding_rate(denominator).await
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
        self.apply_preamble(symbols).await
    }

    async fn set_crc(&mut self, enabled: bool) -> Result<(), RadioError> {
        if !self.core.online {
            return Ok(());
        }
        self.apply_crc(enabled).await
    }

    async fn begin_packet(&mut self, implicit_header: bool) -> Result<(), RadioError> {
        if !self.core.online {
            return Err(RadioError::Offline);
        }
        let listening = self.core.state == ModemState::Receiving;
        self.standby().await?;
        if listening || self.irq.is_pending() {
            // A packet that landed before the switch would be overwritten in the FIFO
            self.irq.take();
            self.handle_irq().await?;
        }
        self.apply_header_mode(implicit_header).await?;
        self.write_register(reg::FIFO_ADDR_PTR, 0).await?;
        self.write_register(reg::PAYLOAD_LENGTH, 0).await?;
        self.core.buffer.reset();
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, RadioError> {
        if !self.core.online {
            return Err(RadioError::Offline);
        }
        let staged = self.core.buffer.stage(data);
        for &byte in &data[..staged.len] {
            self.write_register(reg::FIFO, byte).await?;
        }
        self.write_register(reg::PAYLOAD_LENGTH, self.core.buffer.len() as u8)
            .await?;
        Ok(staged.len)
    }

    async fn end_packet(&mut self) -> Result<(), RadioError> {
        if !self.core.online {
            return Err(RadioError::Offline);
        }

        // DIO0 reports TxDone while transmitting; keep it away from the bridge
        self.irq.set_enabled(false);
        self.core.set_state(ModemState::Transmitting);
        let outcome = self.transmit().await;
        if outcome.is_err() {
            let _ = self.set_op_mode(mode::STDBY).await;
        }

        self.core.buffer.reset();
        self.core.set_state(ModemState::Standby);
        let routed = self.route_irq().await;
        let rx_latched = outcome?;
        routed?;
        if rx_latched {
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
            self.apply_header_mode(true).await?;
            self.write_register(reg::PAYLOAD_LENGTH, size).await?;
            self.core.config.payload_length = size;
        } else {
            self.apply_header_mode(false).await?;
        }
        self.set_op_mode(mode::RX_CONTINUOUS).await?;
        self.core.set_state(ModemState::Receiving);
        Ok(())
    }

    async fn carrier_detected(&mut self) -> Result<bool, RadioError> {
        if !self.core.online {
            return Ok(false);
        }
        // Both bits clear themselves once the modem loses the signal
        let stat = self.read_register(reg::MODEM_STAT).await?;
        Ok(stat & (modem_stat::SIGNAL_DETECTED | modem_stat::SIGNAL_SYNCED) != 0)
    }

    async fn current_rssi_raw(&mut self) -> Result<u8, RadioError> {
        if !self.core.online {
            return Ok(0);
        }
        self.read_register(reg::RSSI_VALUE).await
    }

    async fn current_rssi(&mut self) -> Result<i16, RadioError> {
        let raw = self.current_rssi_raw().await?;
        Ok(raw as i16 - self.rssi_offset())
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
        self.set_op_mode(mode::SLEEP).await?;
        self.core.set_state(ModemState::Sleeping);
        Ok(())
    }

    async fn standby(&mut self) -> Result<(), RadioError> {
        if !self.core.online {
            return Ok(());
        }
        self.set_op_mode(mode::STDBY).await?;
        self.core.set_state(ModemState::Standby);
        Ok(())
    }

    async fn random(&mut self) -> Result<u8, RadioError> {
        if !self.core.online {
            return Ok(0);
        }
        self.read_register(reg::RSSI_WIDEBAND).await
    }
}
