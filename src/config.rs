//! Board and radio configuration
//!
//! Pin numbers describe the ESP32-S3 carrier used by the firmware binary.
//! Everything a radio backend needs to know about the board it sits on is
//! carried by [`BoardConfig`] and handed over at construction time.

/// ESP32-S3 wiring used by the firmware binary
pub mod pins {
    /// Status LED, active low
    pub const LED: u8 = 48;

    pub const SCLK: u8 = 7;
    pub const MISO: u8 = 8;
    pub const MOSI: u8 = 9;

    pub const NSS: u8 = 41;
    pub const DIO: u8 = 39;
    pub const NRST: u8 = 42;
    pub const BUSY: u8 = 40;
}

/// Default modem configuration applied by `begin()`
pub mod lora_defaults {
    /// EU ISM band frequency
    pub const FREQUENCY_HZ: u32 = 868_000_000;
    pub const SPREADING_FACTOR: u8 = 7;
    pub const BANDWIDTH_HZ: u32 = 125_000;
    /// Coding rate 4/5
    pub const CODING_RATE: u8 = 5;
    pub const TX_POWER_DBM: i8 = 2;
    pub const PREAMBLE_SYMBOLS: u16 = 18;
    pub const CRC: bool = true;
    /// Hardware FIFO limit shared by every supported chip
    pub const MAX_PAYLOAD: usize = 255;
}

/// Timeouts and retry windows
pub mod timing {
    /// Busy line ceiling for the opcode chips
    pub const BUSY_TIMEOUT_MS: u32 = 100;
    /// The LR11xx needs longer after calibration commands
    pub const BUSY_TIMEOUT_LR11XX_MS: u32 = 300;

    /// Bounded wait for tx-done
    pub const MODEM_TIMEOUT_MS: u32 = 20_000;
    pub const MODEM_TIMEOUT_SX128X_MS: u32 = 15_000;

    /// Chip detection windows
    pub const DETECT_WINDOW_SX127X_MS: u32 = 500;
    pub const DETECT_WINDOW_MS: u32 = 2_000;
    pub const DETECT_RETRY_MS: u32 = 100;

    /// Reset pulse timing
    pub const RESET_PULSE_MS: u32 = 10;
    pub const RESET_SETTLE_MS: u32 = 10;

    /// Poll interval while waiting for tx-done
    pub const TX_POLL_MS: u32 = 1;
}

/// Radio transceiver family fitted to the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipFamily {
    /// SX1276/SX1278 register-mapped modem
    Sx127x,
    /// SX1262/SX1268 sub-GHz opcode modem
    Sx126x,
    /// SX1280/SX1281 2.4 GHz opcode modem
    Sx128x,
    /// LR1110/LR1120/LR1121 multi-opcode transceiver
    Lr11xx,
}

/// TCXO supply voltage, encoded as the SX126x/LR11xx voltage code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcxoVoltage {
    V1_6 = 0x00,
    V1_7 = 0x01,
    V1_8 = 0x02,
    V2_2 = 0x03,
    V2_4 = 0x04,
    V2_7 = 0x05,
    V3_0 = 0x06,
    V3_3 = 0x07,
}

impl TcxoVoltage {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// LR11xx DIO pin masks driving an RF switch, per radio state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfSwitchTable {
    pub enable: u8,
    pub standby: u8,
    pub rx: u8,
    pub tx: u8,
    pub tx_hp: u8,
    pub tx_hf: u8,
    pub gnss: u8,
    pub wifi: u8,
}

impl RfSwitchTable {
    /// Parameter bytes for SetDioAsRfSwitch
    pub const fn to_bytes(&self) -> [u8; 8] {
        [
            self.enable,
            self.standby,
            self.rx,
            self.tx,
            self.tx_hp,
            self.tx_hf,
            self.gnss,
            self.wifi,
        ]
    }
}

/// How the antenna path is switched between RX and TX
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfSwitch {
    /// No switch, or one the chip handles internally
    None,
    /// Single switch line driven by the chip's DIO2
    Dio2,
    /// Explicit RX-enable and TX-enable GPIOs driven by the host
    Pins,
    /// Switch lines driven by LR11xx DIOs
    DioTable(RfSwitchTable),
}

/// SX127x output stage wired to the antenna
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaOutput {
    /// RFO pin, 0..14 dBm
    Rfo,
    /// PA_BOOST pin, 2..17 dBm
    PaBoost,
}

/// SX128x transmit power curve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCurve {
    /// Bare chip output, -18..13 dBm
    Chip,
    /// External PA, 0..20 dBm at the antenna
    ExternalPa20,
    /// External PA, 0..27 dBm at the antenna
    ExternalPa27,
}

/// Static description of the board a radio backend is driving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardConfig {
    pub name: &'static str,
    pub chip: ChipFamily,
    pub spi_frequency_hz: u32,
    /// TCXO that must be powered before the oscillator is used
    pub tcxo: Option<TcxoVoltage>,
    pub rf_switch: RfSwitch,
    pub pa_output: PaOutput,
    pub power_curve: PowerCurve,
    /// Board ceiling applied on top of the chip's own range
    pub max_tx_power_dbm: Option<i8>,
}

/// Board presets
pub mod boards {
    use super::*;

    pub const RNODE_SX1276: BoardConfig = BoardConfig {
        name: "RNode SX1276",
        chip: ChipFamily::Sx127x,
        spi_frequency_hz: 8_000_000,
        tcxo: None,
        rf_switch: RfSwitch::None,
        pa_output: PaOutput::PaBoost,
        power_curve: PowerCurve::Chip,
        max_tx_power_dbm: None,
    };

    pub const WIO_SX1262: BoardConfig = BoardConfig {
        name: "WIO SX1262",
        chip: ChipFamily::Sx126x,
        spi_frequency_hz: 8_000_000,
        tcxo: Some(TcxoVoltage::V1_8),
        rf_switch: RfSwitch::Dio2,
        pa_output: PaOutput::PaBoost,
        power_curve: PowerCurve::Chip,
        max_tx_power_dbm: None,
    };

    pub const SX1268_RXEN_TXEN: BoardConfig = BoardConfig {
        name: "SX1268 with RXEN/TXEN",
        chip: ChipFamily::Sx126x,
        spi_frequency_hz: 8_000_000,
        tcxo: Some(TcxoVoltage::V3_3),
        rf_switch: RfSwitch::Pins,
        pa_output: PaOutput::PaBoost,
        power_curve: PowerCurve::Chip,
        max_tx_power_dbm: Some(20),
    };

    pub const SX1280: BoardConfig = BoardConfig {
        name: "SX1280",
        chip: ChipFamily::Sx128x,
        spi_frequency_hz: 8_000_000,
        tcxo: None,
        rf_switch: RfSwitch::Pins,
        pa_output: PaOutput::PaBoost,
        power_curve: PowerCurve::Chip,
        max_tx_power_dbm: None,
    };

    pub const SX1280_PA20: BoardConfig = BoardConfig {
        name: "SX1280 with 20 dBm PA",
        power_curve: PowerCurve::ExternalPa20,
        ..SX1280
    };

    pub const SX1280_PA27: BoardConfig = BoardConfig {
        name: "SX1280 with 27 dBm PA",
        power_curve: PowerCurve::ExternalPa27,
        ..SX1280
    };

    pub const WIO_TRACKER_LR1110: BoardConfig = BoardConfig {
        name: "WIO tracker LR1110",
        chip: ChipFamily::Lr11xx,
        spi_frequency_hz: 8_000_000,
        tcxo: Some(TcxoVoltage::V1_8),
        rf_switch: RfSwitch::DioTable(RfSwitchTable {
            enable: 0b0_1111,
            standby: 0,
            rx: 0b1,
            tx: 0b11,
            tx_hp: 0b10,
            tx_hf: 0,
            gnss: 0,
            wifi: 0,
        }),
        pa_output: PaOutput::PaBoost,
        power_curve: PowerCurve::Chip,
        max_tx_power_dbm: None,
    };

    pub const T1000E_LR1110: BoardConfig = BoardConfig {
        name: "T1000-E LR1110",
        tcxo: Some(TcxoVoltage::V1_6),
        rf_switch: RfSwitch::DioTable(RfSwitchTable {
            enable: 0b0_1111,
            standby: 0,
            rx: 0b1001,
            tx: 0b1011,
            tx_hp: 0b1010,
            tx_hf: 0,
            gnss: 0,
            wifi: 0,
        }),
        ..WIO_TRACKER_LR1110
    };
}
