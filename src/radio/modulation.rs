//! Modulation and airtime calculator
//!
//! Pure functions of spreading factor, bandwidth and coding rate. Each
//! backend encodes the results differently, but the physical quantities
//! and the low data rate policy are the same for every chip.

/// Contention slot length in symbols
pub const CSMA_SLOT_SYMBOLS: u32 = 12;
pub const CSMA_SLOT_MAX_MS: u32 = 100;
pub const CSMA_SLOT_MIN_MS: u32 = 24;
/// Reduction of the slot floor on fast links
pub const CSMA_SLOT_MIN_FAST_DELTA: u32 = 18;
pub const CSMA_SIFS_MS: u32 = 0;

pub const PREAMBLE_SYMBOLS_MIN: u32 = 18;
pub const PREAMBLE_TARGET_MS: u32 = 24;
pub const PREAMBLE_FAST_DELTA: u32 = 18;

/// Links faster than this use the shorter slot and preamble targets
pub const FAST_THRESHOLD_BPS: u32 = 30_000;

/// Explicit LoRa PHY header duration in symbols
pub const PHY_HEADER_SYMBOLS: u32 = 20;

/// Derived airtime figures for one modulation setting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// Symbols per second
    pub symbol_rate: f32,
    pub symbol_time_ms: f32,
    /// Exact bit rate from the LoRa rate equation
    pub bitrate: f32,
    /// `bitrate` rounded to whole bits per second
    pub bitrate_bps: u32,
    pub low_data_rate: bool,
    /// Recommended preamble length for the channel-access layer
    pub recommended_preamble_symbols: u16,
    /// Airtime of the configured preamble, rounded up
    pub preamble_time_ms: u32,
    /// Airtime of the PHY header, rounded up
    pub header_time_ms: u32,
    pub csma_slot_ms: u32,
    pub difs_ms: u32,
}

impl Timing {
    pub fn compute(sf: u8, bandwidth_hz: u32, coding_rate: u8, preamble_symbols: u16) -> Self {
        let chips = 1u64 << sf;
        let bw = bandwidth_hz.max(1) as u64;
        let cr = coding_rate.max(1) as u64;

        let symbol_rate = bw as f32 / chips as f32;
        let symbol_time_ms = (chips * 1000) as f32 / bw as f32;

        // sf * (4/cr) / (2^sf / (bw/1000)) * 1000 == sf * 4 * bw / (cr * 2^sf)
        let bits_num = sf as u64 * 4 * bw;
        let bits_den = cr * chips;
        let bitrate = bits_num as f32 / bits_den as f32;
        let bitrate_bps = ((bits_num + bits_den / 2) / bits_den) as u32;

        let fast = bitrate_bps > FAST_THRESHOLD_BPS;

        let slot_floor = if fast {
            CSMA_SLOT_MIN_MS - CSMA_SLOT_MIN_FAST_DELTA
        } else {
            CSMA_SLOT_MIN_MS
        };
        let slot_raw = (CSMA_SLOT_SYMBOLS as u64 * chips * 1000 / bw) as u32;
        let csma_slot_ms = slot_raw.clamp(slot_floor, CSMA_SLOT_MAX_MS);

        let target_ms = if fast {
            PREAMBLE_TARGET_MS - PREAMBLE_FAST_DELTA
        } else {
            PREAMBLE_TARGET_MS
        };
        let target_symbols = (target_ms as u64 * bw).div_ceil(chips * 1000) as u32;
        let recommended = target_symbols.max(PREAMBLE_SYMBOLS_MIN).min(u16::MAX as u32) as u16;

        Self {
            symbol_rate,
            symbol_time_ms,
            bitrate,
            bitrate_bps,
            low_data_rate: low_data_rate(sf, bandwidth_hz),
            recommended_preamble_symbols: recommended,
            preamble_time_ms: airtime_ms(preamble_symbols as u32, chips, bw),
            header_time_ms: airtime_ms(PHY_HEADER_SYMBOLS, chips, bw),
            csma_slot_ms,
            difs_ms: CSMA_SIFS_MS + 2 * csma_slot_ms,
        }
    }

    /// How long an unresolved preamble may be treated as carrier
    pub fn preamble_window_ms(&self) -> u32 {
        self.preamble_time_ms + self.header_time_ms
    }
}

fn airtime_ms(symbols: u32, chips: u64, bw: u64) -> u32 {
    (symbols as u64 * chips * 1000).div_ceil(bw) as u32
}

/// Low data rate optimisation is required when `2^sf / (bw / 1000) > 16`
///
/// Evaluated as `2^sf * 1000 > 16 * bw` so no precision is lost.
pub fn low_data_rate(sf: u8, bandwidth_hz: u32) -> bool {
    (1u64 << sf) * 1000 > 16 * bandwidth_hz as u64
}

/// One bandwidth a chip supports, with its register or opcode encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bandwidth {
    pub hz: u32,
    pub code: u8,
}

/// Smallest table entry at or above `requested_hz`, or the widest entry
///
/// Tables are sorted by ascending `hz` and never empty.
pub fn select_bandwidth(table: &[Bandwidth], requested_hz: u32) -> Bandwidth {
    table
        .iter()
        .find(|bw| bw.hz >= requested_hz)
        .or(table.last())
        .copied()
        .unwrap_or(Bandwidth {
            hz: requested_hz,
            code: 0,
        })
}

/// Look up the bandwidth a chip code stands for
pub fn bandwidth_for_code(table: &[Bandwidth], code: u8) -> Option<Bandwidth> {
    table.iter().find(|bw| bw.code == code).copied()
}

/// Preamble length expressed as `mantissa * 2^exponent`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizedPreamble {
    pub mantissa: u8,
    pub exponent: u8,
}

impl QuantizedPreamble {
    pub fn symbols(&self) -> u32 {
        (self.mantissa as u32) << self.exponent
    }

    /// Packed `exponent << 4 | mantissa` byte
    pub fn to_byte(&self) -> u8 {
        (self.exponent << 4) | (self.mantissa & 0x0F)
    }
}

/// Smallest representable preamble that is not shorter than `target`
///
/// Mantissa and exponent are both limited to 4 bits. Targets beyond the
/// largest representable length saturate at `15 * 2^15`.
pub fn quantize_preamble(target: u32) -> QuantizedPreamble {
    let mut best = QuantizedPreamble {
        mantissa: 15,
        exponent: 15,
    };
    for exponent in 0..=15u8 {
        for mantissa in 1..=15u8 {
            let candidate = QuantizedPreamble { mantissa, exponent };
            let len = candidate.symbols();
            if len >= target && len < best.symbols() {
                best = candidate;
            }
        }
    }
    best
}

/// Longest quantized preamble whose length still fits a 16-bit count
const LONGEST_U16_PREAMBLE: u16 = 15 << 12;

/// Quantize a 16-bit preamble request
///
/// Requests that would round up past 16 bits settle on the longest length
/// that fits instead.
pub fn quantize_preamble_u16(symbols: u16) -> QuantizedPreamble {
    quantize_preamble(symbols.min(LONGEST_U16_PREAMBLE) as u32)
}
