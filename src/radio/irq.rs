//! Interrupt bridge and interrupt status decoding
//!
//! The interrupt handler (or an edge-waiting task) only ever calls
//! [`IrqBridge::raise`]. The radio's `poll()` drains the pending flag from
//! ordinary context and does all bus work there, so nothing touches the SPI
//! bus from interrupt context.

use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use log::debug;

/// Single-producer single-consumer pending flag for the radio's DIO line
pub struct IrqBridge {
    pending: AtomicBool,
    enabled: AtomicBool,
    edges: AtomicU32,
}

impl IrqBridge {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            edges: AtomicU32::new(0),
        }
    }

    /// Record an edge. Safe to call from interrupt context.
    pub fn raise(&self) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        self.edges.fetch_add(1, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
    }

    /// Consume the pending edge, if any
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Attach or detach the bridge; edges are dropped while detached
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.pending.store(false, Ordering::Release);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Edges recorded since boot
    pub fn edges(&self) -> u32 {
        self.edges.load(Ordering::Relaxed)
    }
}

impl Default for IrqBridge {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// Chip-independent view of a radio's interrupt status
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrqStatus: u8 {
        const TX_DONE = 1 << 0;
        const RX_DONE = 1 << 1;
        const CRC_ERROR = 1 << 2;
        const HEADER_VALID = 1 << 3;
        const PREAMBLE = 1 << 4;
        const HEADER_ERROR = 1 << 5;
    }
}

/// Physical IRQ bit for each abstract flag of one chip family
pub type IrqMap = [(u32, IrqStatus)];

impl IrqStatus {
    pub fn from_raw(raw: u32, map: &IrqMap) -> Self {
        map.iter()
            .filter(|(bit, _)| raw & bit != 0)
            .fold(IrqStatus::empty(), |acc, (_, flag)| acc | *flag)
    }

    pub fn to_raw(self, map: &IrqMap) -> u32 {
        map.iter()
            .filter(|(_, flag)| self.contains(*flag))
            .fold(0, |acc, (bit, _)| acc | bit)
    }

    /// A packet arrived intact
    pub fn packet_ok(self) -> bool {
        self.contains(IrqStatus::RX_DONE)
            && !self.intersects(IrqStatus::CRC_ERROR | IrqStatus::HEADER_ERROR)
    }
}

/// Outcome of one carrier-sense evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarrierVerdict {
    pub carrier: bool,
    /// The sticky preamble flag has outlived its window and must be cleared
    pub clear_preamble: bool,
}

/// Ages sticky preamble-detect flags on chips that never clear them
///
/// A preamble that has not produced a valid header within the configured
/// preamble plus header airtime is treated as noise.
#[derive(Debug, Default)]
pub struct CarrierSense {
    preamble_since: Option<u64>,
    false_preambles: u32,
}

impl CarrierSense {
    pub const fn new() -> Self {
        Self {
            preamble_since: None,
            false_preambles: 0,
        }
    }

    pub fn evaluate(&mut self, now_ms: u64, status: IrqStatus, window_ms: u32) -> CarrierVerdict {
        let header = status.contains(IrqStatus::HEADER_VALID);

        if !status.contains(IrqStatus::PREAMBLE) {
            self.preamble_since = None;
            return CarrierVerdict {
                carrier: header,
                clear_preamble: false,
            };
        }

        let since = *self.preamble_since.get_or_insert(now_ms);
        if now_ms.saturating_sub(since) > window_ms as u64 {
            self.preamble_since = None;
            if !header {
                self.false_preambles = self.false_preambles.wrapping_add(1);
                debug!("false preamble after {} ms", now_ms - since);
            }
            return CarrierVerdict {
                carrier: header,
                clear_preamble: true,
            };
        }

        CarrierVerdict {
            carrier: true,
            clear_preamble: false,
        }
    }

    pub fn reset(&mut self) {
        self.preamble_since = None;
    }

    pub fn false_preambles(&self) -> u32 {
        self.false_preambles
    }
}
