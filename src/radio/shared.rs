//! State every backend keeps alongside its chip-specific fields

use super::irq::CarrierSense;
use super::modulation::Timing;
use super::packet::PacketBuffer;
use super::traits::{ModemState, RadioConfig, ReceiveHandler, SignalSample};
use log::debug;

/// Chip-independent bookkeeping shared by every backend
pub struct ModemCore {
    pub config: RadioConfig,
    pub state: ModemState,
    pub online: bool,
    pub buffer: PacketBuffer,
    pub signal: SignalSample,
    pub carrier: CarrierSense,
    pub handler: Option<ReceiveHandler>,
    pub timing: Timing,
}

impl ModemCore {
    pub fn new() -> Self {
        let config = RadioConfig::default();
        let timing = timing_for(&config);
        Self {
            config,
            state: ModemState::Uninitialized,
            online: false,
            buffer: PacketBuffer::new(),
            signal: SignalSample::default(),
            carrier: CarrierSense::new(),
            handler: None,
            timing,
        }
    }

    /// Recompute airtime figures after a modulation change
    pub fn retime(&mut self) {
        self.timing = timing_for(&self.config);
    }

    pub fn set_state(&mut self, state: ModemState) {
        if self.state != state {
            debug!("modem {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Hand the buffered packet to the receive handler
    pub fn deliver(&self) -> usize {
        let packet = self.buffer.as_slice();
        if let Some(handler) = self.handler {
            handler(packet);
        }
        packet.len()
    }

    pub fn go_offline(&mut self) {
        self.online = false;
        self.state = ModemState::Uninitialized;
        self.buffer.reset();
        self.carrier.reset();
    }
}

impl Default for ModemCore {
    fn default() -> Self {
        Self::new()
    }
}

fn timing_for(config: &RadioConfig) -> Timing {
    Timing::compute(
        config.spreading_factor,
        config.bandwidth_hz,
        config.coding_rate,
        config.preamble_symbols,
    )
}

/// `Modem` methods that only read `self.core` and `self.bus`
macro_rules! modem_accessors {
    () => {
        fn is_online(&self) -> bool {
            self.core.online
        }

        fn state(&self) -> $crate::radio::traits::ModemState {
            self.core.state
        }

        fn config(&self) -> &$crate::radio::traits::RadioConfig {
            &self.core.config
        }

        fn available(&self) -> usize {
            self.core.buffer.available()
        }

        fn read(&mut self) -> Option<u8> {
            self.core.buffer.read()
        }

        fn peek(&self) -> Option<u8> {
            self.core.buffer.peek()
        }

        fn packet_signal(&self) -> $crate::radio::traits::SignalSample {
            self.core.signal
        }

        fn timing(&self) -> &$crate::radio::modulation::Timing {
            &self.core.timing
        }

        fn busy_timeouts(&self) -> u32 {
            self.bus.busy_timeouts()
        }

        fn false_preambles(&self) -> u32 {
            self.core.carrier.false_preambles()
        }
    };
}

pub(crate) use modem_accessors;
