//! Mock transport for host tests
//!
//! The transport runs on a simulated millisecond clock. Chip simulators see
//! every frame, may hold the busy line, and can raise the interrupt bridge
//! when a scheduled event (such as tx-done) comes due.

use super::bus::{BusError, ControlPin, Transport};
use super::irq::IrqBridge;
use std::cell::{Cell, RefCell, RefMut};
use std::rc::Rc;
use std::vec::Vec;

/// Behaviour of a simulated radio chip
pub trait ChipSim {
    /// Handle one chip-select framed transfer in place
    fn transfer(&mut self, now: u64, frame: &mut [u8]);

    fn busy(&self, _now: u64) -> bool {
        false
    }

    /// Advance to `now`, returning true when the interrupt line rises
    fn tick(&mut self, _now: u64) -> bool {
        false
    }

    fn pin(&mut self, _pin: ControlPin, _high: bool) {}
}

/// Shared state between the transport and the test body
struct Shared<C> {
    chip: RefCell<C>,
    clock: Cell<u64>,
    frames: RefCell<Vec<Vec<u8>>>,
    pins: RefCell<Vec<(ControlPin, bool)>>,
    released: Cell<bool>,
    failing: Cell<bool>,
}

pub struct MockTransport<'a, C> {
    shared: Rc<Shared<C>>,
    irq: Option<&'a IrqBridge>,
}

/// Test-side view of a [`MockTransport`]
pub struct MockHandle<'a, C> {
    shared: Rc<Shared<C>>,
    irq: Option<&'a IrqBridge>,
}

pub fn mock_transport<'a, C: ChipSim>(
    chip: C,
    irq: Option<&'a IrqBridge>,
) -> (MockTransport<'a, C>, MockHandle<'a, C>) {
    let shared = Rc::new(Shared {
        chip: RefCell::new(chip),
        clock: Cell::new(0),
        frames: RefCell::new(Vec::new()),
        pins: RefCell::new(Vec::new()),
        released: Cell::new(false),
        failing: Cell::new(false),
    });
    (
        MockTransport {
            shared: shared.clone(),
            irq,
        },
        MockHandle { shared, irq },
    )
}

fn advance<C: ChipSim>(shared: &Shared<C>, irq: Option<&IrqBridge>, ms: u64) {
    for _ in 0..ms {
        let now = shared.clock.get() + 1;
        shared.clock.set(now);
        if shared.chip.borrow_mut().tick(now) {
            if let Some(irq) = irq {
                irq.raise();
            }
        }
    }
}

impl<'a, C: ChipSim> Transport for MockTransport<'a, C> {
    async fn transfer(&mut self, frame: &mut [u8]) -> Result<(), BusError> {
        if self.shared.failing.get() {
            return Err(BusError::Spi);
        }
        self.shared.released.set(false);
        self.shared.frames.borrow_mut().push(frame.to_vec());
        let now = self.shared.clock.get();
        self.shared.chip.borrow_mut().transfer(now, frame);
        Ok(())
    }

    fn is_busy(&mut self) -> bool {
        let now = self.shared.clock.get();
        let busy = self.shared.chip.borrow().busy(now);
        if busy {
            advance(&self.shared, self.irq, 1);
        }
        busy
    }

    fn set_pin(&mut self, pin: ControlPin, high: bool) -> Result<(), BusError> {
        self.shared.pins.borrow_mut().push((pin, high));
        self.shared.chip.borrow_mut().pin(pin, high);
        Ok(())
    }

    async fn delay_ms(&mut self, ms: u32) {
        advance(&self.shared, self.irq, ms as u64);
    }

    fn now_ms(&self) -> u64 {
        self.shared.clock.get()
    }

    fn release(&mut self) {
        self.shared.released.set(true);
    }
}

impl<'a, C: ChipSim> MockHandle<'a, C> {
    pub fn chip(&self) -> RefMut<'_, C> {
        self.shared.chip.borrow_mut()
    }

    pub fn now(&self) -> u64 {
        self.shared.clock.get()
    }

    /// Let simulated time pass outside of any driver call
    pub fn advance(&self, ms: u64) {
        advance(&self.shared, self.irq, ms);
    }

    /// Every frame as it was clocked out, oldest first
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.shared.frames.borrow().clone()
    }

    /// Frames starting with `prefix`
    pub fn frames_starting(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.shared
            .frames
            .borrow()
            .iter()
            .filter(|f| f.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_frames(&self) {
        self.shared.frames.borrow_mut().clear();
    }

    pub fn pin_history(&self) -> Vec<(ControlPin, bool)> {
        self.shared.pins.borrow().clone()
    }

    pub fn clear_pins(&self) {
        self.shared.pins.borrow_mut().clear();
    }

    /// Make every following transfer fail until switched back off
    pub fn fail_transfers(&self, failing: bool) {
        self.shared.failing.set(failing);
    }

    pub fn released(&self) -> bool {
        self.shared.released.get()
    }
}
