//! SPI and GPIO transport for a radio module wired to the ESP32-S3
//!
//! Chip-select is driven by hand around each transfer so the radio sees one
//! frame per opcode, the way the Semtech parts expect.

use embassy_time::{Duration, Instant, Timer};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::spi::SpiBus;

use crate::radio::bus::{BusError, ControlPin, Transport};

/// Control lines of the radio module
pub struct RadioPins<Nss, Nrst, Busy, RxEn, TxEn> {
    pub nss: Nss,
    pub nrst: Nrst,
    /// Busy input, `None` on register-style modules
    pub busy: Option<Busy>,
    pub rx_enable: Option<RxEn>,
    pub tx_enable: Option<TxEn>,
}

/// [`Transport`] over an async SPI bus and plain GPIOs
pub struct SpiTransport<Spi, Nss, Nrst, Busy, RxEn, TxEn> {
    spi: Spi,
    pins: RadioPins<Nss, Nrst, Busy, RxEn, TxEn>,
}

impl<Spi, Nss, Nrst, Busy, RxEn, TxEn> SpiTransport<Spi, Nss, Nrst, Busy, RxEn, TxEn>
where
    Spi: SpiBus,
    Nss: OutputPin,
    Nrst: OutputPin,
    Busy: InputPin,
    RxEn: OutputPin,
    TxEn: OutputPin,
{
    pub fn new(spi: Spi, mut pins: RadioPins<Nss, Nrst, Busy, RxEn, TxEn>) -> Self {
        let _ = pins.nss.set_high();
        let _ = pins.nrst.set_high();
        Self { spi, pins }
    }
}

fn drive<P: OutputPin>(pin: &mut P, high: bool) -> Result<(), BusError> {
    let result = if high { pin.set_high() } else { pin.set_low() };
    result.map_err(|_| BusError::Pin)
}

impl<Spi, Nss, Nrst, Busy, RxEn, TxEn> Transport for SpiTransport<Spi, Nss, Nrst, Busy, RxEn, TxEn>
where
    Spi: SpiBus,
    Nss: OutputPin,
    Nrst: OutputPin,
    Busy: InputPin,
    RxEn: OutputPin,
    TxEn: OutputPin,
{
    async fn transfer(&mut self, frame: &mut [u8]) -> Result<(), BusError> {
        drive(&mut self.pins.nss, false)?;
        let result = match self.spi.transfer_in_place(frame).await {
            Ok(()) => self.spi.flush().await,
            Err(e) => Err(e),
        };
        // Release chip-select even when the transfer failed
        drive(&mut self.pins.nss, true)?;
        result.map_err(|_| BusError::Spi)
    }

    fn is_busy(&mut self) -> bool {
        match self.pins.busy.as_mut() {
            Some(busy) => busy.is_high().unwrap_or(false),
            None => false,
        }
    }

    fn set_pin(&mut self, pin: ControlPin, high: bool) -> Result<(), BusError> {
        match pin {
            ControlPin::Reset => drive(&mut self.pins.nrst, high),
            ControlPin::RxEnable => match self.pins.rx_enable.as_mut() {
                Some(p) => drive(p, high),
                None => Ok(()),
            },
            ControlPin::TxEnable => match self.pins.tx_enable.as_mut() {
                Some(p) => drive(p, high),
                None => Ok(()),
            },
        }
    }

    async fn delay_ms(&mut self, ms: u32) {
        Timer::after(Duration::from_millis(ms as u64)).await;
    }

    fn now_ms(&self) -> u64 {
        Instant::now().as_millis()
    }

    fn release(&mut self) {
        let _ = self.pins.nss.set_high();
        if let Some(p) = self.pins.rx_enable.as_mut() {
            let _ = p.set_low();
        }
        if let Some(p) = self.pins.tx_enable.as_mut() {
            let _ = p.set_low();
        }
    }
}
