#![no_std]
#![no_main]

// Required for ESP-IDF bootloader compatibility
// Use explicit parameters to ensure correct efuse block revision values
esp_bootloader_esp_idf::esp_app_desc!(
    env!("CARGO_PKG_VERSION"),  // version
    env!("CARGO_PKG_NAME"),     // project_name
    "00:00:00",                 // build_time
    "2025-01-01",               // build_date
    "0.0.0",                    // idf_ver (not using IDF)
    0x10000,                    // mmu_page_size (64KB)
    0,                          // min_efuse_blk_rev_full (accept all)
    u16::MAX                    // max_efuse_blk_rev_full (accept all)
);

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_sync::signal::Signal;
use esp_backtrace as _;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::spi::Mode as SpiMode;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::Async;
use log::{info, warn, LevelFilter};
use static_cell::StaticCell;

use rnode_radio_firmware::config::{boards, lora_defaults, BoardConfig};
use rnode_radio_firmware::hal::{RadioPins, SpiTransport};
use rnode_radio_firmware::logger;
use rnode_radio_firmware::radio::{AnyRadio, IrqBridge, Modem};

/// Board fitted to the carrier
const BOARD: BoardConfig = boards::WIO_SX1262;

/// Duration of LED flash in milliseconds
const LED_FLASH_MS: u64 = 50;

type RadioTransport = SpiTransport<
    Spi<'static, Async>,
    Output<'static>,
    Output<'static>,
    Input<'static>,
    Output<'static>,
    Output<'static>,
>;

type Radio = AnyRadio<'static, RadioTransport>;

type LedSender = Sender<'static, CriticalSectionRawMutex, (), 4>;
type LedReceiver = Receiver<'static, CriticalSectionRawMutex, (), 4>;

/// Static executor for embassy
static EXECUTOR: StaticCell<esp_rtos::embassy::Executor> = StaticCell::new();

/// Pending-interrupt flag shared by the DIO task and the radio backend
static RADIO_IRQ: IrqBridge = IrqBridge::new();

/// Wakes the radio task after an interrupt edge
static RADIO_WAKE: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Channel for LED flash signals
static LED_CHANNEL: Channel<CriticalSectionRawMutex, (), 4> = Channel::new();

#[esp_hal::main]
fn main() -> ! {
    logger::init(LevelFilter::Info);

    let peripherals = esp_hal::init(esp_hal::Config::default());

    // Turn on LED (active low)
    let led = Output::new(peripherals.GPIO48, Level::Low, OutputConfig::default());

    // Initialise the RTOS scheduler with timer - MUST be done before any async operations
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    let spi = Spi::new(
        peripherals.SPI2,
        SpiConfig::default()
            .with_frequency(Rate::from_hz(BOARD.spi_frequency_hz))
            .with_mode(SpiMode::_0),
    )
    .unwrap()
    .with_sck(peripherals.GPIO7)
    .with_miso(peripherals.GPIO8)
    .with_mosi(peripherals.GPIO9)
    .into_async();

    let pins = RadioPins {
        nss: Output::new(peripherals.GPIO41, Level::High, OutputConfig::default()),
        nrst: Output::new(peripherals.GPIO42, Level::High, OutputConfig::default()),
        busy: Some(Input::new(
            peripherals.GPIO40,
            InputConfig::default().with_pull(Pull::Down),
        )),
        rx_enable: None,
        tx_enable: None,
    };
    let dio = Input::new(peripherals.GPIO39, InputConfig::default().with_pull(Pull::Down));

    let radio = AnyRadio::from_board(BOARD, SpiTransport::new(spi, pins), &RADIO_IRQ);

    let executor = EXECUTOR.init(esp_rtos::embassy::Executor::new());
    executor.run(|spawner| {
        spawner.must_spawn(async_main(spawner, radio, dio, led));
    })
}

#[embassy_executor::task]
async fn async_main(spawner: Spawner, radio: Radio, dio: Input<'static>, led: Output<'static>) {
    spawner.must_spawn(dio_task(dio));
    spawner.must_spawn(led_task(led, LED_CHANNEL.receiver()));
    spawner.must_spawn(radio_task(radio, LED_CHANNEL.sender()));
}

/// Turns DIO rising edges into bridge events
#[embassy_executor::task]
async fn dio_task(mut dio: Input<'static>) {
    loop {
        dio.wait_for_rising_edge().await;
        RADIO_IRQ.raise();
        RADIO_WAKE.signal(());
    }
}

fn log_packet(packet: &[u8]) {
    match core::str::from_utf8(packet) {
        Ok(s) => info!("LoRa RX: '{}'", s),
        Err(_) => info!("LoRa RX: {} bytes", packet.len()),
    }
}

/// Brings the radio up and listens continuously
#[embassy_executor::task]
async fn radio_task(mut radio: Radio, led_sender: LedSender) {
    info!("LoRa: starting {} ({:?})", BOARD.name, radio.chip());
    if radio.begin(lora_defaults::FREQUENCY_HZ).await.is_err() {
        warn!("LoRa: no radio answered, giving up");
        return;
    }
    info!(
        "LoRa: online, SF{} {} Hz CR4/{} {} dBm, symbol {} ms",
        radio.spreading_factor(),
        radio.signal_bandwidth(),
        radio.coding_rate4(),
        radio.tx_power(),
        radio.symbol_time_ms()
    );

    let started = radio.on_receive(Some(log_packet)).await;
    if started.is_err() || radio.receive(0).await.is_err() {
        warn!("LoRa: could not enter receive mode");
        return;
    }

    loop {
        RADIO_WAKE.wait().await;
        match radio.poll().await {
            Ok(Some(_)) => {
                let _ = led_sender.try_send(());
                info!("LoRa: RSSI {} dBm, SNR {} dB", radio.packet_rssi(), radio.packet_snr());
            }
            Ok(None) => {}
            Err(e) => warn!("LoRa: poll failed: {:?}", e),
        }
    }
}

/// Task that handles LED flashing without blocking other operations
#[embassy_executor::task]
async fn led_task(mut led: Output<'static>, receiver: LedReceiver) {
    loop {
        receiver.receive().await;

        // Flash LED (turn off then back on, since active low)
        led.set_high();
        embassy_time::Timer::after(embassy_time::Duration::from_millis(LED_FLASH_MS)).await;
        led.set_low();
    }
}
