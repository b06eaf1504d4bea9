//! Firmware entry for the LILYGO T3-S3.
//!
//! Wires the SX1262, the buttons, the activity indicator and (when I2S pins
//! are configured) the audio codec, then runs the transmit and record workers
//! forever.

#[cfg(feature = "esp32")]
mod firmware {
    use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull};
    use esp_idf_hal::peripherals::Peripherals;
    use log::{debug, error, info, warn};
    use lora_audio_node::audio::{
        run_record_loop, AudioStream, BlockPool, I2sStream, RecordTarget,
    };
    use lora_audio_node::config::NodeConfig;
    use lora_audio_node::lora::{
        frame_queue, run_transmit_loop, Direction, RadioController, Sx1262Device,
    };
    use lora_audio_node::signal::{Edge, EdgeDebouncer, RecordButton, SignalGate, TransmitButton};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Back-off after a failed edge wait.
    const EDGE_RETRY_MS: u64 = 100;

    type Indicator = PinDriver<'static, AnyOutputPin, Output>;
    type Button = PinDriver<'static, AnyIOPin, Input>;

    fn input_pin(gpio: u8) -> Option<Button> {
        // SAFETY: pin numbers come from a validated PinConfig and are not
        // claimed by any other driver.
        let pin = unsafe { AnyIOPin::new(gpio as i32) };
        let mut driver = match PinDriver::input(pin) {
            Ok(driver) => driver,
            Err(e) => {
                error!("GPIO {} unavailable: {:?}", gpio, e);
                return None;
            }
        };
        if let Err(e) = driver.set_pull(Pull::Up) {
            warn!("GPIO {} pull-up failed: {:?}", gpio, e);
        }
        Some(driver)
    }

    fn indicator(gpio: Option<u8>) -> Option<Indicator> {
        let gpio = gpio?;
        // SAFETY: as for input_pin.
        let pin = unsafe { AnyOutputPin::new(gpio as i32) };
        match PinDriver::output(pin) {
            Ok(driver) => Some(driver),
            Err(e) => {
                warn!("Indicator on GPIO {} unavailable: {:?}", gpio, e);
                None
            }
        }
    }

    /// Buttons are active low: an electrical falling edge is a press.
    async fn transmit_edges(mut pin: Button, button: TransmitButton<Indicator>) {
        loop {
            match pin.wait_for_falling_edge().await {
                Ok(()) => button.on_press(),
                Err(e) => {
                    warn!("Transmit button wait failed: {:?}", e);
                    tokio::time::sleep(Duration::from_millis(EDGE_RETRY_MS)).await;
                }
            }
        }
    }

    async fn record_edges(mut pin: Button, button: Arc<RecordButton>) {
        loop {
            let settling = button.is_settling();
            let window = button.debounce_window();
            let releasing = button.raw_held();
            let edge = if releasing { Edge::Falling } else { Edge::Rising };
            let wait = async {
                if releasing {
                    pin.wait_for_rising_edge().await
                } else {
                    pin.wait_for_falling_edge().await
                }
            };
            // An edge inside the window is committed once the window passes,
            // whether or not another edge follows.
            let result = tokio::select! {
                result = wait => Some(result),
                _ = tokio::time::sleep(window), if settling => None,
            };
            let event = match result {
                Some(Ok(())) => button.on_edge(edge),
                Some(Err(e)) => {
                    warn!("Record button wait failed: {:?}", e);
                    tokio::time::sleep(Duration::from_millis(EDGE_RETRY_MS)).await;
                    button.settle()
                }
                None => button.settle(),
            };
            if let Some(event) = event {
                debug!("Record button {:?}", event);
            }
        }
    }

    pub async fn run() {
        let peripherals = match Peripherals::take() {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to take peripherals: {:?}", e);
                return;
            }
        };
        let config = NodeConfig::default();
        if let Err(e) = config.validate() {
            error!("Invalid configuration: {}", e);
            return;
        }
        let cancel = CancellationToken::new();

        // Radio
        let pins = peripherals.pins;
        let controller = match Sx1262Device::new(
            peripherals.spi2,
            pins.gpio12,
            pins.gpio11,
            pins.gpio13,
            pins.gpio10,
            pins.gpio5,
            pins.gpio4,
        ) {
            Ok(radio) => match RadioController::new(radio) {
                Ok(controller) => Some(controller),
                Err(e) => {
                    error!("{}", e);
                    None
                }
            },
            Err(e) => {
                error!("SPI bring-up failed: {:?}", e);
                None
            }
        };

        let (sink, mut frames) = frame_queue(config.frame_queue_depth);
        let controller = controller.and_then(|mut controller| {
            if let Err(e) = controller.configure(config.radio.with_direction(Direction::Receive)) {
                error!("Failed to configure LoRa device: {}", e);
                return None;
            }
            if let Err(e) = controller.start_receive(sink.into_callback()) {
                error!("Failed to start reception: {}", e);
            }
            Some(controller)
        });

        // Buttons
        let tx_gate = Arc::new(SignalGate::new("tx"));
        let tx_button = TransmitButton::new(tx_gate.clone(), indicator(config.pins.indicator_led));
        let transmit_pin = input_pin(config.pins.transmit_button);

        let record_button = Arc::new(RecordButton::new(
            Arc::new(SignalGate::new("record")),
            EdgeDebouncer::new(config.debounce()),
        ));
        let record_pin = config.pins.record_button.and_then(input_pin);

        // Audio
        let stream = match (config.pins.i2s, record_pin.is_some()) {
            (Some(i2s_pins), true) => {
                match I2sStream::new(peripherals.i2s0, &i2s_pins, &config.audio) {
                    Ok(device) => {
                        let pool =
                            BlockPool::new(config.audio.block_size(), config.audio.block_count());
                        Some(AudioStream::new(device, pool, config.audio))
                    }
                    Err(e) => {
                        error!("I2S bring-up failed, recording disabled: {:?}", e);
                        None
                    }
                }
            }
            _ => {
                info!("No record button or I2S pins, recording disabled");
                None
            }
        };
        let (target, mut audio_rx) = if config.audio.echo {
            (RecordTarget::Echo, None)
        } else {
            let (tx, rx) = mpsc::channel(config.audio.initial_blocks.max(1));
            (RecordTarget::Downstream(tx), Some(rx))
        };

        info!("Node running");

        let transmit = async {
            match (controller, transmit_pin) {
                (Some(controller), Some(pin)) => {
                    let worker = run_transmit_loop(
                        controller,
                        tx_gate,
                        config.payload.clone().into_bytes(),
                        cancel.clone(),
                    );
                    let (result, _) = tokio::join!(worker, transmit_edges(pin, tx_button));
                    if let Err(e) = result {
                        error!("Transmit worker failed: {}", e);
                    }
                }
                _ => warn!("Transmit path disabled"),
            }
        };

        let record = async {
            if let (Some(stream), Some(pin)) = (stream, record_pin) {
                let worker = run_record_loop(
                    stream,
                    record_button.clone(),
                    target,
                    config.audio.max_record_blocks,
                    cancel.clone(),
                );
                let (result, _) = tokio::join!(worker, record_edges(pin, record_button.clone()));
                if let Err(e) = result {
                    error!("Record worker failed: {}", e);
                }
            }
        };

        let received = async {
            while let Some(frame) = frames.recv().await {
                debug!("Frame of {} bytes consumed", frame.data.len());
            }
        };

        let audio = async {
            if let Some(rx) = audio_rx.as_mut() {
                while let Some(block) = rx.recv().await {
                    debug!("Audio block from slot {} ({} bytes)", block.slot(), block.filled());
                }
            }
        };

        tokio::join!(transmit, record, received, audio);
    }
}

#[cfg(feature = "esp32")]
#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Link ESP-IDF patches (must be first!)
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    log::info!("=== LoRa audio node starting ===");

    firmware::run().await;
}

#[cfg(not(feature = "esp32"))]
fn main() {
    println!("This binary requires the 'esp32' feature.");
    println!("Use 'cargo run --bin node' to run the node on the host.");
}
