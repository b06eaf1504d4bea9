//! Host node: the whole firmware wiring against in-memory devices.
//!
//! - **Host**: `cargo run --bin node [config.json]`
//!
//! ## Commands
//!
//! Type commands on stdin in place of pressing buttons:
//! - `t` - Press the transmit button
//! - `r` - Press or release the record button
//! - `rx <text>` - Deliver a frame over the simulated air
//! - `status` - Show radio and indicator state
//! - `quit` - Shut down
//! - `help` - Show help

#[cfg(not(feature = "esp32"))]
mod host {
    use log::{debug, error, info, warn};
    use lora_audio_node::audio::{
        run_record_loop, AudioStream, BlockPool, LoopbackStream, RecordTarget,
    };
    use lora_audio_node::config::NodeConfig;
    use lora_audio_node::lora::{
        frame_queue, hex_bytes, run_transmit_loop, Direction, LoopbackRadio, RadioController,
    };
    use lora_audio_node::signal::{
        Edge, EdgeDebouncer, RecordButton, SignalGate, TransmitButton, VirtualPin,
    };
    use std::io::{BufRead, Write};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// RSSI and SNR reported for frames typed on stdin.
    const SIM_RSSI: i16 = -60;
    const SIM_SNR: i8 = 8;

    fn print_line(msg: &str) {
        println!("{}", msg);
        let _ = std::io::stdout().flush();
    }

    fn print_help() {
        print_line("Commands: t (transmit), r (record press/release), rx <text>, status, quit");
    }

    pub async fn run() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

        info!("=== LoRa audio node starting ===");
        info!("Platform: Host");

        let config = match std::env::args().nth(1) {
            Some(path) => match NodeConfig::load(&path) {
                Ok(config) => {
                    info!("Loaded config from {}", path);
                    config
                }
                Err(e) => {
                    error!("{}", e);
                    std::process::exit(1);
                }
            },
            None => NodeConfig::default(),
        };

        let cancel = CancellationToken::new();

        // Radio: configure for receive and arm the frame sink.
        let (radio, air) = LoopbackRadio::new();
        let mut controller = match RadioController::new(radio) {
            Ok(controller) => controller,
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        };
        let (sink, mut frames) = frame_queue(config.frame_queue_depth);
        if let Err(e) = controller.configure(config.radio.with_direction(Direction::Receive)) {
            error!("Failed to configure radio: {}", e);
            std::process::exit(1);
        }
        if let Err(e) = controller.start_receive(sink.into_callback()) {
            error!("Failed to start reception: {}", e);
            std::process::exit(1);
        }
        let radio_state = controller.subscribe();

        // Buttons.
        let tx_gate = Arc::new(SignalGate::new("tx"));
        let led = VirtualPin::new();
        let tx_button = TransmitButton::new(tx_gate.clone(), Some(led.clone()));
        let record_button = Arc::new(RecordButton::new(
            Arc::new(SignalGate::new("record")),
            EdgeDebouncer::new(config.debounce()),
        ));

        // Audio.
        let pool = BlockPool::new(config.audio.block_size(), config.audio.block_count());
        let (stream_device, _stream) = LoopbackStream::synthetic();
        let stream = AudioStream::new(stream_device, pool, config.audio);
        let (target, audio_rx) = if config.audio.echo {
            (RecordTarget::Echo, None)
        } else {
            let (tx, rx) = mpsc::channel(config.audio.initial_blocks.max(1));
            (RecordTarget::Downstream(tx), Some(rx))
        };

        let tx_task = tokio::spawn(run_transmit_loop(
            controller,
            tx_gate,
            config.payload.clone().into_bytes(),
            cancel.clone(),
        ));
        let record_task = tokio::spawn(run_record_loop(
            stream,
            record_button.clone(),
            target,
            config.audio.max_record_blocks,
            cancel.clone(),
        ));

        let frame_cancel = cancel.clone();
        let frame_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = frame_cancel.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => print_line(&format!(
                            "rx: {:?} [{}] ({} dBm, {} dB)",
                            String::from_utf8_lossy(&frame.data),
                            hex_bytes(&frame.data),
                            frame.rssi,
                            frame.snr
                        )),
                        None => break,
                    },
                }
            }
            if frames.dropped() > 0 {
                warn!("{} received frames were dropped", frames.dropped());
            }
        });

        let audio_task = audio_rx.map(|mut rx| {
            tokio::spawn(async move {
                let mut blocks = 0u64;
                while let Some(block) = rx.recv().await {
                    blocks += 1;
                    debug!("Audio block {} from slot {}", blocks, block.slot());
                }
                info!("Audio consumer received {} blocks", blocks);
            })
        });

        print_help();
        let stdin_cancel = cancel.clone();
        let stdin_record = record_button.clone();
        let stdin_task = tokio::task::spawn_blocking(move || {
            let stdin = std::io::stdin();
            let mut lines = stdin.lock().lines();

            while !stdin_cancel.is_cancelled() {
                let Some(Ok(line)) = lines.next() else {
                    break;
                };
                let line = line.trim();
                match line {
                    "t" | "tx" => tx_button.on_press(),
                    "r" | "rec" => {
                        let edge = if stdin_record.raw_held() {
                            Edge::Falling
                        } else {
                            Edge::Rising
                        };
                        match stdin_record.on_edge(edge) {
                            Some(event) => print_line(&format!("record button: {:?}", event)),
                            None => print_line("record button: inside debounce window"),
                        }
                    }
                    "status" => print_line(&format!(
                        "radio: {}, indicator: {}, recording: {}",
                        *radio_state.borrow(),
                        if led.is_high() { "on" } else { "off" },
                        stdin_record.is_held()
                    )),
                    "q" | "quit" => break,
                    "help" => print_help(),
                    "" => {}
                    _ => match line.strip_prefix("rx ") {
                        Some(text) => {
                            if !air.inject(text.as_bytes(), SIM_RSSI, SIM_SNR) {
                                print_line("radio is not receiving, frame lost");
                            }
                        }
                        None => print_line("unknown command, try 'help'"),
                    },
                }
            }
        });

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                print_line("\nShutting down...");
            }
            result = stdin_task => {
                if let Err(e) = result {
                    error!("Stdin task error: {}", e);
                }
            }
        }
        cancel.cancel();
        // Release a held record button so capture ends.
        if record_button.raw_held() {
            record_button.on_edge(Edge::Falling);
        }

        match tx_task.await {
            Ok(Ok((_, summary))) => info!(
                "Transmit cycles: {} ({} failed)",
                summary.cycles, summary.failures
            ),
            Ok(Err(e)) | Err(e) => error!("Transmit task error: {}", e),
        }
        match record_task.await {
            Ok(Ok((stream, summary))) => info!(
                "Record sessions: {}, blocks: {}, timeouts: {}, pool free {}/{}",
                summary.sessions,
                summary.blocks,
                summary.timeouts,
                stream.pool().free_count(),
                stream.pool().capacity()
            ),
            Ok(Err(e)) | Err(e) => error!("Record task error: {}", e),
        }
        let _ = frame_task.await;
        if let Some(task) = audio_task {
            let _ = task.await;
        }

        info!("Shutdown complete");
    }
}

#[cfg(not(feature = "esp32"))]
#[tokio::main(flavor = "current_thread")]
async fn main() {
    host::run().await;
    // The stdin reader may still be parked in a blocking read.
    std::process::exit(0);
}

#[cfg(feature = "esp32")]
fn main() {
    println!("The host node runs without the 'esp32' feature; flash the 'firmware' binary instead.");
}
