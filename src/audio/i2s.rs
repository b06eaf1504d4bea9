//! I2S backend for [`StreamDevice`] (ESP32 only).
//!
//! One bidirectional standard-mode (Philips) channel pair. The ESP-IDF driver
//! fixes sample rate and word size at construction, so `configure` only
//! checks that a lane's parameters match what the driver was built with.

use super::config::AudioConfig;
use super::stream::{Lane, StreamConfig, StreamDevice, Trigger};
use crate::config::I2sPins;
use crate::errno::{self, DeviceResult};
use esp_idf_hal::delay::TickType;
use esp_idf_hal::gpio::AnyIOPin;
use esp_idf_hal::i2s::config::{DataBitWidth, StdConfig};
use esp_idf_hal::i2s::{I2sBiDir, I2sDriver, I2S0};
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_sys::EspError;
use log::{debug, info, warn};
use std::time::Duration;

fn to_errno(e: EspError) -> i32 {
    if e.code() == esp_idf_sys::ESP_ERR_TIMEOUT as i32 {
        -errno::ETIMEDOUT
    } else {
        warn!("I2S error: {:?}", e);
        -errno::EIO
    }
}

fn ticks(timeout: Duration) -> u32 {
    TickType::from(timeout).ticks()
}

pub struct I2sStream {
    driver: I2sDriver<'static, I2sBiDir>,
    frame_rate: u32,
    word_size_bits: u8,
    configured: [bool; 2],
}

impl I2sStream {
    pub fn new(
        i2s: impl Peripheral<P = I2S0> + 'static,
        pins: &I2sPins,
        audio: &AudioConfig,
    ) -> Result<Self, EspError> {
        let width = match audio.word_size_bits {
            8 => DataBitWidth::Bits8,
            16 => DataBitWidth::Bits16,
            24 => DataBitWidth::Bits24,
            _ => DataBitWidth::Bits32,
        };
        let config = StdConfig::philips(audio.sample_rate, width);

        // SAFETY: the pin numbers come from a validated PinConfig and are not
        // claimed by any other driver.
        let (bclk, ws, din, dout) = unsafe {
            (
                AnyIOPin::new(pins.bclk as i32),
                AnyIOPin::new(pins.ws as i32),
                AnyIOPin::new(pins.din as i32),
                AnyIOPin::new(pins.dout as i32),
            )
        };
        let driver =
            I2sDriver::new_std_bidir(i2s, &config, bclk, din, dout, Option::<AnyIOPin>::None, ws)?;
        info!(
            "I2S ready: {} Hz, {}-bit, BCLK {} WS {} DIN {} DOUT {}",
            audio.sample_rate, audio.word_size_bits, pins.bclk, pins.ws, pins.din, pins.dout
        );

        Ok(Self {
            driver,
            frame_rate: audio.sample_rate,
            word_size_bits: audio.word_size_bits,
            configured: [false; 2],
        })
    }
}

fn index(lane: Lane) -> usize {
    match lane {
        Lane::Capture => 0,
        Lane::Playback => 1,
    }
}

impl StreamDevice for I2sStream {
    fn is_ready(&self, _lane: Lane) -> bool {
        true
    }

    fn configure(&mut self, lane: Lane, config: &StreamConfig) -> DeviceResult<()> {
        if config.frame_rate != self.frame_rate || config.word_size_bits != self.word_size_bits {
            warn!(
                "I2S {} config {} Hz/{}-bit does not match driver {} Hz/{}-bit",
                lane, config.frame_rate, config.word_size_bits, self.frame_rate, self.word_size_bits
            );
            return Err(-errno::ENOTSUP);
        }
        self.configured[index(lane)] = true;
        Ok(())
    }

    fn trigger(&mut self, lane: Lane, cmd: Trigger) -> DeviceResult<()> {
        if !self.configured[index(lane)] {
            return Err(-errno::EIO);
        }
        debug!("I2S {} {:?}", lane, cmd);
        let result = match (lane, cmd) {
            (Lane::Capture, Trigger::Start) => self.driver.rx_enable(),
            (Lane::Playback, Trigger::Start) => self.driver.tx_enable(),
            (Lane::Capture, _) => self.driver.rx_disable(),
            (Lane::Playback, _) => self.driver.tx_disable(),
        };
        result.map_err(to_errno)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> DeviceResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let read = self
                .driver
                .read(&mut buf[filled..], ticks(timeout))
                .map_err(to_errno)?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        Ok(filled)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> DeviceResult<usize> {
        let mut written = 0;
        while written < data.len() {
            let n = self
                .driver
                .write(&data[written..], ticks(timeout))
                .map_err(to_errno)?;
            if n == 0 {
                return Err(-errno::ETIMEDOUT);
            }
            written += n;
        }
        Ok(written)
    }
}
