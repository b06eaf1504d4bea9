//! SX1262 backend for the LILYGO T3-S3 board.
//!
//! Implements [`RadioDevice`] on top of the `sx1262` command set. Receive is
//! serviced by a polling thread that owns the callback; `stop_receive` joins
//! it, which is what makes cancellation synchronous.
//!
//! | Signal | GPIO |
//! |--------|------|
//! | SPI MOSI | 11 |
//! | SPI MISO | 13 |
//! | SPI CLK | 12 |
//! | NSS (CS) | 10 |
//! | RESET | 5 |
//! | BUSY | 4 |

use super::airtime::{low_data_rate_optimize, time_on_air};
use super::config::{Bandwidth, CodingRate, RadioConfig, MAX_PAYLOAD_LEN};
use super::device::{RadioDevice, RxCallback, RxEvent, RxFrame};
use crate::errno::{self, DeviceResult};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::gpio::{Gpio10, Gpio11, Gpio12, Gpio13, Gpio4, Gpio5, Input, Output, PinDriver};
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::spi::config::Config as SpiConfig;
use esp_idf_hal::spi::config::DriverConfig;
use esp_idf_hal::spi::{SpiDeviceDriver, SpiDriver, SPI2};
use esp_idf_hal::units::FromValueType;
use esp_idf_sys::EspError;
use log::{debug, error, info, warn};
use regiface::{Command, NoParameters, ToByteArray};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use sx1262::{
    ClearIrqStatus, Device, DeviceSelect, DioIrqConfig, GetIrqStatus, GetPacketStatus,
    GetRxBufferStatus, IrqMask, PaConfig, PacketParams, PacketType, RampTime, RfFrequencyConfig,
    RxMode, SetDioIrqParams, SetPaConfig, SetPacketParams, SetPacketType, SetRfFrequency, SetRx,
    SetStandby, SetTx, SetTxParams, StandbyConfig, Timeout, TxParams,
};

/// Maximum time to wait for the BUSY line to drop.
const BUSY_TIMEOUT_MS: u64 = 1000;

/// Slack added to the computed airtime when waiting for TX done.
const TX_MARGIN_MS: u64 = 100;

/// Receive polling interval.
const RX_POLL_MS: u32 = 5;

/// LoRa sync word register.
const REG_LORA_SYNC_WORD: u16 = 0x0740;
const SYNC_WORD_PUBLIC: [u8; 2] = [0x34, 0x44];
const SYNC_WORD_PRIVATE: [u8; 2] = [0x14, 0x24];

/// Raw modulation parameters: [SF, BW, CR, LDRO, 0, 0, 0, 0].
///
/// Raw bytes because the crate's bandwidth enum does not match the datasheet.
#[derive(Debug, Clone)]
struct RawLoRaModParams([u8; 8]);

impl ToByteArray for RawLoRaModParams {
    type Error = core::convert::Infallible;
    type Array = [u8; 8];

    fn to_bytes(self) -> Result<Self::Array, Self::Error> {
        Ok(self.0)
    }
}

/// SetModulationParams (opcode 0x8B).
#[derive(Debug, Clone)]
struct RawSetModulationParams {
    params: RawLoRaModParams,
}

impl Command for RawSetModulationParams {
    type IdType = u8;
    type CommandParameters = RawLoRaModParams;
    type ResponseParameters = NoParameters;

    fn id() -> Self::IdType {
        0x8B
    }

    fn invoking_parameters(self) -> Self::CommandParameters {
        self.params
    }
}

/// Register address plus a two-byte value.
#[derive(Debug, Clone)]
struct RawRegisterWrite([u8; 4]);

impl ToByteArray for RawRegisterWrite {
    type Error = core::convert::Infallible;
    type Array = [u8; 4];

    fn to_bytes(self) -> Result<Self::Array, Self::Error> {
        Ok(self.0)
    }
}

/// WriteRegister (opcode 0x0D) for two consecutive registers.
#[derive(Debug, Clone)]
struct RawWriteRegister {
    params: RawRegisterWrite,
}

impl RawWriteRegister {
    fn new(address: u16, value: [u8; 2]) -> Self {
        let [hi, lo] = address.to_be_bytes();
        Self {
            params: RawRegisterWrite([hi, lo, value[0], value[1]]),
        }
    }
}

impl Command for RawWriteRegister {
    type IdType = u8;
    type CommandParameters = RawRegisterWrite;
    type ResponseParameters = NoParameters;

    fn id() -> Self::IdType {
        0x0D
    }

    fn invoking_parameters(self) -> Self::CommandParameters {
        self.params
    }
}

/// Driver-level failure, reported across the device boundary as an errno.
#[derive(Debug)]
enum DriverError {
    Command(sx1262::Error),
    Gpio(EspError),
    Timeout,
}

impl DriverError {
    fn code(&self) -> i32 {
        match self {
            Self::Timeout => -errno::ETIMEDOUT,
            Self::Command(_) | Self::Gpio(_) => -errno::EIO,
        }
    }
}

fn bandwidth_code(bw: Bandwidth) -> u8 {
    match bw {
        Bandwidth::Khz125 => 0x04,
        Bandwidth::Khz250 => 0x05,
        Bandwidth::Khz500 => 0x06,
    }
}

fn coding_rate_code(cr: CodingRate) -> u8 {
    match cr {
        CodingRate::Cr4_5 => 0x01,
        CodingRate::Cr4_6 => 0x02,
        CodingRate::Cr4_7 => 0x03,
        CodingRate::Cr4_8 => 0x04,
    }
}

/// Format: [preamble_hi, preamble_lo, header_type, payload_len, crc_on, invert_iq, 0, 0, 0]
fn packet_params(config: &RadioConfig, payload_len: u8) -> PacketParams {
    let implicit_header = config.spreading_factor.value() == 6;
    PacketParams {
        params: [
            (config.preamble_length >> 8) as u8,
            (config.preamble_length & 0xFF) as u8,
            implicit_header as u8,
            payload_len,
            0x01,
            config.iq_inverted as u8,
            0,
            0,
            0,
        ],
    }
}

struct Core {
    device: Device<SpiDeviceDriver<'static, SpiDriver<'static>>>,
    reset: PinDriver<'static, Gpio5, Output>,
    busy: PinDriver<'static, Gpio4, Input>,
    config: Option<RadioConfig>,
}

impl Core {
    fn hardware_reset(&mut self) -> Result<(), DriverError> {
        debug!("Resetting radio");
        self.reset.set_low().map_err(DriverError::Gpio)?;
        FreeRtos::delay_ms(1);
        self.reset.set_high().map_err(DriverError::Gpio)?;
        FreeRtos::delay_ms(10);
        self.wait_busy()
    }

    fn wait_busy(&self) -> Result<(), DriverError> {
        let start = Instant::now();
        let timeout = Duration::from_millis(BUSY_TIMEOUT_MS);
        while self.busy.is_high() {
            if start.elapsed() > timeout {
                return Err(DriverError::Timeout);
            }
            FreeRtos::delay_ms(1);
        }
        Ok(())
    }

    fn run<C>(&mut self, command: C) -> Result<C::ResponseParameters, DriverError>
    where
        C: Command<IdType = u8>,
        C::CommandParameters: ToByteArray<Error = core::convert::Infallible>,
    {
        self.wait_busy()?;
        self.device
            .execute_command(command)
            .map_err(DriverError::Command)
    }

    fn standby(&mut self) -> Result<(), DriverError> {
        self.run(SetStandby {
            config: StandbyConfig::Rc,
        })?;
        Ok(())
    }

    fn clear_irq(&mut self) -> Result<(), DriverError> {
        self.run(ClearIrqStatus {
            irq_mask: IrqMask::all(),
        })?;
        Ok(())
    }

    fn apply(&mut self, config: &RadioConfig) -> Result<(), DriverError> {
        self.standby()?;
        self.run(SetPacketType {
            packet_type: PacketType::LoRa,
        })?;
        self.run(SetRfFrequency {
            config: RfFrequencyConfig {
                frequency: config.frequency_hz,
            },
        })?;
        self.run(RawSetModulationParams {
            params: RawLoRaModParams([
                config.spreading_factor.value(),
                bandwidth_code(config.bandwidth),
                coding_rate_code(config.coding_rate),
                low_data_rate_optimize(config) as u8,
                0,
                0,
                0,
                0,
            ]),
        })?;
        self.run(SetPacketParams {
            params: packet_params(config, MAX_PAYLOAD_LEN as u8),
        })?;
        let sync_word = if config.public_network {
            SYNC_WORD_PUBLIC
        } else {
            SYNC_WORD_PRIVATE
        };
        self.run(RawWriteRegister::new(REG_LORA_SYNC_WORD, sync_word))?;
        self.run(SetPaConfig {
            config: PaConfig {
                duty_cycle: 0x04,
                hp_max: 0x07,
                device_sel: DeviceSelect::Sx1262,
                pa_lut: 0x01,
            },
        })?;
        self.run(SetTxParams {
            params: TxParams {
                power: config.tx_power,
                ramp_time: RampTime::Micros200,
            },
        })?;
        let irq_mask = IrqMask::TX_DONE | IrqMask::RX_DONE | IrqMask::TIMEOUT;
        self.run(SetDioIrqParams {
            config: DioIrqConfig {
                irq_mask,
                dio1_mask: irq_mask,
                dio2_mask: IrqMask::empty(),
                dio3_mask: IrqMask::empty(),
            },
        })?;
        Ok(())
    }

    fn transmit(&mut self, config: &RadioConfig, data: &[u8]) -> Result<(), DriverError> {
        self.standby()?;
        self.run(SetPacketParams {
            params: packet_params(config, data.len() as u8),
        })?;
        self.wait_busy()?;
        self.device
            .write_buffer(0, data)
            .map_err(DriverError::Command)?;
        self.clear_irq()?;
        self.run(SetTx {
            timeout: Timeout(0),
        })?;

        let deadline = time_on_air(data.len(), config) * 2 + Duration::from_millis(TX_MARGIN_MS);
        let start = Instant::now();
        loop {
            let irq = self.run(GetIrqStatus)?;
            if irq.irq_mask.contains(IrqMask::TX_DONE) {
                self.clear_irq()?;
                break;
            }
            if start.elapsed() > deadline {
                let _ = self.standby();
                return Err(DriverError::Timeout);
            }
            FreeRtos::delay_ms(1);
        }
        self.standby()
    }

    /// Read a completed frame if RX_DONE is set.
    fn poll_frame(&mut self) -> Result<Option<(Vec<u8>, i16, i8)>, DriverError> {
        let irq = self.run(GetIrqStatus)?;
        if !irq.irq_mask.contains(IrqMask::RX_DONE) {
            return Ok(None);
        }
        self.clear_irq()?;

        let status = self.run(GetRxBufferStatus)?;
        let len = status.buffer_status.payload_length as usize;
        let offset = status.buffer_status.buffer_pointer;
        let mut data = vec![0u8; len];
        if len > 0 {
            self.wait_busy()?;
            self.device
                .read_buffer(offset, &mut data)
                .map_err(DriverError::Command)?;
        }

        // LoRa mode: status[0]=RSSI (-val/2 dBm), status[1]=SNR (val/4 dB)
        let packet = self.run(GetPacketStatus)?;
        let rssi = -(packet.packet_status.status[0] as i16) / 2;
        let snr = (packet.packet_status.status[1] as i8) / 4;
        Ok(Some((data, rssi, snr)))
    }
}

fn lock(core: &Mutex<Core>) -> MutexGuard<'_, Core> {
    match core.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("SX1262 mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

struct RxWorker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// SX1262 modem.
pub struct Sx1262Device {
    core: Arc<Mutex<Core>>,
    rx: Option<RxWorker>,
    ready: bool,
}

impl Sx1262Device {
    /// Bring up the SPI bus and reset the modem.
    ///
    /// A modem that does not answer after reset is reported through
    /// [`RadioDevice::is_ready`] rather than as an error here.
    pub fn new(
        spi: impl Peripheral<P = SPI2> + 'static,
        sclk: impl Peripheral<P = Gpio12> + 'static,
        mosi: impl Peripheral<P = Gpio11> + 'static,
        miso: impl Peripheral<P = Gpio13> + 'static,
        cs: impl Peripheral<P = Gpio10> + 'static,
        reset: impl Peripheral<P = Gpio5> + 'static,
        busy: impl Peripheral<P = Gpio4> + 'static,
    ) -> Result<Self, EspError> {
        // SX1262 supports up to 16MHz, use conservative 2MHz
        let spi_config = SpiConfig::new().baudrate(2.MHz().into());
        let spi_driver = SpiDriver::new(spi, sclk, mosi, Some(miso), &DriverConfig::new())?;
        let spi_device = SpiDeviceDriver::new(spi_driver, Some(cs), &spi_config)?;

        let mut core = Core {
            device: Device::new(spi_device),
            reset: PinDriver::output(reset)?,
            busy: PinDriver::input(busy)?,
            config: None,
        };

        let ready = match core.hardware_reset().and_then(|_| core.standby()) {
            Ok(()) => {
                info!("SX1262 ready");
                true
            }
            Err(e) => {
                error!("SX1262 did not come up: {:?}", e);
                false
            }
        };

        Ok(Self {
            core: Arc::new(Mutex::new(core)),
            rx: None,
            ready,
        })
    }
}

impl RadioDevice for Sx1262Device {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn configure(&mut self, config: &RadioConfig) -> DeviceResult<()> {
        if !self.ready {
            return Err(-errno::ENODEV);
        }
        if self.rx.is_some() {
            return Err(-errno::EBUSY);
        }
        let mut core = lock(&self.core);
        core.config = None;
        core.apply(config).map_err(|e| {
            warn!("SX1262 configure failed: {:?}", e);
            e.code()
        })?;
        core.config = Some(*config);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> DeviceResult<usize> {
        if !self.ready {
            return Err(-errno::ENODEV);
        }
        if self.rx.is_some() {
            return Err(-errno::EBUSY);
        }
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(-errno::EMSGSIZE);
        }
        let mut core = lock(&self.core);
        let config = core.config.ok_or(-errno::EINVAL)?;
        core.transmit(&config, data).map_err(|e| {
            warn!("SX1262 transmit failed: {:?}", e);
            e.code()
        })?;
        Ok(data.len())
    }

    fn start_receive(&mut self, mut callback: RxCallback) -> DeviceResult<()> {
        if !self.ready {
            return Err(-errno::ENODEV);
        }
        if self.rx.is_some() {
            return Err(-errno::EBUSY);
        }
        {
            let mut core = lock(&self.core);
            if core.config.is_none() {
                return Err(-errno::EINVAL);
            }
            core.clear_irq()
                .and_then(|_| {
                    core.run(SetRx {
                        mode: RxMode::Continuous,
                    })
                    .map(|_| ())
                })
                .map_err(|e| e.code())?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();
            let core = self.core.clone();
            std::thread::Builder::new()
                .name("lora-rx".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        let polled = lock(&core).poll_frame();
                        match polled {
                            Ok(Some((data, rssi, snr))) => {
                                callback(RxEvent::Frame(RxFrame {
                                    data: &data,
                                    rssi,
                                    snr,
                                }));
                            }
                            Ok(None) => {}
                            Err(e) => warn!("SX1262 receive poll failed: {:?}", e),
                        }
                        FreeRtos::delay_ms(RX_POLL_MS);
                    }
                    callback(RxEvent::Cancelled);
                })
                .map_err(|e| {
                    error!("Failed to spawn receive thread: {}", e);
                    -errno::EIO
                })?
        };

        self.rx = Some(RxWorker { stop, thread });
        debug!("SX1262 continuous receive armed");
        Ok(())
    }

    fn stop_receive(&mut self) -> DeviceResult<()> {
        let Some(worker) = self.rx.take() else {
            return Ok(());
        };
        worker.stop.store(true, Ordering::Release);
        if worker.thread.join().is_err() {
            error!("Receive thread panicked");
        }
        // The callback went with the thread, so receive is over either way.
        // The next configure leaves RX mode through its own standby.
        if let Err(e) = lock(&self.core).standby() {
            warn!("SX1262 standby after receive failed: {:?}", e);
        }
        debug!("SX1262 receive stopped");
        Ok(())
    }
}
