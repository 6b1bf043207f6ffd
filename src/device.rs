//! TMF8828 bring-up and result polling.

#[cfg(not(feature = "async"))]
use embedded_hal::{delay::DelayNs, i2c::I2c};
#[cfg(feature = "async")]
use embedded_hal_async::{delay::DelayNs, i2c::I2c};

use embedded_hal::digital::OutputPin;

use crate::bootloader::{self, CommandFrame, PatchImage, Response};
use crate::bus::{BusControl, BusManager};
use crate::capture::{CaptureCycle, CaptureStats};
use crate::frame::{self, FrameConfig, RESULT_FRAME_LEN};
use crate::grid::DepthFrame;
use crate::register::{
    ActiveRange, AppId, BootloaderCommand, Command, Register, CHIP_ID, CHIP_ID_MASK, ENABLE_CPU_READY, ENABLE_PON,
    INT_RESULT_READY, MODE_8X8, PROBE_ADDRESSES, REV_ID_MASK,
};
use crate::{Error, ProtocolError, Stage};

/// Wait after driving the enable line before the first transfer.
const POWER_UP_DELAY_MS: u32 = 3;
const CPU_READY_POLLS: u32 = 80;
const CPU_READY_INTERVAL_MS: u32 = 2;
const BOOTLOADER_TIMEOUT_MS: u32 = 30;
const RAM_APP_POLLS: u32 = 120;
const RAM_APP_INTERVAL_MS: u32 = 2;
/// Settle time for a freshly started application before it takes commands.
const APP_SETTLE_MS: u32 = 100;
const STOP_TIMEOUT_MS: u32 = 30;
const MODE_SWITCH_TIMEOUT_MS: u32 = 50;
const MODE_POLLS: u32 = 40;
const SHORT_RANGE_SETTLE_MS: u32 = 3;
const LOAD_CONFIG_TIMEOUT_MS: u32 = 50;
const WRITE_PAGE_TIMEOUT_MS: u32 = 60;
const CONFIG_ATTEMPTS: u32 = 3;
const CONFIG_BACKOFF_MS: u32 = 10;
const MEASURE_TIMEOUT_MS: u32 = 30;

/// Boot-time hook that forces the device's enable line active.
pub trait PowerEnable {
    /// Drives the enable line active.
    fn force_enable(&mut self);
}

/// Enable line hard-wired or handled elsewhere.
impl PowerEnable for () {
    fn force_enable(&mut self) {}
}

/// Enable line on a GPIO, active high.
#[derive(Debug)]
pub struct EnablePin<P>(pub P);

impl<P: OutputPin> PowerEnable for EnablePin<P> {
    fn force_enable(&mut self) {
        if self.0.set_high().is_err() {
            warn!("Failed to drive enable pin");
        }
    }
}

/// Measurement setup written during configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MeasurementConfig {
    /// Measurement period in milliseconds.
    pub period_ms: u16,
    /// Iterations per measurement, in thousands.
    pub kilo_iterations: u16,
    /// Lower bound of the interrupt threshold window, mm.
    pub low_threshold_mm: u16,
    /// Upper bound of the interrupt threshold window, mm.
    pub high_threshold_mm: u16,
    /// Zones that raise the result interrupt (18 bits).
    pub interrupt_mask: u32,
    /// Consecutive hits needed to raise the interrupt.
    pub persistence: u8,
    /// SPAD map id; 15 selects the 8×8 map.
    pub spad_map: u8,
    /// Algorithm setting 0; bit 7 enables logarithmic confidence.
    pub alg_setting: u8,
    /// Request short-range accuracy mode when the application supports it.
    pub short_range: bool,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            period_ms: 24,
            kilo_iterations: 64,
            low_threshold_mm: 0,
            high_threshold_mm: 0xFFFF,
            interrupt_mask: 0x3_FFFF,
            persistence: 0,
            spad_map: 15,
            alg_setting: 0x84,
            short_range: true,
        }
    }
}

impl MeasurementConfig {
    /// The 12-byte common configuration block starting at [`Register::PeriodMs`].
    #[must_use]
    pub fn common_block(&self) -> [u8; 12] {
        let period = self.period_ms.to_le_bytes();
        let iterations = self.kilo_iterations.to_le_bytes();
        let low = self.low_threshold_mm.to_le_bytes();
        let high = self.high_threshold_mm.to_le_bytes();
        let mask = self.interrupt_mask.to_le_bytes();
        [
            period[0],
            period[1],
            iterations[0],
            iterations[1],
            low[0],
            low[1],
            high[0],
            high[1],
            mask[0],
            mask[1],
            mask[2],
            self.persistence,
        ]
    }
}

/// Identity read during probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceInfo {
    /// Chip id, masked to six bits.
    pub chip_id: u8,
    /// Silicon revision, masked to three bits.
    pub rev_id: u8,
}

/// Where the device was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceSession {
    /// Bus index within the [`BusManager`].
    pub bus: usize,
    /// 7-bit I2C address.
    pub address: u8,
    /// Identity.
    pub info: DeviceInfo,
}

/// Bring-up progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    /// No device selected.
    #[default]
    Unprobed,
    /// Device answered with the expected identity.
    Probed {
        /// Masked chip id.
        chip_id: u8,
        /// Masked revision.
        rev_id: u8,
    },
    /// Power-on bit set.
    Enabled,
    /// Device CPU finished booting.
    CpuReady,
    /// Uploading the RAM patch to the bootloader.
    BootloaderPatching,
    /// RAM application started from the patch.
    RamAppStarted,
    /// Measurement application confirmed.
    AppReady,
    /// Configured for 8×8 ranging.
    Configured8x8,
    /// Continuous ranging.
    Measuring,
}

/// Result of one [`Tmf8828::poll_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FramePoll {
    /// A sub-capture was merged.
    Frame {
        /// Best-known grid.
        grid: DepthFrame,
        /// All four sub-captures of the sequence have contributed.
        complete: bool,
        /// Merge bookkeeping.
        stats: CaptureStats,
    },
    /// No result was ready, or the frame was malformed and discarded.
    NoData,
}

/// TMF8828 driver over a set of candidate buses.
///
/// ```rust,no_run
/// use embedded_hal_mock::eh1::{delay::NoopDelay, i2c::Mock};
/// use tmf8828_fill::{BusManager, BusPort, FramePoll, Tmf8828};
///
/// let ports = [
///     BusPort::new("i2c0", Mock::new(&[]), ()),
///     BusPort::new("i2c1", Mock::new(&[]), ()),
/// ];
/// let mut sensor = Tmf8828::new(BusManager::new(ports, NoopDelay), ());
/// sensor.bring_up().unwrap();
/// if let FramePoll::Frame { grid, complete, .. } = sensor.poll_frame().unwrap() {
///     println!("complete={} nearest={:?}", complete, grid.nearest());
/// }
/// ```
pub struct Tmf8828<I2C, C, D, P, const N: usize> {
    bus: BusManager<I2C, C, D, N>,
    power: P,
    patch: Option<PatchImage<'static>>,
    frame_config: FrameConfig,
    measurement: MeasurementConfig,
    session: Option<DeviceSession>,
    state: DeviceState,
    capture: CaptureCycle,
    discarded: u32,
}

#[maybe_async_cfg::maybe(
    sync(cfg(not(feature = "async")), keep_self),
    async(feature = "async", keep_self)
)]
impl<I2C, C, E, D, P, const N: usize> Tmf8828<I2C, C, D, P, N>
where
    I2C: I2c<Error = E>,
    E: embedded_hal::i2c::Error,
    C: BusControl,
    D: DelayNs,
    P: PowerEnable,
{
    /// Creates a driver with default frame and measurement configuration.
    ///
    /// Nothing touches the bus until [`bring_up`](Self::bring_up).
    pub fn new(bus: BusManager<I2C, C, D, N>, power: P) -> Self {
        Self {
            bus,
            power,
            patch: None,
            frame_config: FrameConfig::default(),
            measurement: MeasurementConfig::default(),
            session: None,
            state: DeviceState::Unprobed,
            capture: CaptureCycle::new(),
            discarded: 0,
        }
    }

    /// Patch uploaded when the device boots into its bootloader.
    #[must_use]
    pub fn with_patch(mut self, patch: PatchImage<'static>) -> Self {
        self.patch = Some(patch);
        self
    }

    /// Replaces the frame decoding and reassembly configuration.
    #[must_use]
    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = config;
        self
    }

    /// Replaces the measurement configuration written during bring-up.
    #[must_use]
    pub fn with_measurement_config(mut self, config: MeasurementConfig) -> Self {
        self.measurement = config;
        self
    }

    /// Bring-up progress.
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Bus and address of the device, once probed.
    pub fn session(&self) -> Option<DeviceSession> {
        self.session
    }

    /// Identity of the device, once probed.
    pub fn info(&self) -> Option<DeviceInfo> {
        self.session.map(|s| s.info)
    }

    /// Reassembly state.
    pub fn capture(&self) -> &CaptureCycle {
        &self.capture
    }

    /// Frames discarded as malformed since creation.
    pub fn discarded_frames(&self) -> u32 {
        self.discarded
    }

    /// Consumes the driver, returning the bus manager and power hook.
    pub fn release(self) -> (BusManager<I2C, C, D, N>, P) {
        (self.bus, self.power)
    }

    /// Discovers, boots, configures and starts the device.
    ///
    /// Runs to completion or fails; on failure the session is discarded and
    /// the caller decides whether to try again.
    ///
    /// # Errors
    ///
    /// * `Err(Error::NoDevice)` - no candidate bus and address answered with the TMF8828 identity
    /// * `Err(Error::Timeout(stage))` - a bounded poll expired
    /// * `Err(Error::Protocol(_))` - the device answered with an unexpected status or app id
    /// * `Err(Error::I2cError(E))` - a transfer failed after recovery
    pub async fn bring_up(&mut self) -> Result<(), Error<E>> {
        self.session = None;
        self.state = DeviceState::Unprobed;
        self.capture.reset();

        let result = self.run_bring_up().await;
        if result.is_err() {
            error!("Bring-up failed in state {:?}", self.state);
            self.session = None;
            self.state = DeviceState::Unprobed;
        }
        result
    }

    async fn run_bring_up(&mut self) -> Result<(), Error<E>> {
        self.power.force_enable();
        self.bus.delay_ms(POWER_UP_DELAY_MS).await;

        let session = self.probe().await?;
        self.session = Some(session);
        self.state = DeviceState::Probed {
            chip_id: session.info.chip_id,
            rev_id: session.info.rev_id,
        };

        let enable = self.read_reg(Register::Enable).await?;
        self.write_reg(Register::Enable, enable | ENABLE_PON).await?;
        self.state = DeviceState::Enabled;

        self.wait_cpu_ready().await?;
        self.state = DeviceState::CpuReady;

        let mut app = AppId::from(self.read_reg(Register::AppId).await?);
        if app == AppId::Bootloader {
            let patch = match self.patch {
                Some(patch) => patch,
                None => {
                    error!("Bootloader running and no patch configured");
                    return Err(Error::Protocol(ProtocolError::MissingPatch));
                }
            };
            info!("Bootloader detected, uploading {} byte patch", patch.data.len());
            self.state = DeviceState::BootloaderPatching;
            self.upload_patch(&patch).await?;
            self.start_ram_app().await?;
            self.state = DeviceState::RamAppStarted;
            app = AppId::from(self.read_reg(Register::AppId).await?);
        }
        if app != AppId::Application {
            let id = u8::from(app);
            error!("Unexpected app id {:#x}", id);
            return Err(Error::Protocol(ProtocolError::UnexpectedAppId(id)));
        }
        self.state = DeviceState::AppReady;
        self.bus.delay_ms(APP_SETTLE_MS).await;

        self.stop_and_clear().await;
        self.switch_to_8x8().await?;
        if self.measurement.short_range {
            self.enable_short_range().await?;
        }
        self.load_config().await?;
        self.state = DeviceState::Configured8x8;

        self.start_measurement().await?;
        self.state = DeviceState::Measuring;
        info!(
            "TMF8828 chip {:#x} rev {} measuring on {} at {:#x}",
            session.info.chip_id,
            session.info.rev_id,
            self.bus.name(session.bus),
            session.address
        );
        Ok(())
    }

    /// Scans every bus at every candidate address for the TMF8828 identity.
    async fn probe(&mut self) -> Result<DeviceSession, Error<E>> {
        for bus in 0..N {
            for &address in &PROBE_ADDRESSES {
                let mut id = [0u8];
                let mut rev = [0u8];
                let read = match self.bus.read(bus, address, Register::Id.into(), &mut id).await {
                    Ok(()) => self.bus.read(bus, address, Register::RevId.into(), &mut rev).await,
                    Err(e) => Err(e),
                };
                match read {
                    Ok(()) => {}
                    Err(Error::BusUnavailable(_)) => {
                        warn!("{} unavailable, skipping", self.bus.name(bus));
                        break;
                    }
                    Err(_) => {
                        debug!("No answer on {} at {:#x}", self.bus.name(bus), address);
                        continue;
                    }
                }
                if id[0] & CHIP_ID_MASK != CHIP_ID {
                    warn!("{} at {:#x} has unexpected id {:#x}", self.bus.name(bus), address, id[0]);
                    continue;
                }
                let info = DeviceInfo {
                    chip_id: id[0] & CHIP_ID_MASK,
                    rev_id: rev[0] & REV_ID_MASK,
                };
                info!("Found TMF8828 on {} at {:#x}", self.bus.name(bus), address);
                return Ok(DeviceSession { bus, address, info });
            }
        }
        error!("TMF8828 not found on any bus");
        Err(Error::NoDevice)
    }

    async fn wait_cpu_ready(&mut self) -> Result<(), Error<E>> {
        for _ in 0..CPU_READY_POLLS {
            if self.read_reg(Register::Enable).await? & ENABLE_CPU_READY != 0 {
                return Ok(());
            }
            self.bus.delay_ms(CPU_READY_INTERVAL_MS).await;
        }
        error!("CPU ready timeout");
        Err(Error::Timeout(Stage::CpuReady))
    }

    async fn upload_patch(&mut self, patch: &PatchImage<'static>) -> Result<(), Error<E>> {
        self.bootloader_command(BootloaderCommand::AddrRam, &patch.load_address.to_le_bytes())
            .await?;
        for (index, chunk) in patch.chunks().enumerate() {
            if let Err(e) = self.bootloader_command(BootloaderCommand::WriteRam, chunk).await {
                error!("Patch chunk {} of {} failed", index, patch.chunk_count());
                return Err(e);
            }
        }
        debug!("Uploaded {} patch chunks", patch.chunk_count());
        Ok(())
    }

    /// Sends one bootloader frame and waits for its validated response.
    async fn bootloader_command(&mut self, cmd: BootloaderCommand, payload: &[u8]) -> Result<(), Error<E>> {
        let frame = CommandFrame::new(cmd.into(), payload).map_err(Error::Protocol)?;
        self.write_block(Register::CmdStat, frame.as_bytes()).await?;

        let mut rx = [0u8; bootloader::response_len(0)];
        for _ in 0..=BOOTLOADER_TIMEOUT_MS {
            self.read_block(Register::CmdStat, &mut rx).await?;
            match bootloader::parse_response(frame.command(), 0, &rx) {
                Ok(Response::Pending) => self.bus.delay_ms(1).await,
                Ok(Response::Done(_)) => return Ok(()),
                Err(e) => {
                    error!("Bootloader command {:#x} rejected: {:?}", frame.command(), e);
                    return Err(Error::Protocol(e));
                }
            }
        }
        error!("Bootloader command {:#x} timeout", frame.command());
        Err(Error::Timeout(Stage::BootloaderResponse(frame.command())))
    }

    /// Remaps to the RAM application and waits for its app id.
    async fn start_ram_app(&mut self) -> Result<(), Error<E>> {
        let frame = CommandFrame::new(BootloaderCommand::RamRemap.into(), &[]).map_err(Error::Protocol)?;
        self.write_block(Register::CmdStat, frame.as_bytes()).await?;
        for _ in 0..RAM_APP_POLLS {
            // reads fail while the device restarts
            if let Ok(id) = self.read_reg(Register::AppId).await {
                if AppId::from(id) == AppId::Application {
                    info!("RAM application started");
                    return Ok(());
                }
            }
            self.bus.delay_ms(RAM_APP_INTERVAL_MS).await;
        }
        error!("RAM application did not start");
        Err(Error::Timeout(Stage::RamApp))
    }

    /// Writes `cmd` and polls the status register until it settles.
    ///
    /// The measure command is acknowledged by either 0 or 1; every other
    /// command by `expected`. A status above 1 that is not the command
    /// itself is a failure.
    async fn send_command(&mut self, cmd: Command, expected: u8, timeout_ms: u32) -> Result<(), Error<E>> {
        let code = u8::from(cmd);
        self.write_reg(Register::CmdStat, code).await?;
        for _ in 0..=timeout_ms {
            let status = self.read_reg(Register::CmdStat).await?;
            let acked = match cmd {
                Command::Measure => status <= 1,
                _ => status == expected,
            };
            if acked {
                return Ok(());
            }
            if status != code && status > 1 {
                warn!("Command {:#x} failed with status {:#x}", code, status);
                return Err(Error::Protocol(ProtocolError::CommandFailed { command: code, status }));
            }
            self.bus.delay_ms(1).await;
        }
        warn!("Command {:#x} timeout", code);
        Err(Error::Timeout(Stage::Command(code)))
    }

    async fn stop_and_clear(&mut self) {
        if self.send_command(Command::Stop, 0, STOP_TIMEOUT_MS).await.is_err() {
            debug!("Stop not acknowledged");
        }
        if self.send_command(Command::ClearStatus, 0, STOP_TIMEOUT_MS).await.is_err() {
            debug!("Clear status not acknowledged");
        }
    }

    async fn switch_to_8x8(&mut self) -> Result<(), Error<E>> {
        self.send_command(Command::SwitchTo8x8, 0, MODE_SWITCH_TIMEOUT_MS).await?;
        for _ in 0..MODE_POLLS {
            if self.read_reg(Register::Mode).await? == MODE_8X8 {
                return Ok(());
            }
            self.bus.delay_ms(1).await;
        }
        error!("Mode switch to 8x8 did not complete");
        Err(Error::Timeout(Stage::ModeSwitch))
    }

    async fn enable_short_range(&mut self) -> Result<(), Error<E>> {
        match ActiveRange::from(self.read_reg(Register::ActiveRange).await?) {
            ActiveRange::Unsupported => {
                info!("Short range not supported by this application");
                return Ok(());
            }
            ActiveRange::Short => return Ok(()),
            ActiveRange::Long | ActiveRange::Unknown(_) => {}
        }
        self.write_reg(Register::ActiveRange, ActiveRange::Short.into()).await?;
        self.bus.delay_ms(SHORT_RANGE_SETTLE_MS).await;
        let active = self.read_reg(Register::ActiveRange).await?;
        if ActiveRange::from(active) == ActiveRange::Short {
            info!("Short range enabled");
        } else {
            warn!("Short range request not applied, active range {:#x}", active);
        }
        Ok(())
    }

    /// Loads the common config page, writes the measurement setup and commits it.
    async fn load_config(&mut self) -> Result<(), Error<E>> {
        let block = self.measurement.common_block();
        let mut last = Error::Timeout(Stage::Command(Command::WriteConfigPage.into()));
        for attempt in 0..CONFIG_ATTEMPTS {
            if let Err(e) = self.send_command(Command::LoadCommonConfig, 0, LOAD_CONFIG_TIMEOUT_MS).await {
                debug!("Load common config attempt {} failed", attempt);
                last = e;
                self.bus.delay_ms(CONFIG_BACKOFF_MS).await;
                continue;
            }
            self.write_block(Register::PeriodMs, &block).await?;
            self.write_reg(Register::SpadMapId, self.measurement.spad_map).await?;
            self.write_reg(Register::HistDump, 0).await?;
            self.write_reg(Register::AlgSetting0, self.measurement.alg_setting).await?;
            match self.send_command(Command::WriteConfigPage, 0, WRITE_PAGE_TIMEOUT_MS).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Write config page attempt {} failed", attempt);
                    last = e;
                    self.bus.delay_ms(CONFIG_BACKOFF_MS).await;
                }
            }
        }
        error!("Failed to load 8x8 config");
        Err(last)
    }

    async fn start_measurement(&mut self) -> Result<(), Error<E>> {
        self.write_reg(Register::IntStatus, INT_RESULT_READY).await?;
        self.write_reg(Register::IntEnable, INT_RESULT_READY).await?;
        self.send_command(Command::Measure, 1, MEASURE_TIMEOUT_MS).await
    }

    /// Stops ranging, drops all reassembly state and starts again.
    ///
    /// # Errors
    ///
    /// * `Err(Error::NotMeasuring)` - bring-up has not completed
    /// * `Err(Error::I2cError(E))`, `Err(Error::Timeout(_))`, `Err(Error::Protocol(_))` - the restart failed
    pub async fn restart_measurement(&mut self) -> Result<(), Error<E>> {
        if self.state != DeviceState::Measuring {
            return Err(Error::NotMeasuring);
        }
        info!("Restarting measurement");
        self.stop_and_clear().await;
        self.capture.reset();
        self.start_measurement().await
    }

    /// Reads one sub-capture if the device has one ready and merges it.
    ///
    /// Malformed frames are logged, counted and reported as
    /// [`FramePoll::NoData`]; the held grid is kept.
    ///
    /// # Errors
    ///
    /// * `Err(Error::NotMeasuring)` - bring-up has not completed
    /// * `Err(Error::I2cError(E))` - a transfer failed after recovery
    pub async fn poll_frame(&mut self) -> Result<FramePoll, Error<E>> {
        if self.state != DeviceState::Measuring {
            return Err(Error::NotMeasuring);
        }
        if self.read_reg(Register::IntStatus).await? & INT_RESULT_READY == 0 {
            return Ok(FramePoll::NoData);
        }
        if self.write_reg(Register::IntStatus, INT_RESULT_READY).await.is_err() {
            debug!("Failed to clear result interrupt");
        }

        let mut raw = [0u8; RESULT_FRAME_LEN];
        self.read_block(Register::ConfigResult, &mut raw).await?;
        let frame = match frame::decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.discarded = self.discarded.wrapping_add(1);
                warn!("Discarding frame: {}", e);
                return Ok(FramePoll::NoData);
            }
        };
        let (grid, complete, stats) = self.capture.merge(&frame, &self.frame_config);
        Ok(FramePoll::Frame { grid, complete, stats })
    }

    fn session_or_err(&self) -> Result<DeviceSession, Error<E>> {
        self.session.ok_or(Error::NoDevice)
    }

    async fn read_reg(&mut self, reg: Register) -> Result<u8, Error<E>> {
        let mut buf = [0u8];
        self.read_block(reg, &mut buf).await?;
        Ok(buf[0])
    }

    async fn write_reg(&mut self, reg: Register, value: u8) -> Result<(), Error<E>> {
        self.write_block(reg, &[value]).await
    }

    async fn read_block(&mut self, reg: Register, buf: &mut [u8]) -> Result<(), Error<E>> {
        let s = self.session_or_err()?;
        self.bus.read(s.bus, s.address, reg.into(), buf).await
    }

    async fn write_block(&mut self, reg: Register, bytes: &[u8]) -> Result<(), Error<E>> {
        let s = self.session_or_err()?;
        self.bus.write(s.bus, s.address, reg.into(), bytes).await
    }
}
