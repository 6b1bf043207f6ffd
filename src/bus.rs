//! Register access over one of several candidate I2C buses, with stuck-bus recovery.
//!
//! Each [`BusPort`] pairs an I2C peripheral with a [`BusControl`] that knows how
//! to bring the peripheral's clock up and how to take its pins over as plain
//! GPIOs. A port is initialised lazily on first use. When a transfer reports a
//! busy bus the manager bit-bangs the bus free, re-initialises the peripheral
//! and retries the transfer exactly once.

#[cfg(not(feature = "async"))]
use embedded_hal::{delay::DelayNs, i2c::I2c};
#[cfg(feature = "async")]
use embedded_hal_async::{delay::DelayNs, i2c::I2c};

use embedded_hal::digital::OutputPin;
use embedded_hal::i2c::{Error as _, ErrorKind};

use crate::{bootloader, Error};

/// Clock pulses issued to release a target holding SDA low.
pub const RECOVERY_CLOCK_PULSES: u32 = 18;

/// Half period of the recovery clock, in microseconds.
pub const RECOVERY_HALF_PERIOD_US: u32 = 5;

/// Time both lines are held high before pulsing, in microseconds.
pub const RECOVERY_SETTLE_US: u32 = 10;

/// Longest register write: one register byte plus a full bootloader frame.
pub const MAX_WRITE_LEN: usize = 1 + bootloader::MAX_FRAME_LEN;

/// Platform hooks for one bus: peripheral bring-up and GPIO takeover of its lines.
pub trait BusControl {
    /// Routes a clock to the peripheral and configures it for master mode.
    ///
    /// Returns `false` when the clock source is not running.
    fn init_peripheral(&mut self) -> bool;
    /// Switches SDA and SCL to open-drain GPIO outputs.
    fn enter_gpio_mode(&mut self);
    /// Drives SCL.
    fn set_scl(&mut self, high: bool);
    /// Drives SDA.
    fn set_sda(&mut self, high: bool);
    /// Hands SDA and SCL back to the I2C peripheral.
    fn enter_i2c_mode(&mut self);
}

/// No recovery: the peripheral is always ready and the lines cannot be driven.
impl BusControl for () {
    fn init_peripheral(&mut self) -> bool {
        true
    }
    fn enter_gpio_mode(&mut self) {}
    fn set_scl(&mut self, _high: bool) {}
    fn set_sda(&mut self, _high: bool) {}
    fn enter_i2c_mode(&mut self) {}
}

/// [`BusControl`] over two GPIO handles that are already open-drain outputs.
///
/// Pin mode switching is a no-op; boards that mux the pins between GPIO and
/// I2C should implement [`BusControl`] directly.
#[derive(Debug)]
pub struct PinBusControl<SCL, SDA> {
    scl: SCL,
    sda: SDA,
}

impl<SCL: OutputPin, SDA: OutputPin> PinBusControl<SCL, SDA> {
    /// Wraps the SCL and SDA lines.
    pub fn new(scl: SCL, sda: SDA) -> Self {
        Self { scl, sda }
    }

    /// Returns the pins.
    pub fn release(self) -> (SCL, SDA) {
        (self.scl, self.sda)
    }
}

impl<SCL: OutputPin, SDA: OutputPin> BusControl for PinBusControl<SCL, SDA> {
    fn init_peripheral(&mut self) -> bool {
        true
    }

    fn enter_gpio_mode(&mut self) {}

    fn set_scl(&mut self, high: bool) {
        // best effort, a failed pin write only weakens the recovery
        let _ = if high {
            self.scl.set_high()
        } else {
            self.scl.set_low()
        };
    }

    fn set_sda(&mut self, high: bool) {
        let _ = if high {
            self.sda.set_high()
        } else {
            self.sda.set_low()
        };
    }

    fn enter_i2c_mode(&mut self) {}
}

/// One candidate bus.
#[derive(Debug)]
pub struct BusPort<I2C, C> {
    name: &'static str,
    i2c: I2C,
    control: C,
    initialized: bool,
}

impl<I2C, C> BusPort<I2C, C> {
    /// Creates a port; nothing touches the hardware until the first transfer.
    pub fn new(name: &'static str, i2c: I2C, control: C) -> Self {
        Self {
            name,
            i2c,
            control,
            initialized: false,
        }
    }

    /// Label used in log messages.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the peripheral has been initialised since creation or the last recovery.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Consumes the port, returning the peripheral and its control hooks.
    pub fn release(self) -> (I2C, C) {
        (self.i2c, self.control)
    }
}

fn is_busy<E: embedded_hal::i2c::Error>(error: &E) -> bool {
    matches!(error.kind(), ErrorKind::Bus | ErrorKind::ArbitrationLoss)
}

/// Owns the candidate buses and the shared delay source.
pub struct BusManager<I2C, C, D, const N: usize> {
    ports: [BusPort<I2C, C>; N],
    delay: D,
}

#[maybe_async_cfg::maybe(
    sync(cfg(not(feature = "async")), keep_self),
    async(feature = "async", keep_self)
)]
impl<I2C, C, E, D, const N: usize> BusManager<I2C, C, D, N>
where
    I2C: I2c<Error = E>,
    E: embedded_hal::i2c::Error,
    C: BusControl,
    D: DelayNs,
{
    /// Creates a manager over `ports`, indexed in probe order.
    pub fn new(ports: [BusPort<I2C, C>; N], delay: D) -> Self {
        Self { ports, delay }
    }

    /// Number of candidate buses.
    pub fn bus_count(&self) -> usize {
        N
    }

    /// Label of bus `bus`, or `"?"` when out of range.
    pub fn name(&self, bus: usize) -> &'static str {
        self.ports.get(bus).map_or("?", BusPort::name)
    }

    /// Read-only view of a port.
    pub fn port(&self, bus: usize) -> Option<&BusPort<I2C, C>> {
        self.ports.get(bus)
    }

    /// Reads `buf.len()` bytes starting at register `reg` of device `addr` on `bus`.
    ///
    /// # Errors
    ///
    /// * `Err(Error::BusUnavailable(bus))` - `bus` is out of range or its clock is down
    /// * `Err(Error::I2cError(E))` - the transfer failed, after one recovery if the bus was busy
    pub async fn read(&mut self, bus: usize, addr: u8, reg: u8, buf: &mut [u8]) -> Result<(), Error<E>> {
        self.ensure_init(bus)?;
        match self.ports[bus].i2c.write_read(addr, &[reg], buf).await {
            Ok(()) => Ok(()),
            Err(e) if is_busy(&e) => {
                warn!("{} busy reading {:#x}@{:#x}, recovering", self.ports[bus].name, reg, addr);
                self.recover(bus).await;
                self.ensure_init(bus)?;
                self.ports[bus]
                    .i2c
                    .write_read(addr, &[reg], buf)
                    .await
                    .map_err(Error::I2cError)
            }
            Err(e) => Err(Error::I2cError(e)),
        }
    }

    /// Writes `bytes` starting at register `reg` of device `addr` on `bus`.
    ///
    /// # Errors
    ///
    /// * `Err(Error::InvalidArgument)` - `bytes` is longer than [`MAX_WRITE_LEN`]` - 1`
    /// * `Err(Error::BusUnavailable(bus))` - `bus` is out of range or its clock is down
    /// * `Err(Error::I2cError(E))` - the transfer failed, after one recovery if the bus was busy
    pub async fn write(&mut self, bus: usize, addr: u8, reg: u8, bytes: &[u8]) -> Result<(), Error<E>> {
        if bytes.len() >= MAX_WRITE_LEN {
            error!("Register write of {} bytes is too long", bytes.len());
            return Err(Error::InvalidArgument);
        }
        let mut buffer = [0u8; MAX_WRITE_LEN];
        buffer[0] = reg;
        buffer[1..=bytes.len()].copy_from_slice(bytes);
        let frame = &buffer[..=bytes.len()];

        self.ensure_init(bus)?;
        match self.ports[bus].i2c.write(addr, frame).await {
            Ok(()) => Ok(()),
            Err(e) if is_busy(&e) => {
                warn!("{} busy writing {:#x}@{:#x}, recovering", self.ports[bus].name, reg, addr);
                self.recover(bus).await;
                self.ensure_init(bus)?;
                self.ports[bus]
                    .i2c
                    .write(addr, frame)
                    .await
                    .map_err(Error::I2cError)
            }
            Err(e) => Err(Error::I2cError(e)),
        }
    }

    /// Clocks a stuck bus free and returns its pins to the peripheral.
    ///
    /// Drives both lines high, pulses SCL [`RECOVERY_CLOCK_PULSES`] times,
    /// issues a STOP condition and marks the port for re-initialisation. This
    /// never reports success; only a following transfer can tell.
    pub async fn recover(&mut self, bus: usize) {
        let port = match self.ports.get_mut(bus) {
            Some(port) => port,
            None => return,
        };
        let control = &mut port.control;

        control.enter_gpio_mode();
        control.set_sda(true);
        control.set_scl(true);
        self.delay.delay_us(RECOVERY_SETTLE_US).await;

        for _ in 0..RECOVERY_CLOCK_PULSES {
            control.set_scl(false);
            self.delay.delay_us(RECOVERY_HALF_PERIOD_US).await;
            control.set_scl(true);
            self.delay.delay_us(RECOVERY_HALF_PERIOD_US).await;
        }

        // STOP: SDA rises while SCL is high
        control.set_sda(false);
        self.delay.delay_us(RECOVERY_HALF_PERIOD_US).await;
        control.set_scl(true);
        self.delay.delay_us(RECOVERY_HALF_PERIOD_US).await;
        control.set_sda(true);
        self.delay.delay_us(RECOVERY_HALF_PERIOD_US).await;

        control.enter_i2c_mode();
        port.initialized = false;
        debug!("{} recovery sequence issued", port.name);
    }

    /// Blocks for `ms` milliseconds.
    pub async fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms).await;
    }

    /// Blocks for `us` microseconds.
    pub async fn delay_us(&mut self, us: u32) {
        self.delay.delay_us(us).await;
    }

    /// Consumes the manager, returning the ports and delay.
    pub fn release(self) -> ([BusPort<I2C, C>; N], D) {
        (self.ports, self.delay)
    }

    fn ensure_init(&mut self, bus: usize) -> Result<(), Error<E>> {
        let port = match self.ports.get_mut(bus) {
            Some(port) => port,
            None => return Err(Error::BusUnavailable(bus)),
        };
        if port.initialized {
            return Ok(());
        }
        if !port.control.init_peripheral() {
            error!("{} clock source is not running", port.name);
            return Err(Error::BusUnavailable(bus));
        }
        port.initialized = true;
        Ok(())
    }
}
