//! # TMF8828 Fill-Level Monitor Core
//!
//! This crate provides a `no_std` driver and signal-processing core for a
//! fill-level monitor built on ams-OSRAM's TMF8828 8×8 multizone time-of-flight
//! sensor. It brings the device up over I2C (including the bootloader RAM patch
//! and stuck-bus recovery), reassembles the four sub-captures of each 8×8 scan
//! into one depth grid, and turns that grid into a distance, a fullness fraction
//! and a debounced alert level.
//!
//! Bus-facing methods are blocking by default and become `async` with the
//! `async` feature. Logging goes to `log` or `defmt` when the matching feature
//! is enabled.
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use tmf8828_fill::{BusManager, BusPort, Monitor, PipelineConfig, Tmf8828};
//!
//! let ports = [BusPort::new("i2c2", embedded_hal_mock::eh1::i2c::Mock::new(&[]), ())];
//! let delay = embedded_hal_mock::eh1::delay::NoopDelay;
//! let sensor = Tmf8828::new(BusManager::new(ports, delay), ());
//!
//! let mut monitor = Monitor::new(sensor, &PipelineConfig::default());
//! monitor.bring_up().unwrap();
//!
//! loop {
//!     let report = monitor.tick().unwrap();
//!     println!(
//!         "{} mm, fullness {}/1024, level {:?}",
//!         report.estimate.mm, report.estimate.fullness_q10, report.alert.level
//!     );
//!     if report.alert.popup_should_show {
//!         monitor.dismiss_popup();
//!     }
//! }
//! ```
//!
//! ## Processing without a device
//!
//! ```rust
//! use tmf8828_fill::{AlertLevel, DepthFrame, Pipeline, GRID_CELLS};
//!
//! let mut pipeline = Pipeline::default();
//! let report = pipeline.process(&DepthFrame::from_mm([250; GRID_CELLS]), true);
//! assert_eq!(report.estimate.mm, 250);
//! assert_eq!(report.alert.level, AlertLevel::Full);
//! ```
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod fmt; // <-- must be first module!

pub mod alert;
pub mod bootloader;
pub mod bus;
pub mod capture;
pub mod denoise;
pub mod device;
pub mod estimator;
pub mod frame;
pub mod grid;
pub mod pipeline;
pub mod register;
pub mod zone_map;

pub use alert::{AlertConfig, AlertLevel, AlertMachine, AlertStatus, Observation};
pub use bootloader::PatchImage;
pub use bus::{BusControl, BusManager, BusPort, PinBusControl};
pub use capture::{CaptureCycle, CaptureStats};
pub use denoise::{DenoiseConfig, Denoiser};
pub use device::{
    DeviceInfo, DeviceSession, DeviceState, EnablePin, FramePoll, MeasurementConfig, PowerEnable, Tmf8828,
};
pub use estimator::{fullness_from_mm, Estimate, Estimator, EstimatorConfig};
pub use frame::{CloseRangeCalibration, DataError, FrameConfig, ObjectPolicy};
pub use grid::{DepthFrame, GRID_CELLS, GRID_SIDE, MAX_DISTANCE_MM};
pub use pipeline::{Monitor, Pipeline, PipelineConfig, TickReport};
pub use zone_map::{ZoneLayout, ZoneMap};

/// Error type for device operations.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E: core::fmt::Debug> {
    /// I2C communication error, surfaced after one recovery attempt if the bus was busy
    I2cError(E),
    /// Bus index out of range, or its clock source is not running
    BusUnavailable(usize),
    /// No candidate bus and address answered with the TMF8828 identity
    NoDevice,
    /// The device answered with something other than what the protocol expects
    Protocol(ProtocolError),
    /// A bounded poll expired
    Timeout(Stage),
    /// Operation needs a device in continuous ranging
    NotMeasuring,
    /// Invalid parameter value provided
    InvalidArgument,
}

impl<E: core::fmt::Debug> core::fmt::Display for Error<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl<E: core::fmt::Debug> From<E> for Error<E> {
    fn from(error: E) -> Self {
        Error::I2cError(error)
    }
}

/// Unexpected answers during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// Bootloader payload longer than one chunk
    PayloadTooLong(usize),
    /// Bootloader answered with a non-zero status
    BootloaderStatus(u8),
    /// Bootloader response carried the wrong payload length
    BootloaderLength {
        /// Payload length asked for
        expected: usize,
        /// Payload length reported
        actual: usize,
    },
    /// Bootloader response checksum mismatch
    BootloaderChecksum {
        /// Checksum computed over the response
        expected: u8,
        /// Checksum byte received
        received: u8,
    },
    /// App id is neither the bootloader nor the measurement application
    UnexpectedAppId(u8),
    /// Command answered with an error status
    CommandFailed {
        /// Command code
        command: u8,
        /// Status read back
        status: u8,
    },
    /// The device runs its bootloader and no patch image was supplied
    MissingPatch,
}

/// Bounded wait that expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    /// Waiting for the CPU-ready bit after power on
    CpuReady,
    /// Waiting for the bootloader to answer the given command
    BootloaderResponse(u8),
    /// Waiting for the RAM application's app id after remap
    RamApp,
    /// Waiting for the given command's acknowledgement
    Command(u8),
    /// Waiting for the mode register to report 8×8
    ModeSwitch,
}
