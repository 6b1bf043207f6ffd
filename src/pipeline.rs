//! One polling tick: poll, reassemble, denoise, estimate, alert.

#[cfg(not(feature = "async"))]
use embedded_hal::{delay::DelayNs, i2c::I2c};
#[cfg(feature = "async")]
use embedded_hal_async::{delay::DelayNs, i2c::I2c};

use crate::alert::{AlertConfig, AlertMachine, AlertStatus};
use crate::bus::BusControl;
use crate::denoise::{DenoiseConfig, Denoiser};
use crate::device::{FramePoll, PowerEnable, Tmf8828};
use crate::estimator::{Estimate, Estimator, EstimatorConfig};
use crate::grid::DepthFrame;
use crate::Error;

/// Configuration of every processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipelineConfig {
    /// Denoiser tuning.
    pub denoise: DenoiseConfig,
    /// Estimator tuning.
    pub estimator: EstimatorConfig,
    /// Alert tuning.
    pub alert: AlertConfig,
    /// Consecutive empty polls after which [`Monitor`] restarts ranging; 0 never restarts.
    pub restart_after_empty_polls: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            denoise: DenoiseConfig::default(),
            estimator: EstimatorConfig::default(),
            alert: AlertConfig::default(),
            restart_after_empty_polls: 50,
        }
    }
}

/// Outcome of one processed grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TickReport {
    /// Denoised grid.
    pub filtered: DepthFrame,
    /// Estimator output.
    pub estimate: Estimate,
    /// Alert state after this tick.
    pub alert: AlertStatus,
    /// The grid came from a fresh device frame.
    pub live: bool,
    /// The device grid was complete when it was read.
    pub complete: bool,
}

/// Denoise, estimate and alert stages over a grid; no device access.
#[derive(Debug, Clone)]
pub struct Pipeline {
    denoiser: Denoiser,
    estimator: Estimator,
    alert: AlertMachine,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}

impl Pipeline {
    /// Creates every stage from `config`.
    #[must_use]
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            denoiser: Denoiser::new(config.denoise),
            estimator: Estimator::new(config.estimator),
            alert: AlertMachine::new(config.alert),
        }
    }

    /// Runs the stages over `grid`.
    ///
    /// `live` is false when `grid` is a held grid rather than a fresh read.
    pub fn process(&mut self, grid: &DepthFrame, live: bool) -> TickReport {
        let filtered = self.denoiser.process(grid);
        let estimate = self.estimator.update(&filtered, live);
        let alert = self.alert.update(&estimate);
        TickReport {
            filtered,
            estimate,
            alert,
            live,
            complete: false,
        }
    }

    /// Reports the current estimate and alert state without running any stage.
    #[must_use]
    pub fn hold(&self) -> TickReport {
        TickReport {
            filtered: DepthFrame::empty(),
            estimate: self.estimate(),
            alert: self.alert_level(),
            live: false,
            complete: false,
        }
    }

    /// Last estimate.
    #[must_use]
    pub fn estimate(&self) -> Estimate {
        self.estimator.estimate()
    }

    /// Committed alert level and popup state.
    #[must_use]
    pub fn alert_level(&self) -> AlertStatus {
        self.alert.status()
    }

    /// Hides an active popup without rearming it.
    pub fn dismiss_popup(&mut self) {
        self.alert.dismiss_popup();
    }

    /// Estimator stage.
    #[must_use]
    pub fn estimator(&self) -> &Estimator {
        &self.estimator
    }

    /// Drops denoiser history and the fused estimate; alert state and
    /// calibration bounds survive.
    pub fn reset_filters(&mut self) {
        self.denoiser.reset();
        self.estimator.reset();
    }
}

/// Device plus pipeline, advanced one tick at a time by the caller's loop.
pub struct Monitor<I2C, C, D, P, const N: usize> {
    device: Tmf8828<I2C, C, D, P, N>,
    pipeline: Pipeline,
    last_grid: DepthFrame,
    has_frame: bool,
    empty_polls: u16,
    restart_after: u16,
}

#[maybe_async_cfg::maybe(
    sync(cfg(not(feature = "async")), keep_self),
    async(feature = "async", keep_self)
)]
impl<I2C, C, E, D, P, const N: usize> Monitor<I2C, C, D, P, N>
where
    I2C: I2c<Error = E>,
    E: embedded_hal::i2c::Error,
    C: BusControl,
    D: DelayNs,
    P: PowerEnable,
{
    /// Wraps a device, brought up or not.
    pub fn new(device: Tmf8828<I2C, C, D, P, N>, config: &PipelineConfig) -> Self {
        Self {
            device,
            pipeline: Pipeline::new(config),
            last_grid: DepthFrame::empty(),
            has_frame: false,
            empty_polls: 0,
            restart_after: config.restart_after_empty_polls,
        }
    }

    /// The device.
    pub fn device(&self) -> &Tmf8828<I2C, C, D, P, N> {
        &self.device
    }

    /// The device, mutably.
    pub fn device_mut(&mut self) -> &mut Tmf8828<I2C, C, D, P, N> {
        &mut self.device
    }

    /// The processing stages.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Last estimate.
    pub fn estimate(&self) -> Estimate {
        self.pipeline.estimate()
    }

    /// Committed alert level and popup state.
    pub fn alert_level(&self) -> AlertStatus {
        self.pipeline.alert_level()
    }

    /// Hides an active popup without rearming it.
    pub fn dismiss_popup(&mut self) {
        self.pipeline.dismiss_popup();
    }

    /// Consumes the monitor, returning the device.
    pub fn release(self) -> Tmf8828<I2C, C, D, P, N> {
        self.device
    }

    /// Brings the device up and clears every filter.
    ///
    /// # Errors
    ///
    /// Any error of [`Tmf8828::bring_up`].
    pub async fn bring_up(&mut self) -> Result<(), Error<E>> {
        self.last_grid = DepthFrame::empty();
        self.has_frame = false;
        self.empty_polls = 0;
        self.pipeline.reset_filters();
        self.device.bring_up().await
    }

    /// Runs one tick.
    ///
    /// Without a fresh frame the held grid is processed again as not live, so
    /// confidence drops and stale cells age. Until the first frame after
    /// bring-up or a restart there is no grid to hold, and the previous
    /// estimate and alert state are reported unchanged. After the configured
    /// number of consecutive empty polls the measurement is restarted.
    ///
    /// # Errors
    ///
    /// * `Err(Error::NotMeasuring)` - the device is not brought up
    /// * `Err(Error::I2cError(E))`, `Err(Error::Timeout(_))`, `Err(Error::Protocol(_))` - polling or a restart failed
    pub async fn tick(&mut self) -> Result<TickReport, Error<E>> {
        match self.device.poll_frame().await? {
            FramePoll::Frame { grid, complete, .. } => {
                self.empty_polls = 0;
                self.last_grid = grid;
                self.has_frame = true;
                let mut report = self.pipeline.process(&grid, true);
                report.complete = complete;
                Ok(report)
            }
            FramePoll::NoData => {
                self.empty_polls = self.empty_polls.saturating_add(1);
                if self.restart_after != 0 && self.empty_polls >= self.restart_after {
                    warn!("No data for {} polls, restarting measurement", self.empty_polls);
                    self.empty_polls = 0;
                    self.last_grid = DepthFrame::empty();
                    self.has_frame = false;
                    self.device.restart_measurement().await?;
                }
                if !self.has_frame {
                    return Ok(self.pipeline.hold());
                }
                let grid = self.last_grid;
                Ok(self.pipeline.process(&grid, false))
            }
        }
    }
}
