//! TMF8828 register map, command codes and identity signatures.

/// Default 7-bit I2C address of the TMF8828.
pub const DEFAULT_ADDRESS: u8 = 0x41;

/// Addresses probed, in order, on every candidate bus.
pub const PROBE_ADDRESSES: [u8; 3] = [DEFAULT_ADDRESS, 0x42, 0x43];

/// Chip identity after masking [`Register::Id`] with [`CHIP_ID_MASK`].
pub const CHIP_ID: u8 = 0x08;

/// Bits of [`Register::Id`] that carry the chip identity.
pub const CHIP_ID_MASK: u8 = 0x3F;

/// Bits of [`Register::RevId`] that carry the silicon revision.
pub const REV_ID_MASK: u8 = 0x07;

/// Power-on bit of [`Register::Enable`].
pub const ENABLE_PON: u8 = 0x01;

/// CPU-ready bit of [`Register::Enable`].
pub const ENABLE_CPU_READY: u8 = 1 << 6;

/// Result-ready bit of [`Register::IntStatus`] and [`Register::IntEnable`].
pub const INT_RESULT_READY: u8 = 0x02;

/// Mode register value reported once the device runs in 8×8 mode.
pub const MODE_8X8: u8 = 0x08;

/// Register addresses for the TMF8828.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Register {
    /// Running application id (0x00)
    AppId = 0x00,
    /// Command / status register, also the bootloader frame window (0x08)
    CmdStat = 0x08,
    /// Zone mode (0x10)
    Mode = 0x10,
    /// Active range selection (0x19)
    ActiveRange = 0x19,
    /// Start of the result / config page (0x20)
    ConfigResult = 0x20,
    /// Common config block: measurement period (0x24)
    PeriodMs = 0x24,
    /// SPAD map selection (0x34)
    SpadMapId = 0x34,
    /// Algorithm setting 0 (0x35)
    AlgSetting0 = 0x35,
    /// Histogram dump selection (0x39)
    HistDump = 0x39,
    /// Enable / power control (0xE0)
    Enable = 0xE0,
    /// Interrupt status, write-one-to-clear (0xE1)
    IntStatus = 0xE1,
    /// Interrupt enable (0xE2)
    IntEnable = 0xE2,
    /// Chip id (0xE3)
    Id = 0xE3,
    /// Revision id (0xE4)
    RevId = 0xE4,
}

impl From<Register> for u8 {
    fn from(r: Register) -> Self {
        r as u8
    }
}

/// Application-mode commands written to [`Register::CmdStat`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Start continuous measurement
    Measure = 0x10,
    /// Clear the command status
    ClearStatus = 0x11,
    /// Commit the loaded config page
    WriteConfigPage = 0x15,
    /// Load the common config page into the register window
    LoadCommonConfig = 0x16,
    /// Switch the firmware into 8×8 zone mode
    SwitchTo8x8 = 0x6C,
    /// Stop measuring
    Stop = 0xFF,
}

impl From<Command> for u8 {
    fn from(c: Command) -> Self {
        c as u8
    }
}

/// Bootloader commands carried inside a [`crate::bootloader`] command frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootloaderCommand {
    /// Remap RAM and jump to the uploaded application
    RamRemap = 0x11,
    /// Write a chunk at the current RAM pointer
    WriteRam = 0x41,
    /// Set the RAM pointer
    AddrRam = 0x43,
}

impl From<BootloaderCommand> for u8 {
    fn from(c: BootloaderCommand) -> Self {
        c as u8
    }
}

/// Value of [`Register::AppId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AppId {
    /// Measurement application is running
    Application,
    /// Device came up in its bootloader and needs a patch
    Bootloader,
    /// Anything else
    Unknown(u8),
}

impl From<u8> for AppId {
    fn from(value: u8) -> Self {
        match value {
            0x03 => AppId::Application,
            0x80 => AppId::Bootloader,
            other => AppId::Unknown(other),
        }
    }
}

impl From<AppId> for u8 {
    fn from(id: AppId) -> Self {
        match id {
            AppId::Application => 0x03,
            AppId::Bootloader => 0x80,
            AppId::Unknown(value) => value,
        }
    }
}

/// Value of [`Register::ActiveRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ActiveRange {
    /// The running firmware has no range selection
    Unsupported,
    /// Short range, high accuracy
    Short,
    /// Long range
    Long,
    /// Unrecognised value
    Unknown(u8),
}

impl From<u8> for ActiveRange {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ActiveRange::Unsupported,
            0x6E => ActiveRange::Short,
            0x6F => ActiveRange::Long,
            other => ActiveRange::Unknown(other),
        }
    }
}

impl From<ActiveRange> for u8 {
    fn from(range: ActiveRange) -> Self {
        match range {
            ActiveRange::Unsupported => 0x00,
            ActiveRange::Short => 0x6E,
            ActiveRange::Long => 0x6F,
            ActiveRange::Unknown(value) => value,
        }
    }
}
