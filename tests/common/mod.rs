//! Register-level TMF8828 simulation behind `embedded_hal::i2c::I2c`.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};
use tmf8828_fill::{BusManager, BusPort, Tmf8828};

pub const SIM_ADDRESS: u8 = 0x42;

const APP_ID: u8 = 0x00;
const CMD_STAT: u8 = 0x08;
const MODE: u8 = 0x10;
const ACTIVE_RANGE: u8 = 0x19;
const CONFIG_RESULT: u8 = 0x20;
const ENABLE: u8 = 0xE0;
const INT_STATUS: u8 = 0xE1;

pub type SimDevice = Tmf8828<SimBus, (), SimDelay, (), 2>;

pub struct SimState {
    pub regs: [u8; 256],
    pointer: u8,
    pub in_bootloader: bool,
    pub cpu_boots: bool,
    pub ram_address: Option<u16>,
    pub patch: Vec<u8>,
    pub chunks: usize,
    pending_cmd: u8,
    pending_reads: u8,
    status: u8,
    restart_reads: u8,
    pub commands: Vec<u8>,
    pub frames: VecDeque<Vec<u8>>,
    pub measuring: bool,
    /// Write-config-page commands still to be answered with an error status.
    pub page_failures: usize,
    /// Every millisecond delay requested, in order.
    pub delays_ms: Vec<u32>,
}

impl SimState {
    pub fn new(in_bootloader: bool) -> Self {
        let mut regs = [0u8; 256];
        regs[usize::from(APP_ID)] = if in_bootloader { 0x80 } else { 0x03 };
        regs[0xE3] = 0x48;
        regs[0xE4] = 0x01;
        regs[usize::from(ACTIVE_RANGE)] = 0x6F;
        Self {
            regs,
            pointer: 0,
            in_bootloader,
            cpu_boots: true,
            ram_address: None,
            patch: Vec::new(),
            chunks: 0,
            pending_cmd: 0,
            pending_reads: 0,
            status: 0,
            restart_reads: 0,
            commands: Vec::new(),
            frames: VecDeque::new(),
            measuring: false,
            page_failures: 0,
            delays_ms: Vec::new(),
        }
    }

    pub fn push_frame(&mut self, frame: Vec<u8>) {
        self.frames.push_back(frame);
        self.regs[usize::from(INT_STATUS)] |= 0x02;
    }

    pub fn count(&self, command: u8) -> usize {
        self.commands.iter().filter(|&&c| c == command).count()
    }

    fn write(&mut self, bytes: &[u8]) {
        let Some((&reg, data)) = bytes.split_first() else {
            return;
        };
        self.pointer = reg;
        if data.is_empty() {
            return;
        }
        match reg {
            CMD_STAT if self.in_bootloader => self.bootloader_frame(data),
            CMD_STAT => self.command(data[0]),
            ENABLE => {
                let ready = if self.cpu_boots && data[0] & 0x01 != 0 { 0x40 } else { 0 };
                self.regs[usize::from(ENABLE)] = data[0] | ready;
            }
            INT_STATUS => self.regs[usize::from(INT_STATUS)] &= !data[0],
            _ => {
                let start = usize::from(reg);
                self.regs[start..start + data.len()].copy_from_slice(data);
            }
        }
    }

    fn bootloader_frame(&mut self, frame: &[u8]) {
        let cmd = frame[0];
        let len = usize::from(frame[1]);
        let payload = &frame[2..2 + len];
        let sum = frame[..2 + len].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        assert_eq!(frame[2 + len], 0xFF ^ sum, "bad checksum on bootloader command {cmd:#x}");
        match cmd {
            0x43 => self.ram_address = Some(u16::from_le_bytes([payload[0], payload[1]])),
            0x41 => {
                self.patch.extend_from_slice(payload);
                self.chunks += 1;
            }
            0x11 => {
                self.in_bootloader = false;
                self.restart_reads = 2;
                self.regs[usize::from(APP_ID)] = 0x03;
                return;
            }
            other => panic!("unexpected bootloader command {other:#x}"),
        }
        self.pending_cmd = cmd;
        self.pending_reads = 1;
    }

    fn command(&mut self, cmd: u8) {
        self.commands.push(cmd);
        self.pending_cmd = cmd;
        self.pending_reads = 1;
        self.status = match cmd {
            0x10 => {
                self.measuring = true;
                1
            }
            0xFF => {
                self.measuring = false;
                0
            }
            0x6C => {
                self.regs[usize::from(MODE)] = 0x08;
                0
            }
            0x15 if self.page_failures > 0 => {
                self.page_failures -= 1;
                0x02
            }
            _ => 0,
        };
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), ErrorKind> {
        match self.pointer {
            APP_ID if self.restart_reads > 0 => {
                self.restart_reads -= 1;
                return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
            }
            CMD_STAT if self.in_bootloader => {
                buf.fill(0);
                if self.pending_reads > 0 {
                    self.pending_reads -= 1;
                    buf[0] = self.pending_cmd;
                } else if buf.len() >= 3 {
                    buf[..3].copy_from_slice(&[0x00, 0x00, 0xFF]);
                }
            }
            CMD_STAT => {
                if self.pending_reads > 0 {
                    self.pending_reads -= 1;
                    buf[0] = self.pending_cmd;
                } else {
                    buf[0] = self.status;
                }
            }
            CONFIG_RESULT if buf.len() > 32 => {
                buf.fill(0);
                if let Some(frame) = self.frames.pop_front() {
                    buf.copy_from_slice(&frame[..buf.len()]);
                }
                if !self.frames.is_empty() {
                    self.regs[usize::from(INT_STATUS)] |= 0x02;
                }
            }
            reg => {
                let start = usize::from(reg);
                buf.copy_from_slice(&self.regs[start..start + buf.len()]);
            }
        }
        Ok(())
    }
}

/// One bus; `device` is `None` for a bus with nothing attached.
#[derive(Clone)]
pub struct SimBus {
    device: Option<Rc<RefCell<SimState>>>,
}

impl ErrorType for SimBus {
    type Error = ErrorKind;
}

impl SimBus {
    fn run(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), ErrorKind> {
        let nack = ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address);
        let Some(device) = &self.device else {
            return Err(nack);
        };
        if address != SIM_ADDRESS {
            return Err(nack);
        }
        let mut device = device.borrow_mut();
        for op in operations.iter_mut() {
            match op {
                Operation::Write(bytes) => device.write(bytes),
                Operation::Read(buf) => device.read(buf)?,
            }
        }
        Ok(())
    }
}

impl I2c for SimBus {
    fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        self.run(address, operations)
    }
}

#[cfg(feature = "async")]
impl embedded_hal_async::i2c::I2c for SimBus {
    async fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        self.run(address, operations)
    }
}

/// Returns at once and records every millisecond wait in the simulation.
pub struct SimDelay {
    state: Rc<RefCell<SimState>>,
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, _ns: u32) {}

    fn delay_ms(&mut self, ms: u32) {
        self.state.borrow_mut().delays_ms.push(ms);
    }
}

#[cfg(feature = "async")]
impl embedded_hal_async::delay::DelayNs for SimDelay {
    async fn delay_ns(&mut self, _ns: u32) {}

    async fn delay_ms(&mut self, ms: u32) {
        self.state.borrow_mut().delays_ms.push(ms);
    }
}

/// An empty first bus and the simulated device on the second.
pub fn rig(state: SimState) -> (Rc<RefCell<SimState>>, SimDevice) {
    let state = Rc::new(RefCell::new(state));
    let ports = [
        BusPort::new("i2c0", SimBus { device: None }, ()),
        BusPort::new(
            "i2c1",
            SimBus {
                device: Some(Rc::clone(&state)),
            },
            (),
        ),
    ];
    let delay = SimDelay {
        state: Rc::clone(&state),
    };
    (state, Tmf8828::new(BusManager::new(ports, delay), ()))
}

/// 132-byte result frame whose first object per zone carries `mm(zone)` at high confidence.
pub fn result_frame(capture: u8, sequence: u8, mm: impl Fn(usize) -> u16) -> Vec<u8> {
    let mut raw = vec![0u8; 132];
    raw[0] = 0x10;
    raw[4] = ((sequence & 0x3F) << 2) | (capture & 0x03);
    let slots = (0..18).filter(|slot| *slot != 8 && *slot != 17);
    for (zone, slot) in slots.enumerate() {
        let off = 24 + slot * 6;
        raw[off] = 100;
        raw[off + 1..off + 3].copy_from_slice(&mm(zone).to_le_bytes());
    }
    raw
}
