#![cfg(not(feature = "async"))]

mod common;

use common::{rig, SimState, SIM_ADDRESS};
use tmf8828_fill::{DeviceState, Error, MeasurementConfig, PatchImage, ProtocolError, Stage};

static PATCH: [u8; 8192] = {
    let mut data = [0u8; 8192];
    let mut i = 0;
    while i < data.len() {
        data[i] = (i * 31 + 7) as u8;
        i += 1;
    }
    data
};

#[test]
fn bootloader_patch_upload_then_measuring() {
    let (sim, dev) = rig(SimState::new(true));
    let mut dev = dev.with_patch(PatchImage::new(0x0000, &PATCH));
    dev.bring_up().unwrap();

    assert_eq!(dev.state(), DeviceState::Measuring);
    let session = dev.session().unwrap();
    assert_eq!(session.bus, 1);
    assert_eq!(session.address, SIM_ADDRESS);
    assert_eq!(session.info.chip_id, 0x08);
    assert_eq!(session.info.rev_id, 0x01);

    let sim = sim.borrow();
    assert_eq!(sim.ram_address, Some(0x0000));
    assert_eq!(sim.chunks, 64);
    assert_eq!(sim.patch.as_slice(), &PATCH[..]);
    assert!(!sim.in_bootloader);
    assert!(sim.measuring);
    assert_eq!(sim.regs[0x10], 0x08);
    assert_eq!(sim.regs[0x19], 0x6E);
    assert_eq!(&sim.regs[0x24..0x30], &MeasurementConfig::default().common_block());
    assert_eq!(sim.regs[0x34], 15);
    assert_eq!(sim.regs[0x35], 0x84);
    assert_eq!(sim.regs[0xE2], 0x02);
    assert_eq!(sim.commands, vec![0xFF, 0x11, 0x6C, 0x16, 0x15, 0x10]);
}

#[test]
fn application_boot_skips_the_patch() {
    let (sim, mut dev) = rig(SimState::new(false));
    dev.bring_up().unwrap();
    assert_eq!(dev.state(), DeviceState::Measuring);
    assert_eq!(sim.borrow().chunks, 0);
}

#[test]
fn bootloader_without_patch_is_a_protocol_error() {
    let (sim, mut dev) = rig(SimState::new(true));
    assert!(matches!(
        dev.bring_up(),
        Err(Error::Protocol(ProtocolError::MissingPatch))
    ));
    assert_eq!(dev.state(), DeviceState::Unprobed);
    assert!(dev.session().is_none());
    assert!(!sim.borrow().measuring);
}

#[test]
fn cpu_that_never_boots_times_out() {
    let mut state = SimState::new(false);
    state.cpu_boots = false;
    let (_sim, mut dev) = rig(state);
    assert!(matches!(dev.bring_up(), Err(Error::Timeout(Stage::CpuReady))));
    assert_eq!(dev.state(), DeviceState::Unprobed);
}

#[test]
fn missing_device_is_reported() {
    let mut state = SimState::new(false);
    state.regs[0xE3] = 0x00;
    let (_sim, mut dev) = rig(state);
    assert!(matches!(dev.bring_up(), Err(Error::NoDevice)));
}

#[test]
fn unsupported_short_range_is_not_an_error() {
    let mut state = SimState::new(false);
    state.regs[0x19] = 0x00;
    let (sim, mut dev) = rig(state);
    dev.bring_up().unwrap();
    assert_eq!(sim.borrow().regs[0x19], 0x00);
}

#[test]
fn config_page_commit_is_retried_after_backoff() {
    let mut state = SimState::new(false);
    state.page_failures = 1;
    let (sim, mut dev) = rig(state);
    dev.bring_up().unwrap();

    assert_eq!(dev.state(), DeviceState::Measuring);
    let sim = sim.borrow();
    assert_eq!(sim.count(0x16), 2);
    assert_eq!(sim.count(0x15), 2);
    assert_eq!(sim.delays_ms.iter().filter(|&&ms| ms == 10).count(), 1);
    assert!(sim.measuring);
}

#[test]
fn first_try_commit_needs_no_backoff() {
    let (sim, mut dev) = rig(SimState::new(false));
    dev.bring_up().unwrap();
    assert_eq!(sim.borrow().count(0x15), 1);
    assert!(!sim.borrow().delays_ms.contains(&10));
}

#[test]
fn config_page_commit_gives_up_after_bounded_attempts() {
    let mut state = SimState::new(false);
    state.page_failures = usize::MAX;
    let (sim, mut dev) = rig(state);
    assert!(matches!(
        dev.bring_up(),
        Err(Error::Protocol(ProtocolError::CommandFailed { command: 0x15, status: 0x02 }))
    ));
    assert_eq!(dev.state(), DeviceState::Unprobed);
    let sim = sim.borrow();
    assert_eq!(sim.count(0x15), 3);
    assert_eq!(sim.delays_ms.iter().filter(|&&ms| ms == 10).count(), 3);
    assert!(!sim.measuring);
}
