//! Device failure handling
//!
//! A failure that survives one recover+retry is a failed attempt. The pump
//! re-prepares after the first failed attempt and gives up on the second;
//! the session then reports `DeviceFailed` until closed.

mod helpers;

use helpers::*;
use pcmout::{DeviceError, Error, PumpMode};

#[test]
fn test_single_write_failure_is_absorbed() {
    let (session, device) = open_mock(cd_format(), 500);
    device.set_unlimited_headroom(true);
    device.fail_next_writes(1);

    let data = pattern(0, 4000);
    session.write(&data).unwrap();
    session.start_playback().unwrap();

    wait_until("delivery after recovery", || device.captured_len() == data.len());
    assert_eq!(device.captured(), data);
    assert_eq!(device.counters().recovers, 1);
    assert_eq!(session.mode(), PumpMode::Running);
    assert!(session.failure().is_none());
}

#[test]
fn test_one_failed_attempt_reprepares_and_continues() {
    let (session, device) = open_mock(cd_format(), 500);
    device.set_unlimited_headroom(true);
    // Write + retry both fail once: one failed attempt
    device.fail_next_writes(2);

    let data = pattern(0, 4000);
    session.write(&data).unwrap();
    let prepares_before = device.counters().prepares;
    session.start_playback().unwrap();

    wait_until("delivery after re-prepare", || device.captured_len() == data.len());
    // One for starting playback, one after the failed attempt
    assert_eq!(device.counters().prepares, prepares_before + 2);
    assert_eq!(session.mode(), PumpMode::Running);
}

#[test]
fn test_two_failed_attempts_fail_session() {
    let (session, device) = open_mock(cd_format(), 500);
    device.set_unlimited_headroom(true);
    device.fail_next_writes(4);

    session.write(&pattern(0, 4000)).unwrap();
    session.start_playback().unwrap();

    wait_until("pump failure", || session.mode() == PumpMode::Failed);
    assert_eq!(session.failure(), Some(DeviceError::Xrun));
    assert!(device.captured().is_empty());

    assert!(matches!(session.write(&[0; 4]), Err(Error::DeviceFailed(DeviceError::Xrun))));
    assert!(matches!(session.period_wait(), Err(Error::DeviceFailed(_))));
    assert!(matches!(session.pause(true), Err(Error::DeviceFailed(_))));
    assert!(matches!(session.flush(), Err(Error::DeviceFailed(_))));
    assert!(matches!(session.drain(), Err(Error::DeviceFailed(_))));

    // Delay falls back to what is still buffered
    assert_eq!(session.get_delay(), session.format().bytes_to_ms(4000));

    session.close();
    assert!(device.is_closed());
}

#[test]
fn test_failing_prepare_ends_pump() {
    let (session, device) = open_mock(cd_format(), 500);
    device.set_unlimited_headroom(true);
    device.set_prepare_fails(true);
    device.fail_next_writes(2);

    session.write(&pattern(0, 4000)).unwrap();
    // The start-of-playback prepare failure is only logged
    session.start_playback().unwrap();
    assert_eq!(session.mode(), PumpMode::Running);

    wait_until("pump failure", || session.mode() == PumpMode::Failed);
    assert!(matches!(session.failure(), Some(DeviceError::Io(_))));
}

#[test]
fn test_headroom_query_is_recovered() {
    let (session, device) = open_mock(cd_format(), 500);
    device.set_unlimited_headroom(true);
    device.fail_next_headroom_queries(1);

    let data = pattern(0, 400);
    session.write(&data).unwrap();
    session.start_playback().unwrap();

    wait_until("delivery", || device.captured_len() == data.len());
    assert_eq!(device.counters().recovers, 1);
}

#[test]
fn test_failed_session_unblocks_period_wait() {
    // 40 ms total: 160 byte ring
    let (session, device) = open_mock(tiny_format(), 40);
    device.fail_next_writes(4);

    session.write(&pattern(0, 160)).unwrap();
    device.grant(1);

    // Full ring starts playback; the pump then fails and wakes us
    let result = session.period_wait();
    assert!(matches!(result, Err(Error::DeviceFailed(_))));
}
