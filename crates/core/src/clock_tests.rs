// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn fake_clock_advances_both_clocks() {
    let clock = FakeClock::new();
    let start = clock.now();
    let start_ms = clock.epoch_ms();

    clock.advance(Duration::from_millis(1500));

    assert_eq!(clock.now().duration_since(start), Duration::from_millis(1500));
    assert_eq!(clock.epoch_ms(), start_ms + 1500);
}

#[test]
fn at_starts_from_the_given_epoch() {
    let clock = FakeClock::at(42_000);
    assert_eq!(clock.epoch_ms(), 42_000);
}

#[test]
fn set_epoch_leaves_the_monotonic_clock_alone() {
    let clock = FakeClock::new();
    let instant = clock.now();
    clock.set_epoch_ms(99);
    assert_eq!(clock.epoch_ms(), 99);
    assert_eq!(clock.now(), instant);
}

#[test]
fn clones_share_state() {
    let clock = FakeClock::new();
    let other = clock.clone();
    clock.advance(Duration::from_millis(250));
    assert_eq!(other.epoch_ms(), clock.epoch_ms());
}

#[test]
fn system_clock_epoch_is_sane() {
    // 2020-01-01 in epoch ms
    assert!(SystemClock.epoch_ms() > 1_577_836_800_000);
}

#[test]
fn rfc3339_formats_utc_millis() {
    assert_eq!(rfc3339_ms(0), "1970-01-01T00:00:00.000Z");
    assert_eq!(rfc3339_ms(1_700_000_000_123), "2023-11-14T22:13:20.123Z");
}
