//! Integration tests for the knock validator through the public API.
//!
//! These tests check the two properties every SPA port relies on:
//!
//! - A valid, fresh, unseen knock validates exactly once.
//! - Changing any single byte of a valid knock makes it fail validation,
//!   whichever field the byte belongs to.
//!
//! They also check that nothing but a fully valid knock leaves a trace in
//! the replay guard.

use std::sync::Arc;
use std::time::Duration;

use sdp_core::time::{Clock, ManualClock};
use sdp_core::{
    Device, DeviceId, IdentityBinding, InMemoryRegistry, KnockBuilder, KnockRejection,
    KnockSecret, KnockValidator, ReplayGuard,
};

const SKEW: Duration = Duration::from_secs(30);

fn setup() -> (Arc<ManualClock>, KnockValidator, KnockBuilder) {
    let clock = Arc::new(ManualClock::new());
    let builder = KnockBuilder::new(
        DeviceId::new("dev-1").unwrap(),
        KnockSecret::new((0u8..32).collect()).unwrap(),
    );
    let device = Device::new(
        builder.device_id().clone(),
        builder.secret().clone(),
        IdentityBinding::CertFingerprint([0u8; 32]),
        vec!["ssh".to_string()],
    );
    let registry = Arc::new(InMemoryRegistry::from_devices(vec![device]).unwrap());
    let replay = ReplayGuard::in_memory(clock.clone(), SKEW, 4096);
    let validator = KnockValidator::new(registry, replay, clock.clone(), SKEW);
    (clock, validator, builder)
}

#[test]
fn test_valid_knock_validates_exactly_once() {
    // Arrange
    let (clock, validator, builder) = setup();
    let knock = builder.build(clock.unix_seconds(), None).unwrap();

    // Act
    let results: Vec<_> = (0..5).map(|_| validator.validate(&knock.bytes)).collect();

    // Assert
    assert!(results[0].is_ok());
    for later in &results[1..] {
        assert!(matches!(later, Err(KnockRejection::Replayed(_))));
    }
}

#[test]
fn test_every_single_byte_flip_fails_validation() {
    // Arrange
    let (clock, validator, builder) = setup();
    let knock = builder
        .build(clock.unix_seconds(), Some("header.claims.signature"))
        .unwrap();

    // Act / Assert
    for index in 0..knock.bytes.len() {
        for mask in [0x01u8, 0x80, 0xFF] {
            let mut tampered = knock.bytes.clone();
            tampered[index] ^= mask;
            let result = validator.validate(&tampered);
            assert!(
                result.is_err(),
                "flipping byte {index} with mask {mask:#04x} must fail validation"
            );
        }
    }
    assert!(
        validator.replay_guard().is_empty(),
        "no tampered knock may reach the replay guard"
    );

    // The untouched knock still validates afterwards.
    assert!(validator.validate(&knock.bytes).is_ok());
}

#[test]
fn test_distinct_nonces_from_same_device_all_validate() {
    // Arrange
    let (clock, validator, builder) = setup();

    // Act
    let accepted = (0..50)
        .map(|_| builder.build(clock.unix_seconds(), None).unwrap())
        .filter(|knock| validator.validate(&knock.bytes).is_ok())
        .count();

    // Assert
    assert_eq!(accepted, 50);
    assert_eq!(validator.replay_guard().len(), 50);
}

#[test]
fn test_captured_knock_replayed_after_skew_window_is_stale() {
    // Arrange
    let (clock, validator, builder) = setup();
    let knock = builder.build(clock.unix_seconds(), None).unwrap();
    validator.validate(&knock.bytes).unwrap();

    // Act
    clock.advance(Duration::from_secs(31));
    let result = validator.validate(&knock.bytes);

    // Assert
    assert!(matches!(result, Err(KnockRejection::Stale { .. })));
}
