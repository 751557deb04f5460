//! Signal parsing and error reporting through the public API.

use proptest::prelude::*;
use pw_common::{Error, ErrorCategory, OsFamily, Signal, MAX_SIGNAL};

#[test]
fn every_catalog_name_parses_with_and_without_prefix() {
    for name in [
        "HUP", "INT", "QUIT", "ABRT", "KILL", "USR1", "USR2", "PIPE", "ALRM", "TERM", "CONT",
        "STOP", "TSTP", "WINCH",
    ] {
        let bare = Signal::parse(name).unwrap();
        let prefixed = Signal::parse(&format!("SIG{name}")).unwrap();
        let lower = Signal::parse(&name.to_lowercase()).unwrap();
        assert_eq!(bare, prefixed);
        assert_eq!(bare, lower);
        assert_eq!(bare.to_string(), format!("SIG{name}"));
    }
}

#[test]
fn invalid_signal_is_validation_error() {
    let err = Signal::parse("SIGNOPE").unwrap_err();
    assert!(matches!(err, Error::InvalidSignal(_)));
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert_eq!(err.code(), 11);
}

#[test]
fn unknown_os_does_not_classify() {
    assert!(OsFamily::classify("haiku").is_none());
}

proptest! {
    #[test]
    fn numbers_outside_range_are_rejected(
        n in prop_oneof![i32::MIN..1i32, (MAX_SIGNAL + 1)..i32::MAX]
    ) {
        prop_assert!(Signal::from_raw(n).is_err());
        prop_assert!(Signal::parse(&n.to_string()).is_err());
    }

    #[test]
    fn parse_never_panics(input in ".{0,24}") {
        let _ = Signal::parse(&input);
    }
}
