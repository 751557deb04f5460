//! Signal catalog and name/number normalization.
//!
//! Callers may name a signal as `TERM`, `SIGTERM`, `sigterm` or `15`; all of
//! these normalize to [`Signal::Term`]. Numbers without a catalog name are
//! kept as [`Signal::Other`] as long as they fall inside the platform range.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest signal number accepted on this platform.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const MAX_SIGNAL: i32 = 64;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const MAX_SIGNAL: i32 = 31;

/// A termination or control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Abrt,
    Kill,
    Usr1,
    Usr2,
    Pipe,
    Alrm,
    Term,
    Cont,
    Stop,
    Tstp,
    Winch,
    /// A valid signal number with no catalog entry (e.g. real-time signals).
    Other(i32),
}

const NAMED: &[(Signal, &str)] = &[
    (Signal::Hup, "HUP"),
    (Signal::Int, "INT"),
    (Signal::Quit, "QUIT"),
    (Signal::Abrt, "ABRT"),
    (Signal::Kill, "KILL"),
    (Signal::Usr1, "USR1"),
    (Signal::Usr2, "USR2"),
    (Signal::Pipe, "PIPE"),
    (Signal::Alrm, "ALRM"),
    (Signal::Term, "TERM"),
    (Signal::Cont, "CONT"),
    (Signal::Stop, "STOP"),
    (Signal::Tstp, "TSTP"),
    (Signal::Winch, "WINCH"),
];

impl Signal {
    /// Parse a signal given by name or number.
    pub fn parse(input: &str) -> Result<Signal> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidSignal(input.to_string()));
        }

        if let Ok(number) = trimmed.parse::<i32>() {
            return Signal::from_raw(number);
        }

        let upper = trimmed.to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        // IOT is the historical alias for ABRT
        let bare = if bare == "IOT" { "ABRT" } else { bare };
        NAMED
            .iter()
            .find(|(_, name)| *name == bare)
            .map(|(signal, _)| *signal)
            .ok_or_else(|| Error::InvalidSignal(input.to_string()))
    }

    /// Build a signal from its platform number, rejecting out-of-range values.
    pub fn from_raw(number: i32) -> Result<Signal> {
        if !(1..=MAX_SIGNAL).contains(&number) {
            return Err(Error::InvalidSignal(number.to_string()));
        }
        Ok(NAMED
            .iter()
            .map(|(signal, _)| *signal)
            .find(|signal| signal.as_raw() == number)
            .unwrap_or(Signal::Other(number)))
    }

    /// Catalog name without the `SIG` prefix.
    pub fn name(&self) -> Option<&'static str> {
        NAMED
            .iter()
            .find(|(signal, _)| signal == self)
            .map(|(_, name)| *name)
    }

    /// Platform signal number.
    #[cfg(unix)]
    pub fn as_raw(&self) -> i32 {
        match self {
            Signal::Hup => libc::SIGHUP,
            Signal::Int => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Abrt => libc::SIGABRT,
            Signal::Kill => libc::SIGKILL,
            Signal::Usr1 => libc::SIGUSR1,
            Signal::Usr2 => libc::SIGUSR2,
            Signal::Pipe => libc::SIGPIPE,
            Signal::Alrm => libc::SIGALRM,
            Signal::Term => libc::SIGTERM,
            Signal::Cont => libc::SIGCONT,
            Signal::Stop => libc::SIGSTOP,
            Signal::Tstp => libc::SIGTSTP,
            Signal::Winch => libc::SIGWINCH,
            Signal::Other(n) => *n,
        }
    }

    /// Platform signal number (POSIX numbering where the OS has none).
    #[cfg(not(unix))]
    pub fn as_raw(&self) -> i32 {
        match self {
            Signal::Hup => 1,
            Signal::Int => 2,
            Signal::Quit => 3,
            Signal::Abrt => 6,
            Signal::Kill => 9,
            Signal::Usr1 => 10,
            Signal::Usr2 => 12,
            Signal::Pipe => 13,
            Signal::Alrm => 14,
            Signal::Term => 15,
            Signal::Cont => 18,
            Signal::Stop => 19,
            Signal::Tstp => 20,
            Signal::Winch => 28,
            Signal::Other(n) => *n,
        }
    }

    /// Whether the signal cannot be caught or ignored by the target.
    pub fn is_forceful(&self) -> bool {
        matches!(self, Signal::Kill)
    }

    /// Whether delivering the signal is expected to end the process.
    pub fn is_terminating(&self) -> bool {
        matches!(
            self,
            Signal::Hup | Signal::Int | Signal::Quit | Signal::Abrt | Signal::Kill | Signal::Term
        )
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "SIG{name}"),
            None => write!(f, "{}", self.as_raw()),
        }
    }
}

impl From<Signal> for String {
    fn from(signal: Signal) -> Self {
        signal.to_string()
    }
}

impl TryFrom<String> for Signal {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Signal::parse(&value)
    }
}

impl std::str::FromStr for Signal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Signal::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_variants() {
        for input in ["TERM", "SIGTERM", "sigterm", " term ", "15"] {
            assert_eq!(Signal::parse(input).unwrap(), Signal::Term, "{input}");
        }
        assert_eq!(Signal::parse("kill").unwrap(), Signal::Kill);
        assert_eq!(Signal::parse("9").unwrap(), Signal::Kill);
        assert_eq!(Signal::parse("SIGIOT").unwrap(), Signal::Abrt);
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert!(Signal::parse("0").is_err());
        assert!(Signal::parse("-9").is_err());
        assert!(Signal::parse(&(MAX_SIGNAL + 1).to_string()).is_err());
        assert!(Signal::parse("SIGBOGUS").is_err());
        assert!(Signal::parse("").is_err());
    }

    #[test]
    fn test_unnamed_number_is_other() {
        let signal = Signal::parse(&MAX_SIGNAL.to_string()).unwrap();
        assert_eq!(signal.as_raw(), MAX_SIGNAL);
    }

    #[test]
    fn test_display_and_serde() {
        assert_eq!(Signal::Kill.to_string(), "SIGKILL");
        let json = serde_json::to_string(&Signal::Int).unwrap();
        assert_eq!(json, "\"SIGINT\"");
        let back: Signal = serde_json::from_str("\"hup\"").unwrap();
        assert_eq!(back, Signal::Hup);
    }

    #[test]
    fn test_forceful_and_terminating() {
        assert!(Signal::Kill.is_forceful());
        assert!(!Signal::Term.is_forceful());
        assert!(Signal::Term.is_terminating());
        assert!(!Signal::Stop.is_terminating());
    }

    proptest::proptest! {
        #[test]
        fn prop_in_range_numbers_roundtrip(n in 1i32..=MAX_SIGNAL) {
            let signal = Signal::from_raw(n).unwrap();
            proptest::prop_assert_eq!(signal.as_raw(), n);
        }
    }
}
