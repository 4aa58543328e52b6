//! Logging helpers that keep addresses and payloads out of log output.
//!
//! Log lines name peers through [`RedactedAddress`] and payloads through
//! [`RedactedBytes`]; message text is never logged.

use std::fmt;

/// A wrapper that redacts sensitive data when displayed.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Redact an I2P address, showing only the first 6 characters and the suffix.
pub struct RedactedAddress<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedAddress<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        match s.strip_suffix(".b32.i2p") {
            Some(host) if host.len() > 12 && host.is_ascii() => {
                write!(f, "{}...b32.i2p", &host[..6])
            }
            _ => write!(f, "[REDACTED ADDRESS]"),
        }
    }
}

impl<'a> fmt::Debug for RedactedAddress<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a byte slice, showing only length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
