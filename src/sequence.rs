//! Sequence numbers ordering work within a session.
//!
//! A sequence number is either `Ordered(n)` or the out-of-order marker. Work
//! carrying ordered numbers executes in ascending order within its session;
//! out-of-order work waives that guarantee entirely.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-session ordering token.
///
/// On the wire this is `null` (out of order) or the bare integer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(Option<u64>);

impl SequenceNumber {
    /// Sequence number that waives in-session ordering.
    pub fn out_of_order() -> Self {
        SequenceNumber(None)
    }

    /// An explicit position in the session's sequence.
    pub fn new(num: u64) -> Self {
        SequenceNumber(Some(num))
    }

    pub fn is_in_order(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_out_of_order(&self) -> bool {
        self.0.is_none()
    }

    /// The contained number, if this token is ordered.
    pub fn value(&self) -> Option<u64> {
        self.0
    }

    /// Advance to the next number. No-op on the out-of-order marker.
    pub fn advance(&mut self) {
        if let Some(num) = self.0.as_mut() {
            *num += 1;
        }
    }
}

impl Default for SequenceNumber {
    /// The default token is the out-of-order marker.
    fn default() -> Self {
        SequenceNumber::out_of_order()
    }
}

impl From<u64> for SequenceNumber {
    fn from(num: u64) -> Self {
        SequenceNumber::new(num)
    }
}

impl PartialEq for SequenceNumber {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SequenceNumber {}

impl PartialOrd for SequenceNumber {
    /// Two ordered numbers compare numerically. Any comparison where exactly
    /// one side is out of order is undefined; two out-of-order markers are
    /// equal.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            (None, None) => Some(Ordering::Equal),
            _ => None,
        }
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(num) => write!(f, "#{num}"),
            None => write!(f, "<out-of-order>"),
        }
    }
}
