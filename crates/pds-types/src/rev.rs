use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

const TID_ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";
const TID_LEN: usize = 13;
const TIMESTAMP_BITS: u32 = 53;
const CLOCK_ID_BITS: u32 = 10;

/// Revision identifier assigned to a commit.
///
/// Revisions compare as strings, so any producer that emits lexicographically
/// increasing identifiers can drive the root log. [`Rev::tid`] builds the
/// canonical form: 13 base32-sortable characters encoding a microsecond
/// timestamp and a 10-bit clock id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rev(String);

impl Rev {
    /// Wrap an existing revision string.
    ///
    /// Accepts any non-empty string of visible ASCII characters.
    pub fn new(rev: impl Into<String>) -> Result<Self, TypeError> {
        let rev = rev.into();
        if rev.is_empty() || !rev.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(TypeError::InvalidRev(rev));
        }
        Ok(Self(rev))
    }

    /// Build a timestamp identifier from microseconds since the UNIX epoch
    /// and a clock id. Bits beyond each field's width are dropped.
    pub fn tid(micros: u64, clock_id: u16) -> Self {
        let micros = micros & ((1u64 << TIMESTAMP_BITS) - 1);
        let clock = (clock_id as u64) & ((1u64 << CLOCK_ID_BITS) - 1);
        let mut value = (micros << CLOCK_ID_BITS) | clock;

        let mut out = [TID_ALPHABET[0]; TID_LEN];
        for slot in out.iter_mut().rev() {
            *slot = TID_ALPHABET[(value & 31) as usize];
            value >>= 5;
        }
        Self(out.iter().map(|&b| b as char).collect())
    }

    /// Decode the microsecond timestamp if this revision is a TID.
    pub fn timestamp_micros(&self) -> Option<u64> {
        if self.0.len() != TID_LEN {
            return None;
        }
        let mut value: u64 = 0;
        for (i, b) in self.0.bytes().enumerate() {
            let digit = TID_ALPHABET.iter().position(|&c| c == b)? as u64;
            // 13 digits carry 65 bits; the top two must be clear.
            if i == 0 && digit >= 8 {
                return None;
            }
            value = (value << 5) | digit;
        }
        Some(value >> CLOCK_ID_BITS)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Rev {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Rev {
    type Error = TypeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Rev> for String {
    fn from(rev: Rev) -> Self {
        rev.0
    }
}

impl fmt::Debug for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rev({})", self.0)
    }
}

impl fmt::Display for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Issues strictly increasing TID revisions.
///
/// Follows wall-clock time when it moves forward and otherwise advances by
/// one microsecond past the last issued value, so a stalled or rewound clock
/// never produces a revision that sorts before an earlier one.
#[derive(Debug)]
pub struct RevClock {
    clock_id: u16,
    last_micros: Mutex<u64>,
}

impl RevClock {
    pub fn new(clock_id: u16) -> Self {
        Self {
            clock_id,
            last_micros: Mutex::new(0),
        }
    }

    /// Issue the next revision.
    pub fn next_rev(&self) -> Rev {
        self.next_rev_at(now_micros())
    }

    /// Issue the next revision given an explicit wall-clock reading.
    pub fn next_rev_at(&self, now_micros: u64) -> Rev {
        let mut last = self.last_micros.lock().expect("rev clock poisoned");
        let micros = now_micros.max(*last + 1);
        *last = micros;
        Rev::tid(micros, self.clock_id)
    }

    /// Make sure later revisions sort after `seen` (e.g. a loaded head).
    pub fn observe(&self, seen: &Rev) {
        if let Some(micros) = seen.timestamp_micros() {
            let mut last = self.last_micros.lock().expect("rev clock poisoned");
            *last = (*last).max(micros);
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
