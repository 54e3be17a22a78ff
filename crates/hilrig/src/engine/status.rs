//! Status bitmask shared by every node in the bench tree.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Independent status bits. Any combination is valid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(u32);

impl Status {
    pub const NONE: Status = Status(0);
    pub const INIT: Status = Status(1 << 0);
    pub const READY: Status = Status(1 << 1);
    pub const RUNNING: Status = Status(1 << 2);
    pub const HAS_RUN: Status = Status(1 << 3);
    pub const FAIL: Status = Status(1 << 4);
    pub const BROKEN: Status = Status(1 << 5);
    /// The unit's hardware variant supports this check.
    pub const VALID: Status = Status(1 << 6);
    /// A failure on a check the hardware variant does not support.
    pub const INVALID_INTERFACE: Status = Status(1 << 7);
    /// Waiting for operator input.
    pub const PENDING: Status = Status(1 << 8);
    pub const POWER: Status = Status(1 << 9);
    pub const OCCUPIED: Status = Status(1 << 10);

    const NAMES: [(Status, &'static str); 11] = [
        (Status::INIT, "INIT"),
        (Status::READY, "READY"),
        (Status::RUNNING, "RUNNING"),
        (Status::HAS_RUN, "HAS_RUN"),
        (Status::FAIL, "FAIL"),
        (Status::BROKEN, "BROKEN"),
        (Status::VALID, "VALID"),
        (Status::INVALID_INTERFACE, "INVALID_INTERFACE"),
        (Status::PENDING, "PENDING"),
        (Status::POWER, "POWER"),
        (Status::OCCUPIED, "OCCUPIED"),
    ];

    const ALL: u32 = (1 << 11) - 1;

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Unknown bits are dropped.
    pub const fn from_bits(bits: u32) -> Self {
        Status(bits & Self::ALL)
    }

    pub const fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Status) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Names of the set bits, lowest bit first.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for Status {
    type Output = Status;

    fn bitor(self, rhs: Status) -> Status {
        Status(self.0 | rhs.0)
    }
}

impl BitOrAssign for Status {
    fn bitor_assign(&mut self, rhs: Status) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Status {
    type Output = Status;

    fn bitand(self, rhs: Status) -> Status {
        Status(self.0 & rhs.0)
    }
}

impl Not for Status {
    type Output = Status;

    fn not(self) -> Status {
        Status(!self.0 & Self::ALL)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        f.write_str(&self.names().join("|"))
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({self})")
    }
}

/// Atomically updated [`Status`].
#[derive(Debug, Default)]
pub struct StatusCell(AtomicU32);

impl StatusCell {
    pub fn new(initial: Status) -> Self {
        Self(AtomicU32::new(initial.bits()))
    }

    pub fn get(&self) -> Status {
        Status::from_bits(self.0.load(Ordering::SeqCst))
    }

    /// Clear `off`, then set `on`; a bit named in both ends up set.
    /// Returns the new value.
    pub fn update(&self, on: Status, off: Status) -> Status {
        let apply = |cur: u32| (cur & !off.bits()) | on.bits();
        let prev = match self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| Some(apply(cur)))
        {
            Ok(prev) | Err(prev) => prev,
        };
        Status::from_bits(apply(prev))
    }

    pub fn contains(&self, bits: Status) -> bool {
        self.get().contains(bits)
    }
}
