//! The monitor-or-hashcode (MHC) word.
//!
//! Every instance and array carries one MHC word immediately after its
//! class cell. The low two bits tag one of four lock states; the upper
//! thirty bits carry a hashcode or a pointer depending on the tag. The
//! encoding is confined to this type: payloads are shifted in and out
//! through the accessors, never recovered by arithmetic at call sites.

use crate::header::Ptr;

const TAG_MASK: u32 = 0b11;

/// The four states of an object's MHC word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockWord {
    /// Not owned. The payload is the identity hashcode, 0 if unassigned.
    Unlocked { hash: u32 },
    /// Owned once by `owner`, no hashcode assigned, no waiters.
    SimpleLock { owner: Ptr },
    /// Owned by `owner`; depth and hashcode live in the owner thread's
    /// extended-lock slots. No waiters.
    ExtendedLock { owner: Ptr },
    /// Inflated: `monitor` holds owner, depth, hashcode and wait queues.
    Monitor { monitor: Ptr },
}

impl LockWord {
    /// The word for a freshly allocated object.
    pub const UNLOCKED: LockWord = LockWord::Unlocked { hash: 0 };

    /// Decode an MHC cell.
    #[must_use]
    pub fn from_cell(cell: u32) -> LockWord {
        let payload = cell >> 2;
        match cell & TAG_MASK {
            0 => LockWord::Unlocked { hash: payload },
            1 => LockWord::SimpleLock {
                owner: Ptr(payload),
            },
            2 => LockWord::ExtendedLock {
                owner: Ptr(payload),
            },
            _ => LockWord::Monitor {
                monitor: Ptr(payload),
            },
        }
    }

    /// Encode to an MHC cell.
    #[must_use]
    pub fn to_cell(self) -> u32 {
        match self {
            LockWord::Unlocked { hash } => hash << 2,
            LockWord::SimpleLock { owner } => (owner.0 << 2) | 1,
            LockWord::ExtendedLock { owner } => (owner.0 << 2) | 2,
            LockWord::Monitor { monitor } => (monitor.0 << 2) | 3,
        }
    }

    /// The heap pointer carried by this word, if the state carries one.
    /// Used by the collector to mark and relocate through MHC words.
    #[must_use]
    pub fn pointer(self) -> Option<Ptr> {
        match self {
            LockWord::Unlocked { .. } => None,
            LockWord::SimpleLock { owner } | LockWord::ExtendedLock { owner } => Some(owner),
            LockWord::Monitor { monitor } => Some(monitor),
        }
    }

    /// Rebuild this word with its carried pointer replaced.
    #[must_use]
    pub fn with_pointer(self, pointer: Ptr) -> LockWord {
        match self {
            LockWord::Unlocked { .. } => self,
            LockWord::SimpleLock { .. } => LockWord::SimpleLock { owner: pointer },
            LockWord::ExtendedLock { .. } => LockWord::ExtendedLock { owner: pointer },
            LockWord::Monitor { .. } => LockWord::Monitor { monitor: pointer },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let words = [
            LockWord::Unlocked { hash: 0 },
            LockWord::Unlocked { hash: 0x3FFF_FFFF },
            LockWord::SimpleLock { owner: Ptr(0x1234) },
            LockWord::ExtendedLock { owner: Ptr(0x1234) },
            LockWord::Monitor { monitor: Ptr(77) },
        ];
        for word in words {
            assert_eq!(LockWord::from_cell(word.to_cell()), word);
        }
    }

    #[test]
    fn test_pointer_carrying_states() {
        assert_eq!(LockWord::Unlocked { hash: 9 }.pointer(), None);
        assert_eq!(
            LockWord::SimpleLock { owner: Ptr(5) }.pointer(),
            Some(Ptr(5))
        );
        assert_eq!(
            LockWord::Monitor { monitor: Ptr(6) }
                .with_pointer(Ptr(7))
                .pointer(),
            Some(Ptr(7))
        );
    }
}
