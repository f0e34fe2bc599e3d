use crate::types::{DfuType, TargetId};

/// The five lifecycle states. FIND_FWID is initial when the persisted
/// image is intact; every state is terminal via an [`EndReason`] exit.
///
/// [`EndReason`]: crate::types::EndReason
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Beaconing our own identity, listening for something newer.
    FindFwid,
    /// Asking the mesh for a specific target firmware.
    Req,
    /// A source has committed; waiting for the start frame.
    Ready,
    /// Receiving, flashing and relaying segments.
    Target,
    /// Transfer verified; draining in-flight relays before reboot.
    Rampdown,
}

/// The seven outbound beacon shapes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beacon {
    Fwid,
    Req(DfuType),
    Ready(DfuType),
}

/// Mutable record of the one in-progress transfer.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct Transaction {
    pub transaction_id: u32,
    /// 0 until a source commits; higher wins.
    pub authority: u8,
    pub target: TargetId,
    pub start_addr: u32,
    /// Staging destination; equals `start_addr` except for bootloader
    /// upgrades, which bank into the tail of the application region.
    pub bank_addr: u32,
    /// Image length in bytes, signature included.
    pub length: u32,
    /// 0 = unsigned transfer.
    pub signature_length: u16,
    pub segment_count: u16,
    pub segments_remaining: u16,
    /// Opaque integrity code echoed back to the source in READY beacons.
    pub ready_mic: u64,
    pub final_transfer: bool,
}

impl Transaction {
    /// Fresh record for a new request. Everything is reset except the
    /// target; `segments_remaining` holds its sentinel until the start
    /// frame fills in the real count.
    pub fn request(target: TargetId) -> Self {
        Transaction {
            target,
            segments_remaining: 0xFFFF,
            ..Transaction::default()
        }
    }
}

/// Fixed-size ring written modulo-mask. Best effort: eviction may
/// forget an entry (false negative), but an empty slot can never match
/// (no false positives).
#[derive(Debug)]
pub(crate) struct Cache<T, const N: usize> {
    slots: [Option<T>; N],
    cursor: usize,
}

impl<T: Copy + PartialEq, const N: usize> Cache<T, N> {
    const MASK: usize = {
        assert!(N.is_power_of_two());
        N - 1
    };

    pub fn new() -> Self {
        Cache {
            slots: [None; N],
            cursor: 0,
        }
    }

    pub fn insert(&mut self, value: T) {
        self.slots[self.cursor & Self::MASK] = Some(value);
        self.cursor = self.cursor.wrapping_add(1);
    }

    pub fn contains(&self, value: &T) -> bool {
        self.slots.iter().any(|slot| slot.as_ref() == Some(value))
    }
}
