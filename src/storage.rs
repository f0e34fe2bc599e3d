//! Persistent-storage seams: the read-only bootloader info store and
//! the asynchronous flash writer that banks incoming segments.

use crate::types::{
    DfuType, EcdsaKey, EndReason, FlashSegment, FwId, IntegrityFlags,
};

/// Why a flash write did not land. The core never retries; a failed
/// write simply does not advance transfer accounting.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// The bytes were already written (idempotent duplicate).
    Duplicate,
    /// Address outside the banked region, or no transfer in progress.
    Invalid,
    /// The writer's queue is full right now.
    Busy,
}

/// Segment banking engine. Writes are asynchronous on the writer's own
/// schedule; calls return immediately with a best-effort status.
pub trait FlashWriter {
    /// Open a transfer: destination image region, staging bank, total
    /// byte length and the carry-over validity flag from the start
    /// frame.
    fn start(
        &mut self,
        start_addr: u32,
        bank_addr: u32,
        length: u32,
        final_transfer: bool,
    ) -> Result<(), FlashError>;

    /// Stage `bytes` at `addr`. Duplicate or out-of-range writes fail
    /// without side effects.
    fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<(), FlashError>;

    /// Close the transfer; flushes whatever is still queued.
    fn end(&mut self);

    /// Read back previously staged bytes covering
    /// `[addr, addr + buf.len())`. `false` when any byte is unknown.
    fn entry(&self, addr: u32, buf: &mut [u8]) -> bool;

    /// Running SHA-256 over the staged image.
    fn sha256(&self, digest: &mut [u8; 32]);

    /// Hand the writer its journal scratch area, split in two halves.
    fn journal_init(&mut self, lo: u32, hi: u32);
}

/// Typed access to the persistent bootloader info page.
///
/// Entries live in flash; getters return borrows into the store. The
/// journal is handed out as a region descriptor because the flash
/// writer mutates it underneath us.
pub trait InfoStore {
    fn fwid(&self) -> Option<&FwId>;
    fn flags(&self) -> Option<&IntegrityFlags>;
    fn segment(&self, ty: DfuType) -> Option<&FlashSegment>;
    fn public_key(&self) -> Option<&EcdsaKey>;
    fn journal(&self) -> Option<FlashSegment>;

    /// Allocate and persist a fresh all-0xFF journal entry. `None` when
    /// the info page has no room, which is fatal at boot.
    fn journal_create(&mut self) -> Option<FlashSegment>;
}

/// The info entries the core resolves once at boot and then holds as
/// read-only views for its whole life.
#[derive(Clone, Copy)]
pub struct InfoView<'a> {
    pub fwid: &'a FwId,
    pub flags: &'a IntegrityFlags,
    pub segment_app: &'a FlashSegment,
    pub segment_sd: &'a FlashSegment,
    pub segment_bl: &'a FlashSegment,
    pub public_key: Option<&'a EcdsaKey>,
    pub journal: FlashSegment,
}

impl<'a> InfoView<'a> {
    /// Resolve every required entry, creating the journal if this is
    /// the first boot. The journal write is the one mutation; the
    /// store is read-only afterwards.
    pub fn load<S: InfoStore>(store: &'a mut S) -> Result<Self, EndReason> {
        let journal = match store.journal() {
            Some(region) => region,
            None => store.journal_create().ok_or(EndReason::InvalidStorage)?,
        };
        let store = &*store;

        Ok(InfoView {
            fwid: store.fwid().ok_or(EndReason::InvalidStorage)?,
            flags: store.flags().ok_or(EndReason::InvalidStorage)?,
            segment_app: store
                .segment(DfuType::App)
                .ok_or(EndReason::InvalidStorage)?,
            segment_sd: store
                .segment(DfuType::SoftDevice)
                .ok_or(EndReason::InvalidStorage)?,
            segment_bl: store
                .segment(DfuType::Bootloader)
                .ok_or(EndReason::InvalidStorage)?,
            public_key: store.public_key(),
            journal,
        })
    }

    pub fn segment(&self, ty: DfuType) -> &'a FlashSegment {
        match ty {
            DfuType::App => self.segment_app,
            DfuType::SoftDevice => self.segment_sd,
            DfuType::Bootloader => self.segment_bl,
        }
    }
}
