//! The DFU core: state machine, beacon builder, packet dispatch,
//! segment engine, request/response servicer and finalizer.
//!
//! Strictly event-driven: the transport feeds received frames into
//! [`Bootloader::rx`], the platform RTC feeds timeouts into
//! [`Bootloader::timer_expired`]. Neither entry point blocks or
//! suspends, and both run to completion before the next event. An
//! `Err(EndReason)` out of either is the terminal funnel — the owner
//! hands it to [`Bootloader::shutdown`] to chain-load the next image.

pub mod types;

use crate::hal::{ChainLoader, StateTimer, Verifier};
use crate::packet::{
    DataPacket, DfuPacket, ReadyParams, RspPacket, SegmentRef, StartParams, StatePacket,
    DFU_PACKET_MAX_LEN,
};
use crate::storage::{FlashWriter, InfoStore, InfoView};
use crate::transport::{Transport, TxConfig};
use crate::types::{
    AppId, DfuType, EndReason, FwId, TargetId, APP_VERSION_INVALID, PAGE_SIZE,
    SD_VERSION_INVALID, SEGMENT_LENGTH, SIGNATURE_MAX_LEN, TIMEOUT_FIND_FWID, TIMEOUT_RAMPDOWN,
    TIMEOUT_READY, TIMEOUT_REQ, TIMEOUT_TARGET,
};

use types::Cache;
pub use types::{Beacon, State, Transaction};

/// Served-segment ring. Kept small on purpose: an over-eager cache
/// starves the requesting node of retransmissions.
const REQ_CACHE_SIZE: usize = 4;
const TID_CACHE_SIZE: usize = 8;

/// Segments needed for a transfer of `length_words` 4-byte words
/// starting at `start_address`. A start address off the 16-byte grid
/// shifts the count; transfers cap at 0xFFFF segments.
pub fn segment_count(length_words: u32, start_address: u32) -> u16 {
    let bytes = length_words.saturating_mul(4);
    let count = bytes
        .saturating_add(start_address & 0xF)
        .div_ceil(SEGMENT_LENGTH as u32);
    count.min(0xFFFF) as u16
}

/// The bootloader context: every piece of mutable state the core owns,
/// plus its five platform seams. Lives from init to the first reboot.
pub struct Bootloader<'a, T, F, R, V, C>
where
    T: Transport,
{
    transport: T,
    flash: F,
    timer: R,
    verifier: V,
    loader: C,
    info: InfoView<'a>,
    state: State,
    transaction: Transaction,
    /// The one outstanding outbound beacon.
    beacon: Option<T::TxHandle>,
    req_cache: Cache<u16, REQ_CACHE_SIZE>,
    tid_cache: Cache<u32, TID_CACHE_SIZE>,
}

impl<'a, T, F, R, V, C> Bootloader<'a, T, F, R, V, C>
where
    T: Transport,
    F: FlashWriter,
    R: StateTimer,
    V: Verifier,
    C: ChainLoader,
{
    /// Boot-time init: resolve the persistent info entries, hand the
    /// flash writer its journal, latch our own start address into the
    /// chip's boot register, then enter the first state — straight to
    /// a recovery request when a persisted image is broken, FIND_FWID
    /// otherwise.
    pub fn new<S: InfoStore>(
        store: &'a mut S,
        transport: T,
        mut flash: F,
        timer: R,
        verifier: V,
        mut loader: C,
    ) -> Result<Self, EndReason> {
        let info = InfoView::load(store)?;
        flash.journal_init(
            info.journal.start,
            info.journal.start + info.journal.length / 2,
        );
        loader.set_boot_address(info.segment_bl.start);

        let mut bootloader = Bootloader {
            transport,
            flash,
            timer,
            verifier,
            loader,
            info,
            state: State::FindFwid,
            transaction: Transaction::default(),
            beacon: None,
            req_cache: Cache::new(),
            tid_cache: Cache::new(),
        };

        if !info.flags.sd_intact || info.fwid.softdevice == SD_VERSION_INVALID {
            warn!("soft-device not intact, requesting recovery");
            bootloader.start_req(TargetId::SoftDevice(0))?;
        } else if !info.flags.app_intact || info.fwid.app.version == APP_VERSION_INVALID {
            warn!("application not intact, requesting recovery");
            bootloader.start_req(TargetId::App(AppId::default()))?;
        } else {
            bootloader.start_find_fwid()?;
        }
        Ok(bootloader)
    }

    /// One received DFU frame. Malformed and unknown frames are
    /// dropped without comment; all validation lives in the handlers.
    pub fn rx(&mut self, bytes: &[u8]) -> Result<(), EndReason> {
        // Longer than the advertising envelope can carry: not ours.
        if bytes.len() > DFU_PACKET_MAX_LEN {
            return Ok(());
        }
        let Some(packet) = DfuPacket::parse(bytes) else {
            return Ok(());
        };
        match packet {
            DfuPacket::Fwid(fwid) => self.handle_fwid(&fwid),
            DfuPacket::State(state) => self.handle_state(&state),
            DfuPacket::Data(data) => self.handle_data(&data),
            DfuPacket::DataReq(req) => self.handle_data_req(&req),
            DfuPacket::DataRsp(rsp) => self.handle_data_rsp(&rsp),
        }
    }

    /// The state timeout fired.
    pub fn timer_expired(&mut self) -> Result<(), EndReason> {
        self.timer.disarm();
        match self.state {
            State::FindFwid => Err(EndReason::FwidValid),
            State::Req | State::Ready => Err(EndReason::NoStart),
            State::Target => {
                warn!("transfer went silent, renegotiating");
                self.start_req(self.transaction.target)
            }
            State::Rampdown => Err(EndReason::Success),
        }
    }

    /// Terminal exit: chain-load the image `reason` routes to.
    pub fn shutdown(&mut self, reason: EndReason) -> ! {
        let addr = self.boot_address(reason);
        self.loader.boot(addr)
    }

    /// Where `reason` sends the node: an unauthorized image reboots
    /// back into the bootloader for another attempt, everything else
    /// boots the application.
    pub fn boot_address(&self, reason: EndReason) -> u32 {
        match reason {
            EndReason::Unauthorized => self.info.segment_bl.start,
            _ => self.info.segment_app.start,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /* ---- state entries ---- */

    fn start_find_fwid(&mut self) -> Result<(), EndReason> {
        self.beacon_set(Beacon::Fwid)?;
        self.timer.arm(TIMEOUT_FIND_FWID);
        self.state = State::FindFwid;
        self.transaction = Transaction::default();
        Ok(())
    }

    fn start_req(&mut self, target: TargetId) -> Result<(), EndReason> {
        self.transaction = Transaction::request(target);
        self.beacon_set(Beacon::Req(target.ty()))?;
        self.timer.arm(TIMEOUT_REQ);
        self.state = State::Req;
        Ok(())
    }

    fn start_ready(&mut self, authority: u8, offer: &ReadyParams) -> Result<(), EndReason> {
        self.transaction.authority = authority;
        self.transaction.transaction_id = offer.transaction_id;
        self.transaction.ready_mic = offer.mic;
        self.beacon_set(Beacon::Ready(self.transaction.target.ty()))?;
        self.timer.arm(TIMEOUT_READY);
        self.state = State::Ready;
        Ok(())
    }

    /// READY → TARGET once the start frame has populated the
    /// transaction. Returns whether the transition happened (a flash
    /// writer refusal falls back to renegotiation instead).
    fn start_target(&mut self) -> Result<bool, EndReason> {
        let t = &self.transaction;
        if self
            .flash
            .start(t.start_addr, t.bank_addr, t.length, t.final_transfer)
            .is_err()
        {
            warn!("flash writer refused transfer, renegotiating");
            self.start_req(self.transaction.target)?;
            return Ok(false);
        }
        // Targets receive quietly.
        if let Some(handle) = self.beacon.take() {
            self.transport.tx_abort(handle);
        }
        self.timer.arm(TIMEOUT_TARGET);
        self.state = State::Target;
        info!(
            "transfer started: {} segments",
            self.transaction.segment_count
        );
        Ok(true)
    }

    fn start_rampdown(&mut self) {
        self.timer.arm(TIMEOUT_RAMPDOWN);
        self.state = State::Rampdown;
    }

    /* ---- beacon builder ---- */

    /// Replace the outgoing beacon: abort and release the current one,
    /// fill a fresh buffer with `kind`'s payload and queue it with the
    /// kind's repeat/interval class.
    fn beacon_set(&mut self, kind: Beacon) -> Result<(), EndReason> {
        if let Some(handle) = self.beacon.take() {
            self.transport.tx_abort(handle);
        }
        let mut packet = self
            .transport
            .acquire()
            .ok_or(EndReason::OutOfMemory)?;
        packet.set_source(self.transport.local_addr());

        let mut frame = [0u8; DFU_PACKET_MAX_LEN];
        let (dfu, config) = match kind {
            Beacon::Fwid => (DfuPacket::Fwid(*self.info.fwid), TxConfig::FWID),
            Beacon::Req(_) => (
                DfuPacket::State(StatePacket {
                    authority: self.transaction.authority,
                    target: self.transaction.target,
                    ready: None,
                }),
                TxConfig::DFU_REQ,
            ),
            Beacon::Ready(_) => (
                DfuPacket::State(StatePacket {
                    authority: self.transaction.authority,
                    target: self.transaction.target,
                    ready: Some(ReadyParams {
                        transaction_id: self.transaction.transaction_id,
                        mic: self.transaction.ready_mic,
                    }),
                }),
                TxConfig::READY,
            ),
        };
        let len = dfu
            .encode(&mut frame)
            .map_err(|_| EndReason::OutOfMemory)?;
        packet
            .set_dfu_payload(&frame[..len])
            .map_err(|_| EndReason::OutOfMemory)?;

        debug!("beacon: {:?}", kind);
        self.beacon = Some(self.transport.tx(packet, config));
        Ok(())
    }

    /* ---- packet handlers ---- */

    fn handle_fwid(&mut self, remote: &FwId) -> Result<(), EndReason> {
        if self.state != State::FindFwid {
            return Ok(());
        }
        let ours = self.info.fwid;
        if remote.bootloader > ours.bootloader {
            // Always upgrade the bootloader first.
            info!("newer bootloader on mesh: {}", remote.bootloader);
            self.timer.disarm();
            self.start_req(TargetId::Bootloader(remote.bootloader))
        } else if remote.app.supersedes(&ours.app) {
            self.timer.disarm();
            if remote.softdevice != ours.softdevice {
                // The newer app mandates a different soft-device; pull
                // that in before the app itself.
                info!("newer app needs soft-device {}", remote.softdevice);
                self.start_req(TargetId::SoftDevice(remote.softdevice))
            } else {
                info!("newer app on mesh: {}", remote.app.version);
                self.start_req(TargetId::App(remote.app))
            }
        } else {
            Ok(())
        }
    }

    /// Whether a STATE frame is an offer for the transfer we are
    /// asking about: same type, same target identity, and not a
    /// transaction we recently walked away from.
    fn offer_matches(&self, state: &StatePacket) -> bool {
        if state.dfu_type() != self.transaction.target.ty() {
            return false;
        }
        if let Some(offer) = &state.ready {
            if self.tid_cache.contains(&offer.transaction_id) {
                return false;
            }
        }
        state.target == self.transaction.target
    }

    fn handle_state(&mut self, state: &StatePacket) -> Result<(), EndReason> {
        match self.state {
            State::Req => {
                if state.authority > 0 && self.offer_matches(state) {
                    if let Some(offer) = state.ready {
                        info!(
                            "source committed: authority {} tid {}",
                            state.authority, offer.transaction_id
                        );
                        self.start_ready(state.authority, &offer)?;
                    }
                }
                Ok(())
            }
            State::Ready => {
                if self.offer_matches(state) {
                    if let Some(offer) = state.ready {
                        // Competing sources converge on the
                        // lexicographic maximum. No re-beacon; the
                        // next start frame resolves the race.
                        let current =
                            (self.transaction.authority, self.transaction.transaction_id);
                        if (state.authority, offer.transaction_id) > current {
                            debug!(
                                "better offer: authority {} tid {}",
                                state.authority, offer.transaction_id
                            );
                            self.transaction.authority = state.authority;
                            self.transaction.transaction_id = offer.transaction_id;
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /* ---- segment engine ---- */

    fn handle_data(&mut self, data: &DataPacket) -> Result<(), EndReason> {
        if data.transaction_id != self.transaction.transaction_id {
            return Ok(());
        }
        let mut relay = false;
        match self.state {
            State::Ready => {
                if data.segment == 0 {
                    if let Some(start) = data.as_start() {
                        relay = self.accept_start(&start)?;
                    }
                } else {
                    // We missed the start frame. Blacklist this
                    // transaction and renegotiate from scratch.
                    self.tid_cache.insert(self.transaction.transaction_id);
                    self.start_req(self.transaction.target)?;
                }
            }
            State::Target => {
                if data.segment != 0 && data.segment <= self.transaction.segment_count {
                    let addr = self.segment_addr(data.segment);
                    if self.flash.write(addr, data.payload).is_ok() {
                        self.transaction.segments_remaining -= 1;
                        relay = true;
                    }
                }
                if self.transaction.segments_remaining == 0 {
                    self.finalize()?;
                }
            }
            _ => return Ok(()),
        }
        if relay {
            self.relay(data)?;
        }
        Ok(())
    }

    /// Validate a start frame and populate the transaction. `Ok(true)`
    /// means the transfer is underway; an invalid start leaves us in
    /// READY waiting for a sane source.
    fn accept_start(&mut self, start: &StartParams) -> Result<bool, EndReason> {
        let Some(bytes) = start.length_words.checked_mul(4) else {
            return Ok(false);
        };
        let signature_length = u32::from(start.signature_length);
        if bytes == 0
            || signature_length > SIGNATURE_MAX_LEN as u32
            || signature_length > bytes
        {
            return Ok(false);
        }
        let region = self.info.segment(self.transaction.target.ty());
        if !region.contains(start.start_address, bytes) {
            warn!("start frame outside segment, ignoring");
            return Ok(false);
        }

        let count = segment_count(start.length_words, start.start_address);
        let bank_addr = match self.transaction.target.ty() {
            // A replacement bootloader cannot overwrite the running
            // one; stage it in the tail of the application region
            // with a one-page guard.
            DfuType::Bootloader => {
                let app = self.info.segment_app;
                app.start + app.length - bytes.next_multiple_of(PAGE_SIZE) - PAGE_SIZE
            }
            _ => start.start_address,
        };

        let t = &mut self.transaction;
        t.start_addr = start.start_address;
        t.bank_addr = bank_addr;
        t.length = bytes;
        t.signature_length = start.signature_length;
        t.final_transfer = start.final_transfer;
        t.segment_count = count;
        t.segments_remaining = count;

        self.start_target()
    }

    /// Flash address of a 1-based segment. Segment 1 sits at the start
    /// address itself; later segments fall on the 16-byte grid that
    /// contains it.
    fn segment_addr(&self, segment: u16) -> u32 {
        if segment == 1 {
            self.transaction.start_addr
        } else {
            ((u32::from(segment) - 1) << 4) + (self.transaction.start_addr & !0xF)
        }
    }

    /// Re-broadcast a frame that advanced our state, stamped with our
    /// own source address.
    fn relay(&mut self, data: &DataPacket) -> Result<(), EndReason> {
        let mut packet = self
            .transport
            .acquire()
            .ok_or(EndReason::OutOfMemory)?;
        let mut frame = [0u8; DFU_PACKET_MAX_LEN];
        let len = DfuPacket::Data(*data)
            .encode(&mut frame)
            .map_err(|_| EndReason::OutOfMemory)?;
        packet.set_source(self.transport.local_addr());
        packet
            .set_dfu_payload(&frame[..len])
            .map_err(|_| EndReason::OutOfMemory)?;
        let _ = self.transport.tx(packet, TxConfig::DATA);
        Ok(())
    }

    /* ---- finalizer ---- */

    fn finalize(&mut self) -> Result<(), EndReason> {
        self.flash.end();
        if self.signature_ok() {
            info!("transfer complete, image authorized");
            self.tid_cache.insert(self.transaction.transaction_id);
            self.start_rampdown();
            Ok(())
        } else {
            warn!("transfer complete, image NOT authorized");
            Err(EndReason::Unauthorized)
        }
    }

    fn signature_ok(&self) -> bool {
        // Without a provisioned key every transfer is accepted.
        let Some(key) = self.info.public_key else {
            return true;
        };
        // With a key, an unsigned transfer never is.
        let signature_length = usize::from(self.transaction.signature_length);
        if signature_length == 0 {
            return false;
        }
        let mut digest = [0u8; 32];
        self.flash.sha256(&mut digest);

        // The signature is the tail of the banked image.
        let mut signature = [0u8; SIGNATURE_MAX_LEN];
        let signature = &mut signature[..signature_length];
        let addr = self.transaction.bank_addr + self.transaction.length
            - signature_length as u32;
        if !self.flash.entry(addr, signature) {
            return false;
        }
        self.verifier.verify(key, &digest, signature)
    }

    /* ---- request/response servicer ---- */

    fn handle_data_req(&mut self, req: &SegmentRef) -> Result<(), EndReason> {
        if req.transaction_id != self.transaction.transaction_id || req.segment == 0 {
            return Ok(());
        }
        if self.req_cache.contains(&req.segment) {
            // Answered recently; let the earlier response propagate.
            return Ok(());
        }
        let mut bytes = [0u8; SEGMENT_LENGTH];
        if !self.flash.entry(self.segment_addr(req.segment), &mut bytes) {
            return Ok(());
        }
        // Service is best-effort: no free buffer, no response.
        let Some(mut packet) = self.transport.acquire() else {
            return Ok(());
        };
        let mut frame = [0u8; DFU_PACKET_MAX_LEN];
        let rsp = DfuPacket::DataRsp(RspPacket {
            transaction_id: req.transaction_id,
            segment: req.segment,
            payload: &bytes,
        });
        let len = rsp.encode(&mut frame).map_err(|_| EndReason::OutOfMemory)?;
        packet.set_source(self.transport.local_addr());
        packet
            .set_dfu_payload(&frame[..len])
            .map_err(|_| EndReason::OutOfMemory)?;
        let _ = self.transport.tx(packet, TxConfig::RSP);
        self.req_cache.insert(req.segment);
        debug!("served segment {}", req.segment);
        Ok(())
    }

    fn handle_data_rsp(&mut self, rsp: &RspPacket) -> Result<(), EndReason> {
        if rsp.transaction_id != self.transaction.transaction_id
            || self.state != State::Target
            || rsp.segment == 0
            || rsp.segment > self.transaction.segment_count
        {
            return Ok(());
        }
        // Out-of-band catch-up. Progress accounting stays with the
        // DATA path, which remains the sole progress authority.
        let _ = self.flash.write(self.segment_addr(rsp.segment), rsp.payload);
        Ok(())
    }
}
