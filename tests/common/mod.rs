//! Mock collaborators and a boot harness shared by the integration
//! tests. State the tests need to inspect lives behind `Rc<RefCell>`
//! so it stays reachable after the mocks move into the bootloader.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use meshboot::bootloader::Bootloader;
use meshboot::hal::{ChainLoader, StateTimer, Verifier};
use meshboot::packet::{
    encode_start_payload, DataPacket, DfuPacket, ReadyParams, RspPacket, SegmentRef,
    StartParams, StatePacket, DFU_PACKET_MAX_LEN,
};
use meshboot::storage::{FlashError, FlashWriter, InfoStore};
use meshboot::transport::{MeshPacket, Transport, TxConfig, TxRepeats};
use meshboot::types::{
    AppId, DfuType, EcdsaKey, EndReason, FlashSegment, FwId, IntegrityFlags, TargetId,
    SEGMENT_LENGTH,
};

pub const LOCAL_ADDR: [u8; 6] = [0xC0, 0xFF, 0xEE, 0x00, 0x00, 0x01];

pub const APP_SEGMENT: FlashSegment = FlashSegment {
    start: 0x1C000,
    length: 0x20000,
};
pub const SD_SEGMENT: FlashSegment = FlashSegment {
    start: 0x1000,
    length: 0x1B000,
};
pub const BL_SEGMENT: FlashSegment = FlashSegment {
    start: 0x3C000,
    length: 0x4000,
};

pub fn current_app() -> AppId {
    AppId {
        vendor: 0x59,
        product: 0x0001,
        version: 5,
    }
}

pub fn current_fwid() -> FwId {
    FwId {
        app: current_app(),
        bootloader: 1,
        softdevice: 0x64,
    }
}

/* ---- transport ---- */

#[derive(Default)]
pub struct TransportState {
    /// Every packet ever handed to `tx`, in order.
    pub sent: Vec<(MeshPacket, TxConfig)>,
    /// Still-queued transmissions by handle (infinite repeats only;
    /// finite sends are considered drained immediately).
    pub live: BTreeMap<u32, (MeshPacket, TxConfig)>,
    pub aborted: Vec<u32>,
    /// `Some(n)` = only n free buffers left; `None` = unlimited pool.
    pub pool: Option<usize>,
    next_handle: u32,
}

impl TransportState {
    /// Decoded DFU frames of every sent packet.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent
            .iter()
            .filter_map(|(pkt, _)| pkt.dfu_payload().map(|p| p.to_vec()))
            .collect()
    }

    /// The DFU frame of the one live beacon, if any.
    pub fn beacon_frame(&self) -> Option<Vec<u8>> {
        let mut live = self.live.values();
        let frame = live.next().map(|(pkt, _)| pkt.dfu_payload().unwrap().to_vec());
        assert!(live.next().is_none(), "more than one live beacon");
        frame
    }

    /// Sent DATA frames (kind 0xFC), i.e. relays.
    pub fn relays(&self) -> Vec<Vec<u8>> {
        self.sent_frames()
            .into_iter()
            .filter(|f| f.first() == Some(&meshboot::packet::KIND_DATA))
            .collect()
    }

    /// Sent DATA_RSP frames (kind 0xFA), i.e. served requests.
    pub fn responses(&self) -> Vec<Vec<u8>> {
        self.sent_frames()
            .into_iter()
            .filter(|f| f.first() == Some(&meshboot::packet::KIND_DATA_RSP))
            .collect()
    }
}

pub struct MockTransport {
    pub state: Rc<RefCell<TransportState>>,
}

impl Transport for MockTransport {
    type TxHandle = u32;

    fn acquire(&mut self) -> Option<MeshPacket> {
        let mut state = self.state.borrow_mut();
        match &mut state.pool {
            Some(0) => None,
            Some(free) => {
                *free -= 1;
                Some(MeshPacket::new())
            }
            None => Some(MeshPacket::new()),
        }
    }

    fn tx(&mut self, packet: MeshPacket, config: TxConfig) -> u32 {
        let mut state = self.state.borrow_mut();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.sent.push((packet.clone(), config));
        if config.repeats == TxRepeats::Infinite {
            state.live.insert(handle, (packet, config));
        } else if let Some(free) = &mut state.pool {
            // Finite sends drain instantly in the mock.
            *free += 1;
        }
        handle
    }

    fn tx_abort(&mut self, handle: u32) {
        let mut state = self.state.borrow_mut();
        if state.live.remove(&handle).is_some() {
            if let Some(free) = &mut state.pool {
                *free += 1;
            }
        }
        state.aborted.push(handle);
    }

    fn local_addr(&self) -> [u8; 6] {
        LOCAL_ADDR
    }
}

/* ---- flash writer ---- */

#[derive(Default)]
pub struct FlashState {
    pub started: Option<(u32, u32, u32, bool)>,
    pub ended: bool,
    pub journal: Option<(u32, u32)>,
    /// Byte-addressed staging area.
    pub bytes: BTreeMap<u32, u8>,
    /// Successful writes in order.
    pub writes: Vec<(u32, Vec<u8>)>,
    pub refuse_start: bool,
    pub fail_writes: bool,
}

impl FlashState {
    pub fn image(&self) -> Vec<u8> {
        self.bytes.values().copied().collect()
    }
}

pub struct MockFlash {
    pub state: Rc<RefCell<FlashState>>,
}

impl FlashWriter for MockFlash {
    fn start(
        &mut self,
        start_addr: u32,
        bank_addr: u32,
        length: u32,
        final_transfer: bool,
    ) -> Result<(), FlashError> {
        let mut state = self.state.borrow_mut();
        if state.refuse_start {
            return Err(FlashError::Busy);
        }
        state.started = Some((start_addr, bank_addr, length, final_transfer));
        state.ended = false;
        state.bytes.clear();
        state.writes.clear();
        Ok(())
    }

    fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<(), FlashError> {
        let mut state = self.state.borrow_mut();
        if state.fail_writes {
            return Err(FlashError::Busy);
        }
        if state.started.is_none() {
            return Err(FlashError::Invalid);
        }
        let already = (0..bytes.len()).all(|i| state.bytes.contains_key(&(addr + i as u32)));
        if already {
            return Err(FlashError::Duplicate);
        }
        for (i, byte) in bytes.iter().enumerate() {
            state.bytes.insert(addr + i as u32, *byte);
        }
        state.writes.push((addr, bytes.to_vec()));
        Ok(())
    }

    fn end(&mut self) {
        self.state.borrow_mut().ended = true;
    }

    fn entry(&self, addr: u32, buf: &mut [u8]) -> bool {
        let state = self.state.borrow();
        for (i, slot) in buf.iter_mut().enumerate() {
            match state.bytes.get(&(addr + i as u32)) {
                Some(byte) => *slot = *byte,
                None => return false,
            }
        }
        true
    }

    fn sha256(&self, digest: &mut [u8; 32]) {
        let state = self.state.borrow();
        let mut hasher = Sha256::new();
        hasher.update(state.image());
        digest.copy_from_slice(&hasher.finalize());
    }

    fn journal_init(&mut self, lo: u32, hi: u32) {
        self.state.borrow_mut().journal = Some((lo, hi));
    }
}

/* ---- info store ---- */

pub struct MemInfoStore {
    pub fwid: FwId,
    pub flags: IntegrityFlags,
    pub app: FlashSegment,
    pub sd: FlashSegment,
    pub bl: FlashSegment,
    pub key: Option<EcdsaKey>,
    pub journal: Option<FlashSegment>,
    pub journal_room: bool,
}

impl Default for MemInfoStore {
    fn default() -> Self {
        MemInfoStore {
            fwid: current_fwid(),
            flags: IntegrityFlags {
                sd_intact: true,
                app_intact: true,
            },
            app: APP_SEGMENT,
            sd: SD_SEGMENT,
            bl: BL_SEGMENT,
            key: None,
            journal: Some(FlashSegment {
                start: 0x7F000,
                length: 0x1000,
            }),
            journal_room: true,
        }
    }
}

impl InfoStore for MemInfoStore {
    fn fwid(&self) -> Option<&FwId> {
        Some(&self.fwid)
    }

    fn flags(&self) -> Option<&IntegrityFlags> {
        Some(&self.flags)
    }

    fn segment(&self, ty: DfuType) -> Option<&FlashSegment> {
        match ty {
            DfuType::App => Some(&self.app),
            DfuType::SoftDevice => Some(&self.sd),
            DfuType::Bootloader => Some(&self.bl),
        }
    }

    fn public_key(&self) -> Option<&EcdsaKey> {
        self.key.as_ref()
    }

    fn journal(&self) -> Option<FlashSegment> {
        self.journal
    }

    fn journal_create(&mut self) -> Option<FlashSegment> {
        if !self.journal_room {
            return None;
        }
        let region = FlashSegment {
            start: 0x7F000,
            length: 0x1000,
        };
        self.journal = Some(region);
        Some(region)
    }
}

/* ---- timer, verifier, chain loader ---- */

#[derive(Default)]
pub struct TimerState {
    pub armed: Option<Duration>,
    /// Every arm/disarm, `None` recording a disarm.
    pub history: Vec<Option<Duration>>,
}

pub struct MockTimer {
    pub state: Rc<RefCell<TimerState>>,
}

impl StateTimer for MockTimer {
    fn arm(&mut self, timeout: Duration) {
        let mut state = self.state.borrow_mut();
        state.armed = Some(timeout);
        state.history.push(Some(timeout));
    }

    fn disarm(&mut self) {
        let mut state = self.state.borrow_mut();
        state.armed = None;
        state.history.push(None);
    }
}

#[derive(Default)]
pub struct VerifierState {
    /// `(digest, signature)` of every verify call.
    pub calls: Vec<([u8; 32], Vec<u8>)>,
}

pub struct MockVerifier {
    pub accept: Rc<Cell<bool>>,
    pub state: Rc<RefCell<VerifierState>>,
}

impl Verifier for MockVerifier {
    fn verify(&self, _key: &EcdsaKey, digest: &[u8; 32], signature: &[u8]) -> bool {
        self.state
            .borrow_mut()
            .calls
            .push((*digest, signature.to_vec()));
        self.accept.get()
    }
}

pub struct MockLoader {
    pub boot_register: Rc<Cell<Option<u32>>>,
}

impl ChainLoader for MockLoader {
    fn set_boot_address(&mut self, addr: u32) {
        self.boot_register.set(Some(addr));
    }

    fn boot(&mut self, addr: u32) -> ! {
        panic!("chain-load to {addr:#x}");
    }
}

/* ---- harness ---- */

pub type TestBootloader<'a> =
    Bootloader<'a, MockTransport, MockFlash, MockTimer, MockVerifier, MockLoader>;

pub struct Mocks {
    pub transport: Rc<RefCell<TransportState>>,
    pub flash: Rc<RefCell<FlashState>>,
    pub timer: Rc<RefCell<TimerState>>,
    pub verifier: Rc<RefCell<VerifierState>>,
    pub verifier_accept: Rc<Cell<bool>>,
    pub boot_register: Rc<Cell<Option<u32>>>,
}

impl Mocks {
    pub fn new() -> Self {
        Mocks {
            transport: Rc::new(RefCell::new(TransportState::default())),
            flash: Rc::new(RefCell::new(FlashState::default())),
            timer: Rc::new(RefCell::new(TimerState::default())),
            verifier: Rc::new(RefCell::new(VerifierState::default())),
            verifier_accept: Rc::new(Cell::new(true)),
            boot_register: Rc::new(Cell::new(None)),
        }
    }
}

pub fn boot<'a>(
    store: &'a mut MemInfoStore,
    mocks: &Mocks,
) -> Result<TestBootloader<'a>, EndReason> {
    Bootloader::new(
        store,
        MockTransport {
            state: mocks.transport.clone(),
        },
        MockFlash {
            state: mocks.flash.clone(),
        },
        MockTimer {
            state: mocks.timer.clone(),
        },
        MockVerifier {
            accept: mocks.verifier_accept.clone(),
            state: mocks.verifier.clone(),
        },
        MockLoader {
            boot_register: mocks.boot_register.clone(),
        },
    )
}

/* ---- frame builders ---- */

fn encoded(packet: DfuPacket) -> Vec<u8> {
    let mut buf = [0u8; DFU_PACKET_MAX_LEN];
    let len = packet.encode(&mut buf).expect("frame fits");
    buf[..len].to_vec()
}

pub fn fwid_frame(fwid: FwId) -> Vec<u8> {
    encoded(DfuPacket::Fwid(fwid))
}

pub fn ready_frame(target: TargetId, authority: u8, transaction_id: u32, mic: u64) -> Vec<u8> {
    encoded(DfuPacket::State(StatePacket {
        authority,
        target,
        ready: Some(ReadyParams {
            transaction_id,
            mic,
        }),
    }))
}

pub fn start_frame(transaction_id: u32, start: StartParams) -> Vec<u8> {
    let mut payload = [0u8; 11];
    let len = encode_start_payload(&start, &mut payload).expect("start payload fits");
    encoded(DfuPacket::Data(DataPacket {
        transaction_id,
        segment: 0,
        payload: &payload[..len],
    }))
}

pub fn data_frame(transaction_id: u32, segment: u16, payload: &[u8]) -> Vec<u8> {
    encoded(DfuPacket::Data(DataPacket {
        transaction_id,
        segment,
        payload,
    }))
}

pub fn data_req_frame(transaction_id: u32, segment: u16) -> Vec<u8> {
    encoded(DfuPacket::DataReq(SegmentRef {
        transaction_id,
        segment,
    }))
}

pub fn data_rsp_frame(
    transaction_id: u32,
    segment: u16,
    payload: &[u8; SEGMENT_LENGTH],
) -> Vec<u8> {
    encoded(DfuPacket::DataRsp(RspPacket {
        transaction_id,
        segment,
        payload,
    }))
}

/// Deterministic 16-byte segment payload.
pub fn segment_payload(segment: u16) -> [u8; SEGMENT_LENGTH] {
    let mut payload = [0u8; SEGMENT_LENGTH];
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = (segment as u8).wrapping_mul(31).wrapping_add(i as u8);
    }
    payload
}
