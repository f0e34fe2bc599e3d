use crate::types::{DfuType, TargetId};

/// On-air packet kind discriminants.
pub const KIND_FWID: u8 = 0xFE;
pub const KIND_STATE: u8 = 0xFD;
pub const KIND_DATA: u8 = 0xFC;
pub const KIND_DATA_REQ: u8 = 0xFB;
pub const KIND_DATA_RSP: u8 = 0xFA;

/// Largest DFU frame the 31-byte advertising envelope can carry.
pub const DFU_PACKET_MAX_LEN: usize = 27;

/// STATE frame: a node requesting (`authority == 0`) or offering
/// (`authority > 0`) a transfer of `target`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatePacket {
    pub authority: u8,
    pub target: TargetId,
    /// Present on READY offers, absent on plain requests.
    pub ready: Option<ReadyParams>,
}

impl StatePacket {
    pub fn dfu_type(&self) -> DfuType {
        self.target.ty()
    }
}

/// Offer parameters carried by a READY frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyParams {
    pub transaction_id: u32,
    /// Opaque integrity code, echoed back to the source verbatim.
    pub mic: u64,
}

/// DATA frame. Segment 0 carries start metadata instead of image bytes;
/// [`DataPacket::as_start`] reinterprets it.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPacket<'a> {
    pub transaction_id: u32,
    pub segment: u16,
    pub payload: &'a [u8],
}

/// Transfer metadata carried by the segment-0 DATA frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartParams {
    pub start_address: u32,
    /// Image length in 4-byte words, signature included.
    pub length_words: u32,
    pub signature_length: u16,
    /// Whether the target segment is valid once this transfer lands.
    pub final_transfer: bool,
}

/// DATA_REQ frame: a peer asking for a retransmission of one segment.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRef {
    pub transaction_id: u32,
    pub segment: u16,
}

/// DATA_RSP frame: a peer supplying one full segment out of band.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RspPacket<'a> {
    pub transaction_id: u32,
    pub segment: u16,
    pub payload: &'a [u8; crate::types::SEGMENT_LENGTH],
}
