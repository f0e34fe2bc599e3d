//! Wire codec for the five DFU frame kinds.
//!
//! Frames are a one-byte kind followed by a kind-specific payload, all
//! multi-byte fields little-endian. Parsing borrows payload bytes from
//! the receive buffer; malformed or unknown frames parse to `None` and
//! are dropped by the dispatcher without comment.

pub mod types;

use crate::types::{AppId, DfuType, FwId, TargetId, SEGMENT_LENGTH};
pub use types::{
    DataPacket, ReadyParams, RspPacket, SegmentRef, StartParams, StatePacket, DFU_PACKET_MAX_LEN,
    KIND_DATA, KIND_DATA_REQ, KIND_DATA_RSP, KIND_FWID, KIND_STATE,
};

/// The encode buffer was too small for the frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeError;

/// A parsed inbound DFU frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuPacket<'a> {
    Fwid(FwId),
    State(StatePacket),
    Data(DataPacket<'a>),
    DataReq(SegmentRef),
    DataRsp(RspPacket<'a>),
}

impl<'a> DfuPacket<'a> {
    pub fn parse(bytes: &'a [u8]) -> Option<DfuPacket<'a>> {
        let (kind, rest) = take_u8(bytes)?;
        match kind {
            KIND_FWID => {
                let (fwid, _) = take_fwid(rest)?;
                Some(DfuPacket::Fwid(fwid))
            }
            KIND_STATE => {
                let (ty, rest) = take_u8(rest)?;
                let ty = DfuType::from_wire(ty)?;
                let (authority, rest) = take_u8(rest)?;
                if authority == 0 {
                    let (target, _) = take_target(ty, rest)?;
                    Some(DfuPacket::State(StatePacket {
                        authority,
                        target,
                        ready: None,
                    }))
                } else {
                    let (transaction_id, rest) = take_u32(rest)?;
                    let (mic, rest) = take_u64(rest)?;
                    let (target, _) = take_target(ty, rest)?;
                    Some(DfuPacket::State(StatePacket {
                        authority,
                        target,
                        ready: Some(ReadyParams {
                            transaction_id,
                            mic,
                        }),
                    }))
                }
            }
            KIND_DATA => {
                let (transaction_id, rest) = take_u32(rest)?;
                let (segment, payload) = take_u16(rest)?;
                Some(DfuPacket::Data(DataPacket {
                    transaction_id,
                    segment,
                    payload,
                }))
            }
            KIND_DATA_REQ => {
                let (transaction_id, rest) = take_u32(rest)?;
                let (segment, _) = take_u16(rest)?;
                Some(DfuPacket::DataReq(SegmentRef {
                    transaction_id,
                    segment,
                }))
            }
            KIND_DATA_RSP => {
                let (transaction_id, rest) = take_u32(rest)?;
                let (segment, rest) = take_u16(rest)?;
                let (payload, _) = take_n(rest, SEGMENT_LENGTH)?;
                Some(DfuPacket::DataRsp(RspPacket {
                    transaction_id,
                    segment,
                    payload: payload.try_into().ok()?,
                }))
            }
            _ => None,
        }
    }

    /// Encode into `buf`, returning the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        let total = buf.len();
        let rest = match self {
            DfuPacket::Fwid(fwid) => {
                let rest = put_u8(KIND_FWID, buf)?;
                put_fwid(fwid, rest)?
            }
            DfuPacket::State(state) => {
                let rest = put_u8(KIND_STATE, buf)?;
                let rest = put_u8(state.dfu_type() as u8, rest)?;
                let rest = put_u8(state.authority, rest)?;
                let rest = match &state.ready {
                    Some(ready) => {
                        let rest = put_u32(ready.transaction_id, rest)?;
                        put_u64(ready.mic, rest)?
                    }
                    None => rest,
                };
                put_target(&state.target, rest)?
            }
            DfuPacket::Data(data) => {
                let rest = put_u8(KIND_DATA, buf)?;
                let rest = put_u32(data.transaction_id, rest)?;
                let rest = put_u16(data.segment, rest)?;
                put_n(data.payload, rest)?
            }
            DfuPacket::DataReq(req) => {
                let rest = put_u8(KIND_DATA_REQ, buf)?;
                let rest = put_u32(req.transaction_id, rest)?;
                put_u16(req.segment, rest)?
            }
            DfuPacket::DataRsp(rsp) => {
                let rest = put_u8(KIND_DATA_RSP, buf)?;
                let rest = put_u32(rsp.transaction_id, rest)?;
                let rest = put_u16(rsp.segment, rest)?;
                put_n(rsp.payload, rest)?
            }
        };
        Ok(total - rest.len())
    }
}

impl<'a> DataPacket<'a> {
    /// Reinterpret a segment-0 frame as transfer metadata. `None` for
    /// ordinary segments or a truncated start payload.
    pub fn as_start(&self) -> Option<StartParams> {
        if self.segment != 0 {
            return None;
        }
        let (start_address, rest) = take_u32(self.payload)?;
        let (length_words, rest) = take_u32(rest)?;
        let (signature_length, rest) = take_u16(rest)?;
        let (last, _) = take_u8(rest)?;
        Some(StartParams {
            start_address,
            length_words,
            signature_length,
            final_transfer: last != 0,
        })
    }
}

/// Encode the segment-0 metadata payload of a start frame.
pub fn encode_start_payload(
    start: &StartParams,
    buf: &mut [u8],
) -> Result<usize, EncodeError> {
    let total = buf.len();
    let rest = put_u32(start.start_address, buf)?;
    let rest = put_u32(start.length_words, rest)?;
    let rest = put_u16(start.signature_length, rest)?;
    let rest = put_u8(start.final_transfer as u8, rest)?;
    Ok(total - rest.len())
}

fn take_n(bytes: &[u8], n: usize) -> Option<(&[u8], &[u8])> {
    (bytes.len() >= n).then(|| bytes.split_at(n))
}

fn take_u8(bytes: &[u8]) -> Option<(u8, &[u8])> {
    let (now, later) = take_n(bytes, 1)?;
    Some((now[0], later))
}

fn take_u16(bytes: &[u8]) -> Option<(u16, &[u8])> {
    let (now, later) = take_n(bytes, 2)?;
    Some((u16::from_le_bytes(now.try_into().ok()?), later))
}

fn take_u32(bytes: &[u8]) -> Option<(u32, &[u8])> {
    let (now, later) = take_n(bytes, 4)?;
    Some((u32::from_le_bytes(now.try_into().ok()?), later))
}

fn take_u64(bytes: &[u8]) -> Option<(u64, &[u8])> {
    let (now, later) = take_n(bytes, 8)?;
    Some((u64::from_le_bytes(now.try_into().ok()?), later))
}

fn take_fwid(bytes: &[u8]) -> Option<(FwId, &[u8])> {
    let (vendor, rest) = take_u16(bytes)?;
    let (product, rest) = take_u16(rest)?;
    let (version, rest) = take_u16(rest)?;
    let (bootloader, rest) = take_u16(rest)?;
    let (softdevice, rest) = take_u32(rest)?;
    Some((
        FwId {
            app: AppId {
                vendor,
                product,
                version,
            },
            bootloader,
            softdevice,
        },
        rest,
    ))
}

fn take_target(ty: DfuType, bytes: &[u8]) -> Option<(TargetId, &[u8])> {
    match ty {
        DfuType::App => {
            let (vendor, rest) = take_u16(bytes)?;
            let (product, rest) = take_u16(rest)?;
            let (version, rest) = take_u16(rest)?;
            Some((
                TargetId::App(AppId {
                    vendor,
                    product,
                    version,
                }),
                rest,
            ))
        }
        DfuType::Bootloader => {
            let (version, rest) = take_u16(bytes)?;
            Some((TargetId::Bootloader(version), rest))
        }
        DfuType::SoftDevice => {
            let (version, rest) = take_u32(bytes)?;
            Some((TargetId::SoftDevice(version), rest))
        }
    }
}

fn put_n<'a>(data: &[u8], buf: &'a mut [u8]) -> Result<&'a mut [u8], EncodeError> {
    if buf.len() < data.len() {
        return Err(EncodeError);
    }
    let (now, later) = buf.split_at_mut(data.len());
    now.copy_from_slice(data);
    Ok(later)
}

fn put_u8(val: u8, buf: &mut [u8]) -> Result<&mut [u8], EncodeError> {
    put_n(&[val], buf)
}

fn put_u16(val: u16, buf: &mut [u8]) -> Result<&mut [u8], EncodeError> {
    put_n(&val.to_le_bytes(), buf)
}

fn put_u32(val: u32, buf: &mut [u8]) -> Result<&mut [u8], EncodeError> {
    put_n(&val.to_le_bytes(), buf)
}

fn put_u64(val: u64, buf: &mut [u8]) -> Result<&mut [u8], EncodeError> {
    put_n(&val.to_le_bytes(), buf)
}

fn put_fwid<'a>(fwid: &FwId, buf: &'a mut [u8]) -> Result<&'a mut [u8], EncodeError> {
    let rest = put_u16(fwid.app.vendor, buf)?;
    let rest = put_u16(fwid.app.product, rest)?;
    let rest = put_u16(fwid.app.version, rest)?;
    let rest = put_u16(fwid.bootloader, rest)?;
    put_u32(fwid.softdevice, rest)
}

fn put_target<'a>(target: &TargetId, buf: &'a mut [u8]) -> Result<&'a mut [u8], EncodeError> {
    match target {
        TargetId::App(app) => {
            let rest = put_u16(app.vendor, buf)?;
            let rest = put_u16(app.product, rest)?;
            put_u16(app.version, rest)
        }
        TargetId::Bootloader(version) => put_u16(*version, buf),
        TargetId::SoftDevice(version) => put_u32(*version, buf),
    }
}
