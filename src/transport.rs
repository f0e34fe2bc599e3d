//! Broadcast-advertising transport seam.
//!
//! The core never talks to a radio. It fills [`MeshPacket`] buffers
//! acquired from the transport's pool and hands them back for
//! transmission; ownership of the buffer moves with it, which is the
//! borrow-checked rendition of the original reference counting (`tx`
//! consumes a reference, `tx_abort` gives it back to the pool).

use heapless::Vec;

use crate::packet::EncodeError;
use crate::types::MESH_UUID;

/// Non-connectable undirected advertising PDU.
pub const ADV_TYPE_NONCONN_IND: u8 = 0x02;

/// Service-data AD type carrying the mesh UUID.
pub const MESH_ADV_DATA_TYPE: u8 = 0x16;

/// AD-structure bytes ahead of the DFU frame: AD type + 16-bit UUID.
pub const DFU_PACKET_ADV_OVERHEAD: u8 = 3;

/// Legacy advertising payload capacity.
pub const ADV_DATA_MAX: usize = 31;

/// How often a queued packet is (re)transmitted.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxRepeats {
    /// Keep transmitting until aborted; used for the standing beacons.
    Infinite,
    Finite(u8),
}

/// Spacing class between repeats; the transport owns the actual timing.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxInterval {
    Regular,
    Exponential,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxConfig {
    pub repeats: TxRepeats,
    pub interval: TxInterval,
}

const TX_REPEATS_DEFAULT: u8 = 5;

impl TxConfig {
    pub const FWID: TxConfig = TxConfig {
        repeats: TxRepeats::Infinite,
        interval: TxInterval::Regular,
    };
    pub const DFU_REQ: TxConfig = TxConfig {
        repeats: TxRepeats::Infinite,
        interval: TxInterval::Regular,
    };
    pub const READY: TxConfig = TxConfig {
        repeats: TxRepeats::Infinite,
        interval: TxInterval::Regular,
    };
    pub const DATA: TxConfig = TxConfig {
        repeats: TxRepeats::Finite(TX_REPEATS_DEFAULT),
        interval: TxInterval::Regular,
    };
    pub const RSP: TxConfig = TxConfig {
        repeats: TxRepeats::Finite(TX_REPEATS_DEFAULT),
        interval: TxInterval::Regular,
    };
}

/// One advertising buffer: source address, PDU type and AD payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshPacket {
    source: [u8; 6],
    pdu_type: u8,
    adv_data: Vec<u8, ADV_DATA_MAX>,
}

impl Default for MeshPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshPacket {
    pub fn new() -> Self {
        MeshPacket {
            source: [0; 6],
            pdu_type: ADV_TYPE_NONCONN_IND,
            adv_data: Vec::new(),
        }
    }

    pub fn set_source(&mut self, addr: [u8; 6]) {
        self.source = addr;
    }

    pub fn source(&self) -> [u8; 6] {
        self.source
    }

    /// Fill the advertisement envelope around an encoded DFU frame:
    /// `[len, 0x16, uuid lo, uuid hi, frame…]`.
    pub fn set_dfu_payload(&mut self, dfu: &[u8]) -> Result<(), EncodeError> {
        self.adv_data.clear();
        self.pdu_type = ADV_TYPE_NONCONN_IND;
        let ad_len = DFU_PACKET_ADV_OVERHEAD as usize + dfu.len();
        if ad_len >= ADV_DATA_MAX {
            return Err(EncodeError);
        }
        // Infallible: length checked against capacity above.
        let _ = self.adv_data.push(ad_len as u8);
        let _ = self.adv_data.push(MESH_ADV_DATA_TYPE);
        let _ = self.adv_data.push((MESH_UUID & 0xFF) as u8);
        let _ = self.adv_data.push((MESH_UUID >> 8) as u8);
        let _ = self.adv_data.extend_from_slice(dfu);
        Ok(())
    }

    /// The DFU frame inside the envelope, if the AD structure is ours.
    pub fn dfu_payload(&self) -> Option<&[u8]> {
        let ad = self.adv_data.as_slice();
        if ad.len() < 4
            || ad[1] != MESH_ADV_DATA_TYPE
            || ad[2] != (MESH_UUID & 0xFF) as u8
            || ad[3] != (MESH_UUID >> 8) as u8
        {
            return None;
        }
        let ad_len = ad[0] as usize;
        let end = 1 + ad_len;
        if end > ad.len() {
            return None;
        }
        Some(&ad[4..end])
    }
}

/// Packet pool plus tx scheduler, provided by the platform.
pub trait Transport {
    /// Identifies one queued transmission for a later abort.
    type TxHandle;

    /// Claim a free buffer from the pool; `None` when exhausted.
    fn acquire(&mut self) -> Option<MeshPacket>;

    /// Queue `packet` for transmission. The buffer moves to the
    /// transport and is released when the last repeat is sent or the
    /// transmission is aborted.
    fn tx(&mut self, packet: MeshPacket, config: TxConfig) -> Self::TxHandle;

    /// Cancel a queued transmission and release its buffer.
    fn tx_abort(&mut self, handle: Self::TxHandle);

    /// This node's 6-byte advertising address.
    fn local_addr(&self) -> [u8; 6];
}
