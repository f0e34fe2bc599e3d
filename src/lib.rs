//! Mesh-networked DFU bootloader core.
//!
//! Nodes advertise the firmware they run; when the mesh advertises
//! something newer, a node negotiates a transfer, receives 16-byte
//! segments over broadcast advertising, banks them to flash, verifies
//! the image signature and reboots into the result.
//!
//! This crate is the chip-independent core: the state machine, packet
//! dispatch, segment engine and transaction bookkeeping. The radio,
//! flash writer, persistent info store, RTC and chain-jump live behind
//! the traits in [`transport`], [`storage`] and [`hal`], so the same
//! core drives real hardware and host tests alike.
//!
//! Event flow: the platform feeds received frames to
//! [`Bootloader::rx`] and state timeouts to
//! [`Bootloader::timer_expired`]. Both are non-blocking and
//! single-threaded; an `Err(EndReason)` from either is the terminal
//! exit, handed to [`Bootloader::shutdown`] to chain-load the next
//! image.

#![cfg_attr(not(test), no_std)]

// This must go FIRST so that the other modules see its macros.
mod fmt;

pub mod bootloader;
pub mod hal;
pub mod packet;
pub mod storage;
pub mod transport;
pub mod types;

pub use bootloader::{segment_count, Beacon, Bootloader, State, Transaction};
pub use types::{
    AppId, DfuType, EcdsaKey, EndReason, FlashSegment, FwId, IntegrityFlags, TargetId,
};
