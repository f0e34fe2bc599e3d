//! Remaining platform seams: the state-timeout timer, the signature
//! verifier and the chain-load helper.

use core::time::Duration;

use crate::types::EcdsaKey;

/// One-shot timer backing the state machine's timeouts. Arming is part
/// of entering a state, disarming part of leaving it; an armed timer
/// never outlives its state.
pub trait StateTimer {
    /// (Re)arm; supersedes any earlier deadline.
    fn arm(&mut self, timeout: Duration);

    /// Cancel the pending deadline and clear its interrupt.
    fn disarm(&mut self);
}

/// ECDSA P-256 verification seam.
pub trait Verifier {
    /// Whether `signature` is a valid signature of `digest` under
    /// `public_key`.
    fn verify(&self, public_key: &EcdsaKey, digest: &[u8; 32], signature: &[u8]) -> bool;
}

/// Jump-to-image helper; owns the chip's boot-address register.
pub trait ChainLoader {
    /// Persist `addr` as the entry the ROM loader takes after reset.
    fn set_boot_address(&mut self, addr: u32);

    /// Transfer control to the image at `addr`. Implementations may
    /// hit a breakpoint first so a debugger can intercept the exit.
    fn boot(&mut self, addr: u32) -> !;
}
