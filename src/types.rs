//! Crate-wide vocabulary: firmware identities, transfer targets and the
//! terminal exit reasons shared by every subsystem.

use core::time::Duration;

/// 16-byte on-air/on-flash transfer unit.
pub const SEGMENT_LENGTH: usize = 16;

/// Flash page size used for bank staging arithmetic.
pub const PAGE_SIZE: u32 = 0x1000;

/// 16-bit mesh service UUID carried in every advertisement.
pub const MESH_UUID: u16 = 0xFEE4;

/// Largest accepted image signature (ECDSA P-256, r ++ s).
pub const SIGNATURE_MAX_LEN: usize = 64;

/// Flash-erased soft-device version, meaning "no valid soft-device".
pub const SD_VERSION_INVALID: u32 = 0xFFFF_FFFF;

/// Flash-erased application version, meaning "no valid application".
pub const APP_VERSION_INVALID: u16 = 0xFFFF;

pub const TIMEOUT_FIND_FWID: Duration = Duration::from_millis(500);
pub const TIMEOUT_REQ: Duration = Duration::from_millis(1000);
pub const TIMEOUT_READY: Duration = Duration::from_millis(3000);
pub const TIMEOUT_TARGET: Duration = Duration::from_millis(5000);
pub const TIMEOUT_RAMPDOWN: Duration = Duration::from_millis(1000);

/// Which firmware component a transfer replaces.
///
/// The discriminants are the on-air `dfu_type` byte.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuType {
    SoftDevice = 0x01,
    Bootloader = 0x02,
    App = 0x04,
}

impl DfuType {
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DfuType::SoftDevice),
            0x02 => Some(DfuType::Bootloader),
            0x04 => Some(DfuType::App),
            _ => None,
        }
    }
}

/// Application identity: who built it, what it is, which revision.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppId {
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

impl AppId {
    /// Whether this id is an upgrade of `current`: same vendor and
    /// product, strictly newer version.
    pub fn supersedes(&self, current: &AppId) -> bool {
        self.vendor == current.vendor
            && self.product == current.product
            && self.version > current.version
    }
}

/// Composite firmware identity a node advertises: application id plus
/// bootloader and soft-device versions.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FwId {
    pub app: AppId,
    pub bootloader: u16,
    pub softdevice: u32,
}

/// The component a transfer targets, together with its identity.
///
/// A transaction's type and target firmware id always travel together,
/// so they are one enum rather than a tag plus a union.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetId {
    App(AppId),
    Bootloader(u16),
    SoftDevice(u32),
}

impl TargetId {
    pub fn ty(&self) -> DfuType {
        match self {
            TargetId::App(_) => DfuType::App,
            TargetId::Bootloader(_) => DfuType::Bootloader,
            TargetId::SoftDevice(_) => DfuType::SoftDevice,
        }
    }
}

impl Default for TargetId {
    fn default() -> Self {
        TargetId::App(AppId::default())
    }
}

/// `(start, length)` descriptor of a legal flash region. Also describes
/// the journal scratch area.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashSegment {
    pub start: u32,
    pub length: u32,
}

impl FlashSegment {
    /// Whether `[addr, addr + length)` lies entirely inside this segment.
    pub fn contains(&self, addr: u32, length: u32) -> bool {
        let Some(end) = addr.checked_add(length) else {
            return false;
        };
        addr >= self.start && end <= self.start + self.length
    }
}

/// Image integrity flags from the persistent info store.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityFlags {
    pub sd_intact: bool,
    pub app_intact: bool,
}

/// Uncompressed ECDSA P-256 public key (x ++ y).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcdsaKey(pub [u8; 64]);

/// Why the bootloader is done. Every termination funnels through this
/// one enum; the owner maps it to a chain-load target.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Rampdown completed; reboot into the freshly received image.
    Success,
    /// FIND_FWID expired without hearing of anything newer. Not an
    /// error, just the boot-through path into the application.
    FwidValid,
    /// REQ or READY timed out without a source committing.
    NoStart,
    /// A completed transfer failed its signature check.
    Unauthorized,
    /// A transport buffer was unavailable when one was required to
    /// make progress.
    OutOfMemory,
    /// A required persistent info entry is missing or malformed.
    InvalidStorage,
}
