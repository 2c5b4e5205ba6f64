use crate::consts::{BLOCK_SIZE, BLOCK_SIZE_U32, BLOCK_SIZE_U64};

use bitflags::bitflags;
use size::Size;

/// How data commands address the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Addressing {
    /// Argument is a byte offset (standard capacity cards).
    Byte,
    /// Argument is the sector index (SDHC/SDXC).
    Block,
}

/// Card class, detected on initialization.
///
/// Only SDv2 cards can be block addressed, MMC and SDv1 always take byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum CardClass {
    Mmc,
    SdV1,
    SdV2(Addressing),
}

impl CardClass {
    pub fn addressing(self) -> Addressing {
        match self {
            CardClass::SdV2(addressing) => addressing,
            CardClass::Mmc | CardClass::SdV1 => Addressing::Byte,
        }
    }

    /// SD family, as opposed to MMC.
    pub fn is_sd(self) -> bool {
        !matches!(self, CardClass::Mmc)
    }

    pub fn name(self) -> &'static str {
        match self {
            CardClass::Mmc => "MMC",
            CardClass::SdV1 => "SDv1",
            CardClass::SdV2(Addressing::Byte) => "SDv2",
            CardClass::SdV2(Addressing::Block) => "SDHC",
        }
    }

    /// Command argument for `sector`, `None` when a byte offset doesn't fit 32 bits.
    pub fn address(self, sector: u32) -> Option<u32> {
        match self.addressing() {
            Addressing::Byte => sector.checked_mul(BLOCK_SIZE_U32),
            Addressing::Block => Some(sector),
        }
    }
}

bitflags! {
    /// Drive status reported to the filesystem.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriveStatus: u8 {
        /// Card not initialized, every transfer is refused.
        const NOT_INITIALIZED = 0x01;
        /// No card answered the last initialization.
        const NO_MEDIA = 0x02;
        /// Card write protected by its CSD.
        const WRITE_PROTECTED = 0x04;
    }
}

/// Card geometry, decoded after initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Count of 512-byte sectors.
    pub sector_count: u32,
    /// Erase block size in sectors.
    pub erase_block_sectors: u32,
}

impl Geometry {
    pub const SECTOR_SIZE: usize = BLOCK_SIZE;

    /// Card capacity.
    pub fn capacity(&self) -> Size {
        Size::from_bytes(u64::from(self.sector_count) * BLOCK_SIZE_U64)
    }
}
