use crate::{
    card::CardClass,
    csd::{CidData, CsdData, SdStatusData},
    response::OcrData,
};

/// Drive control request, see [`SdMmcSpi::control`](crate::SdMmcSpi::control).
///
/// Getters query the card itself, unlike the cached geometry accessors.
#[derive(Debug)]
pub enum ControlRequest<'a> {
    /// Wait for the card to finish its internal write process.
    Sync,
    /// Sector count decoded from a fresh CSD.
    GetSectorCount(&'a mut u32),
    /// Sector size in bytes.
    GetSectorSize(&'a mut u16),
    /// Erase block size in sectors.
    GetEraseBlockSize(&'a mut u32),
    /// Erase the inclusive sector range.
    Trim { start: u32, end: u32 },
    /// Detected card class.
    GetCardClass(&'a mut CardClass),
    /// Raw CSD register.
    GetCsd(&'a mut CsdData),
    /// Raw CID register.
    GetCid(&'a mut CidData),
    /// Raw OCR register.
    GetOcr(&'a mut OcrData),
    /// Raw SD status.
    GetSdStatus(&'a mut SdStatusData),
}
