/// Represents config for [`SdMmcSpi`](crate::SdMmcSpi).
pub trait SdMmcSpiConfig {
    /// Max bytes polled for an R1 after a command frame.
    const READ_R1_ATTEMPTS: usize;
    /// Time for the card to release the bus (`0xFF`) before a command or data packet.
    const CARD_READY_TIMEOUT_MS: u32;
    /// Time for the start-of-data token of a read.
    const DATA_TOKEN_TIMEOUT_MS: u32;
    /// Time for the card to leave the idle state during initialization.
    const INIT_TIMEOUT_MS: u32;
    /// Power rail off time of the power cycle.
    const POWER_DOWN_MS: u32;
    /// Time for an erase to finish.
    const ERASE_TIMEOUT_MS: u32;
    /// Max sectors per read or write call.
    const MAX_TRANSFER_SECTORS: usize;
    /// Check the CRC16 trailing every received data block.
    const VERIFY_READ_CRC: bool;
}

/// Default implementation of [`SdMmcSpiConfig`](crate::SdMmcSpiConfig).
pub struct DefaultSdMmcSpiConfig;

impl SdMmcSpiConfig for DefaultSdMmcSpiConfig {
    const READ_R1_ATTEMPTS: usize = 10;
    const CARD_READY_TIMEOUT_MS: u32 = 500;
    const DATA_TOKEN_TIMEOUT_MS: u32 = 200;
    const INIT_TIMEOUT_MS: u32 = 1000;
    const POWER_DOWN_MS: u32 = 10;
    const ERASE_TIMEOUT_MS: u32 = 30_000;
    const MAX_TRANSFER_SECTORS: usize = 128;
    const VERIFY_READ_CRC: bool = false;
}
