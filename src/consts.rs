/// Sector size in bytes, fixed for every card class.
pub const BLOCK_SIZE: usize = 512;
/// [`BLOCK_SIZE`] as `u32`.
pub const BLOCK_SIZE_U32: u32 = BLOCK_SIZE as u32;
/// [`BLOCK_SIZE`] as `u64`.
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;

pub mod commands {
    /// CMD base value.
    pub const CMD_BASE: u8 = 0x40;
    /// ACMD flag.
    pub const ACMD_FLAG: u8 = 0x80;
    /// GO_IDLE_STATE - init card in spi mode if CS low.
    pub const CMD0: u8 = CMD_BASE;
    /// SEND_OP_COND - initiate initialization of an MMC.
    pub const CMD1: u8 = CMD_BASE + 1;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = CMD_BASE + 8;
    /// SEND_CSD - read the Card Specific Data (CSD register).
    pub const CMD9: u8 = CMD_BASE + 9;
    /// SEND_CID - read the Card Identification (CID register).
    pub const CMD10: u8 = CMD_BASE + 10;
    /// STOP_TRANSMISSION - end multiple block read sequence.
    pub const CMD12: u8 = CMD_BASE + 12;
    /// SET_BLOCKLEN - set the block length for byte addressed cards.
    pub const CMD16: u8 = CMD_BASE + 16;
    /// READ_SINGLE_BLOCK - read a single data block from the card.
    pub const CMD17: u8 = CMD_BASE + 17;
    /// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card.
    pub const CMD18: u8 = CMD_BASE + 18;
    /// WRITE_BLOCK - write a single data block to the card.
    pub const CMD24: u8 = CMD_BASE + 24;
    /// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION.
    pub const CMD25: u8 = CMD_BASE + 25;
    /// ERASE_WR_BLK_START - first block of the erase range.
    pub const CMD32: u8 = CMD_BASE + 32;
    /// ERASE_WR_BLK_END - last block of the erase range.
    pub const CMD33: u8 = CMD_BASE + 33;
    /// ERASE - erase the selected range.
    pub const CMD38: u8 = CMD_BASE + 38;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = CMD_BASE + 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = CMD_BASE + 58;
    /// SD_STATUS - read the 64-byte SD status.
    pub const ACMD13: u8 = CMD_BASE + ACMD_FLAG + 13;
    /// SET_WR_BLK_ERASE_COUNT - pre-erase count for the next multiple block write.
    pub const ACMD23: u8 = CMD_BASE + ACMD_FLAG + 23;
    /// SD_SEND_OP_COMD - Sends host capacity support information and activates
    /// the card's initialization process.
    pub const ACMD41: u8 = CMD_BASE + ACMD_FLAG + 41;

    /// Plain command index (0..=63), for logs and errors.
    pub const fn index(cmd: u8) -> u8 {
        cmd & 0x3F
    }
}

pub mod args {
    /// CMD8 argument: 2.7-3.6V supply and the `0xAA` check pattern.
    pub const CMD8_CHECK_PATTERN: u32 = 0x0000_01AA;
    /// ACMD41 host capacity support bit.
    pub const ACMD41_HCS: u32 = 1 << 30;
}

pub mod tokens {
    /// Idle bus, card is not busy.
    pub const AVAILABLE: u8 = 0xFF;
    /// Start data token for read or write single block.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Stop token for write multiple blocks.
    pub const STOP_TRAN: u8 = 0xFD;
    /// Start data token for write multiple blocks.
    pub const WRITE_MULTIPLE: u8 = 0xFC;
    /// Mask for data response tokens after a write block operation.
    pub const DATA_RES_MASK: u8 = 0x1F;
    /// Write data accepted token.
    pub const DATA_RES_ACCEPTED: u8 = 0x05;
    /// Card capacity status bit in the first OCR byte.
    pub const OCR_CCS: u8 = 0x40;
}
