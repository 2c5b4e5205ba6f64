/// [`SdMmcSpi`](crate::SdMmcSpi) protocol error.
///
/// `T` - transport error type.
/// `S` - select and power switch error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    SelectError(S),
    /// Couldn't switch the card power.
    PowerError(S),
    /// No start token when reading data from the card.
    TimeoutReadBuffer,
    /// The card stayed busy.
    TimeoutWaitAvailable,
    /// The card didn't leave the idle state while polled with this command.
    TimeoutCommand(u8),
    /// This command was rejected.
    ErrorCommand(u8),
    /// The card didn't echo the CMD8 voltage check pattern.
    VoltageMismatch,
    /// CRC mismatch (card, host).
    CrcError(u16, u16),
    /// Unexpected token instead of a data block.
    ReadError,
    /// Data block rejected by the card.
    WriteError,
    /// The card can't erase single sectors.
    EraseNotSupported,
    /// Couldn't find the card.
    CardNotFound,
}

/// Result error of block and control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError<E> {
    /// Empty, misaligned or oversized buffer, or an unaddressable sector.
    InvalidParameter,
    /// No initialized card.
    NotReady,
    /// Write to a write protected card.
    WriteProtect,
    /// Protocol or bus failure.
    Hardware(E),
}
