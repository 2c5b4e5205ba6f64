/// SPI clock rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum SpiSpeed {
    /// Identification rate, 100-400 kHz.
    Slow,
    /// Transfer rate, after the card is initialized.
    Fast,
}

/// Switches the SPI clock rate.
///
/// Implemented for the SPI peripheral handed to [`SdMmcSpi`](crate::SdMmcSpi).
pub trait SetSpiSpeed {
    fn set_spi_speed(&mut self, speed: SpiSpeed);
}
