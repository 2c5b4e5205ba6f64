use crate::{
    bus::SetSpiSpeed,
    card::{CardClass, DriveStatus},
    config::SdMmcSpiConfig,
    consts::{commands, tokens, BLOCK_SIZE},
    control::ControlRequest,
    error::{DiskError, Error},
    timing::TickSource,
    BusError, ErrorFor, SdMmcSpi,
};

use diskio::{DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag};
use embedded_hal::blocking::spi::{Transfer, Write};
use switch_hal::OutputSwitch;

/// Result of block and control operations.
type DiskResult<T, Spi, Cs> = Result<T, DiskError<ErrorFor<Spi, Cs>>>;

impl<Spi, Cs, Power, Ticks, Config> SdMmcSpi<Spi, Cs, Power, Ticks, Config>
where
    Spi: Transfer<u8> + Write<u8, Error = BusError<Spi>> + SetSpiSpeed,
    Cs: OutputSwitch,
    Power: OutputSwitch<Error = <Cs as OutputSwitch>::Error>,
    Ticks: TickSource,
    Config: SdMmcSpiConfig,
    BusError<Spi>: core::fmt::Debug,
    <Cs as OutputSwitch>::Error: core::fmt::Debug,
{
    /// Validate buffer for read/write, count of blocks in it.
    fn block_count(buf_len: usize) -> DiskResult<usize, Spi, Cs> {
        let count = buf_len / BLOCK_SIZE;

        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 || count > Config::MAX_TRANSFER_SECTORS {
            error!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            Err(DiskError::InvalidParameter)
        } else {
            Ok(count)
        }
    }

    /// Validate initialized, class of the card.
    fn ready_card(&self) -> DiskResult<CardClass, Spi, Cs> {
        match self.card {
            Some(card) if !self.status.contains(DriveStatus::NOT_INITIALIZED) => Ok(card),
            _ => Err(DiskError::NotReady),
        }
    }

    /// Convert sector to the command argument of `card`.
    fn card_address(card: CardClass, sector: u32) -> DiskResult<u32, Spi, Cs> {
        card.address(sector).ok_or(DiskError::InvalidParameter)
    }

    /// Read `buf.len() / 512` sectors starting at `sector`.
    pub fn read(&self, buf: &mut [u8], sector: u32) -> DiskResult<(), Spi, Cs> {
        let block_count = Self::block_count(buf.len())?;
        let card = self.ready_card()?;
        let address = Self::card_address(card, sector)?;

        self.deselect_after(|s| {
            if block_count == 1 {
                s.command_ok(commands::CMD17, address)?;
                s.receive_block(buf)
            } else {
                s.command_ok(commands::CMD18, address)?;

                let received = buf
                    .chunks_mut(BLOCK_SIZE)
                    .try_for_each(|chunk| s.receive_block(chunk));
                let stopped = s.send_command(commands::CMD12, 0x0000_0000);

                received?;
                stopped.map(|_| ())
            }
        })
        .map_err(DiskError::Hardware)
    }

    /// Write `buf.len() / 512` sectors starting at `sector`.
    pub fn write(&self, buf: &[u8], sector: u32) -> DiskResult<(), Spi, Cs> {
        let block_count = Self::block_count(buf.len())?;
        let card = self.ready_card()?;

        if self.status.contains(DriveStatus::WRITE_PROTECTED) {
            return Err(DiskError::WriteProtect);
        }

        let address = Self::card_address(card, sector)?;

        self.deselect_after(|s| {
            if block_count == 1 {
                s.command_ok(commands::CMD24, address)?;
                s.transmit_block(tokens::DATA_START_BLOCK, buf)
            } else {
                if card.is_sd() {
                    // pre-erase hint, the answer doesn't matter
                    s.send_command(commands::ACMD23, block_count as u32)?;
                }

                s.command_ok(commands::CMD25, address)?;

                let written = buf
                    .chunks(BLOCK_SIZE)
                    .try_for_each(|block| s.transmit_block(tokens::WRITE_MULTIPLE, block));
                let stopped = s.transmit_stop();

                written?;
                stopped
            }
        })
        .map_err(DiskError::Hardware)
    }

    /// Flush pending writes. Nothing is cached, so this never fails.
    pub fn sync(&self) -> DiskResult<(), Spi, Cs> {
        Ok(())
    }

    /// Erase sectors `start..=end`.
    fn trim(&self, card: CardClass, start: u32, end: u32) -> DiskResult<(), Spi, Cs> {
        if start > end {
            return Err(DiskError::InvalidParameter);
        }

        if !card.is_sd() {
            warn!("Trim is not supported by {}", card.name());
            return Err(DiskError::Hardware(Error::EraseNotSupported));
        }

        let first = Self::card_address(card, start)?;
        let last = Self::card_address(card, end)?;

        info!("SD erase of sectors {}..={}", start, end);

        self.deselect_after(|s| {
            if !s.read_csd()?.sector_erase_supported() {
                warn!("SD can't erase single sectors");
                return Err(Error::EraseNotSupported);
            }

            s.command_ok(commands::CMD32, first)?;
            s.command_ok(commands::CMD33, last)?;
            s.command_ok(commands::CMD38, 0x0000_0000)?;

            if s.wait_ready(Config::ERASE_TIMEOUT_MS)? {
                Ok(())
            } else {
                Err(Error::TimeoutWaitAvailable)
            }
        })
        .map_err(DiskError::Hardware)
    }

    /// Miscellaneous drive controls other than data read/write.
    pub fn control(&self, request: ControlRequest<'_>) -> DiskResult<(), Spi, Cs> {
        let card = self.ready_card()?;

        match request {
            ControlRequest::Sync => self.deselect_after(|s| {
                if s.select()? {
                    Ok(())
                } else {
                    Err(Error::TimeoutWaitAvailable)
                }
            }),
            ControlRequest::GetSectorCount(count) => self
                .deselect_after(|s| s.read_csd())
                .map(|csd| *count = csd.sector_count()),
            ControlRequest::GetSectorSize(size) => {
                *size = BLOCK_SIZE as u16;
                Ok(())
            }
            ControlRequest::GetEraseBlockSize(sectors) => self
                .deselect_after(|s| {
                    let csd = s.read_csd()?;
                    s.read_erase_block_sectors(card, &csd)
                })
                .map(|erase_block_sectors| *sectors = erase_block_sectors),
            ControlRequest::Trim { start, end } => return self.trim(card, start, end),
            ControlRequest::GetCardClass(class) => {
                *class = card;
                Ok(())
            }
            ControlRequest::GetCsd(csd) => {
                self.deselect_after(|s| s.read_register(commands::CMD9, csd))
            }
            ControlRequest::GetCid(cid) => {
                self.deselect_after(|s| s.read_register(commands::CMD10, cid))
            }
            ControlRequest::GetOcr(ocr) => self.deselect_after(|s| s.read_ocr(ocr)),
            ControlRequest::GetSdStatus(status) => {
                self.deselect_after(|s| s.read_sd_status(status))
            }
        }
        .map_err(DiskError::Hardware)
    }
}

/// Map a block operation error onto the `diskio` error set.
fn into_diskio<T, S>(err: DiskError<Error<T, S>>) -> DiskioError<Error<T, S>> {
    match err {
        DiskError::InvalidParameter => DiskioError::InvalidArgument,
        DiskError::NotReady => DiskioError::NotInitialized,
        DiskError::WriteProtect => DiskioError::WriteProtected,
        DiskError::Hardware(err) => DiskioError::Hardware(err),
    }
}

impl<Spi, Cs, Power, Ticks, Config> DiskioDevice for SdMmcSpi<Spi, Cs, Power, Ticks, Config>
where
    Spi: Transfer<u8> + Write<u8, Error = BusError<Spi>> + SetSpiSpeed,
    Cs: OutputSwitch,
    Power: OutputSwitch<Error = <Cs as OutputSwitch>::Error>,
    Ticks: TickSource,
    Config: SdMmcSpiConfig,
    BusError<Spi>: core::fmt::Debug,
    <Cs as OutputSwitch>::Error: core::fmt::Debug,
{
    type HardwareError = ErrorFor<Spi, Cs>;

    fn status(&self) -> Status {
        let mut status = Status::default();

        if self.status.contains(DriveStatus::NOT_INITIALIZED) {
            status |= StatusFlag::NotInitialized;
        }

        if self.status.contains(DriveStatus::WRITE_PROTECTED) {
            status |= StatusFlag::WriteProtected;
        }

        status
    }

    fn reset(&mut self) {
        info!("SD reset invoked");
        self.status.insert(DriveStatus::NOT_INITIALIZED);
        self.card = None;
        self.geometry = None;
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        if !self.status.contains(DriveStatus::NOT_INITIALIZED) {
            warn!("SD already is initialized");
            return Err(DiskioError::AlreadyInitialized);
        }

        if SdMmcSpi::initialize(self).contains(DriveStatus::NOT_INITIALIZED) {
            Err(DiskioError::Hardware(Error::CardNotFound))
        } else {
            Ok(())
        }
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        let sector = u32::try_from(lba).map_err(|_| DiskioError::InvalidArgument)?;

        SdMmcSpi::read(self, buf, sector).map_err(into_diskio)
    }

    fn write(&self, buf: &[u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        let sector = u32::try_from(lba).map_err(|_| DiskioError::InvalidArgument)?;

        SdMmcSpi::write(self, buf, sector).map_err(into_diskio)
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => self.control(ControlRequest::Sync).map_err(into_diskio),
            IoctlCmd::GetSectorCount(count) => {
                let mut sectors = 0;
                self.control(ControlRequest::GetSectorCount(&mut sectors))
                    .map_err(into_diskio)?;
                *count = Lba::from(sectors);
                Ok(())
            }
            IoctlCmd::GetSectorSize(sector_size) => {
                let mut size = 0;
                self.control(ControlRequest::GetSectorSize(&mut size))
                    .map_err(into_diskio)?;
                *sector_size = usize::from(size);
                Ok(())
            }
            IoctlCmd::GetBlockSize(block_size) => {
                let mut sectors = 0;
                self.control(ControlRequest::GetEraseBlockSize(&mut sectors))
                    .map_err(into_diskio)?;
                *block_size = sectors as usize;
                Ok(())
            }
            IoctlCmd::CtrlTrim(&(start, end)) => {
                let start = u32::try_from(start).map_err(|_| DiskioError::InvalidArgument)?;
                let end = u32::try_from(end).map_err(|_| DiskioError::InvalidArgument)?;

                self.control(ControlRequest::Trim { start, end })
                    .map_err(into_diskio)
            }
        }
    }
}
