//! SD/MMC block driver over SPI, written in Embedded Rust.
//!
//! This crate detects and initializes MMC, SDv1 and SDv2 (SDSC/SDHC/SDXC) cards on an SPI
//! bus and exposes them as a device of fixed 512-byte sectors, either through the
//! [`SdMmcSpi`] methods or the [`DiskioDevice`] trait.
//!
//! The driver owns the SPI peripheral, the chip select and power switches, and a
//! millisecond [`TickSource`]. Every wait on the card is a busy poll bounded by a
//! deadline; nothing blocks forever on absent or faulty media.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

mod bus;
mod card;
mod config;
mod consts;
mod control;
mod crc;
mod csd;
mod error;
mod io;
mod response;
mod timing;

#[cfg(test)]
mod sim;

pub use crate::{
    bus::{SetSpiSpeed, SpiSpeed},
    card::{Addressing, CardClass, DriveStatus, Geometry},
    config::{DefaultSdMmcSpiConfig, SdMmcSpiConfig},
    consts::BLOCK_SIZE,
    control::ControlRequest,
    csd::{CapacityProvider, CidData, Csd, CsdData, CsdV1, CsdV2, SdStatusData},
    error::{DiskError, Error},
    response::OcrData,
    timing::TickSource,
};
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};

use crate::{
    consts::{args, commands, tokens, BLOCK_SIZE_U32},
    crc::{crc16, crc7},
    csd::sd_status_erase_block_sectors,
    response::{R1Response, R7Payload},
    timing::{pause, poll_until, Deadline},
};

use core::{cell::RefCell, marker::PhantomData};
use embedded_hal::blocking::spi::{Transfer, Write};
use switch_hal::OutputSwitch;

/// Transport error of the SPI peripheral.
type BusError<Spi> = <Spi as Transfer<u8>>::Error;
/// Error type alias.
type ErrorFor<Spi, Cs> = Error<BusError<Spi>, <Cs as OutputSwitch>::Error>;

/// SD Card SPI driver.
///
/// `Spi` - SPI, full duplex byte exchange plus clock rate control.
/// `Cs` - Chip select output switch, active when the card is selected.
/// `Power` - Card power output switch, active when the card is powered.
/// `Ticks` - Millisecond tick source.
/// `Config` - Config implementation of driver config trait.
pub struct SdMmcSpi<Spi, Cs, Power, Ticks, Config = DefaultSdMmcSpiConfig> {
    spi: RefCell<Spi>,
    cs: RefCell<Cs>,
    power: RefCell<Power>,
    ticks: Ticks,
    status: DriveStatus,
    card: Option<CardClass>,
    geometry: Option<Geometry>,
    config: PhantomData<Config>,
}

/// Builds a command frame: start bits and index, big-endian argument, CRC and end bit.
///
/// Only CMD0 and CMD8 are checked by a card in SPI mode, the rest get a dummy CRC.
fn command_frame(cmd: u8, arg: u32) -> [u8; 6] {
    let arg = arg.to_be_bytes();
    let mut frame = [cmd, arg[0], arg[1], arg[2], arg[3], 0x01];

    if cmd == commands::CMD0 || cmd == commands::CMD8 {
        frame[5] = (crc7(&frame[..5]) << 1) | 0x01;
    }

    frame
}

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
    /// Init sequence value.
    const INIT_SET_VALUE: u8 = 0xFF;
    /// Init sequence size, 80 clocks.
    const INIT_SET_SIZE: usize = 10;
    /// Receive transfer token.
    const RECEIVE_TRANSFER_TOKEN: u8 = 0xFF;

    /// Creates a new [`SdMmcSpi<Spi, Cs, Power, Ticks, Config>`].
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    /// `power` - card power output switch.
    /// `ticks` - millisecond tick source.
    pub fn new(spi: Spi, cs: Cs, power: Power, ticks: Ticks) -> Self {
        SdMmcSpi {
            spi: RefCell::new(spi),
            cs: RefCell::new(cs),
            power: RefCell::new(power),
            ticks,
            status: DriveStatus::NOT_INITIALIZED,
            card: None,
            geometry: None,
            config: PhantomData::<Config>,
        }
    }

    /// Powers the card down and gives back the bus, switches and tick source.
    pub fn release(self) -> (Spi, Cs, Power, Ticks) {
        if self.power_off().is_err() {
            warn!("SD power off failed on release");
        }

        (
            self.spi.into_inner(),
            self.cs.into_inner(),
            self.power.into_inner(),
            self.ticks,
        )
    }

    /// Current drive status.
    pub fn status(&self) -> DriveStatus {
        self.status
    }

    /// Class of the initialized card.
    pub fn card_class(&self) -> Option<CardClass> {
        self.card
    }

    /// Geometry decoded on the last successful initialization, `None` when the card
    /// isn't initialized or decoding failed.
    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    /// Count of sectors, 0 when the geometry is unknown.
    pub fn sector_count(&self) -> u32 {
        self.geometry.map_or(0, |geometry| geometry.sector_count)
    }

    /// Sector size in bytes.
    pub fn sector_size(&self) -> usize {
        Geometry::SECTOR_SIZE
    }

    /// Erase block size in sectors, 0 when the geometry is unknown.
    pub fn erase_block_sectors(&self) -> u32 {
        self.geometry
            .map_or(0, |geometry| geometry.erase_block_sectors)
    }

    /// Send one byte and receive one byte.
    fn transfer(&self, data: u8) -> Result<u8, ErrorFor<Spi, Cs>> {
        self.spi
            .borrow_mut()
            .transfer(&mut [data])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    fn receive(&self) -> Result<u8, ErrorFor<Spi, Cs>> {
        self.transfer(Self::RECEIVE_TRANSFER_TOKEN)
    }

    /// Send a byte to the SD card.
    fn send(&self, data: u8) -> Result<(), ErrorFor<Spi, Cs>> {
        self.transfer(data).map(|_| ())
    }

    /// Receive a slice from the SD card in one burst.
    fn receive_slice(&self, data: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        data.fill(Self::RECEIVE_TRANSFER_TOKEN);

        self.spi
            .borrow_mut()
            .transfer(data)
            .map(|_| ())
            .map_err(Error::Transport)
    }

    /// Send a slice to the SD card in one burst.
    fn send_slice(&self, data: &[u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        self.spi.borrow_mut().write(data).map_err(Error::Transport)
    }

    /// Skip bytes.
    fn skip_bytes(&self, count: usize) -> Result<(), ErrorFor<Spi, Cs>> {
        for _ in 0..count {
            self.receive()?;
        }

        Ok(())
    }

    /// Wait until the card releases the bus, `false` on timeout.
    fn wait_ready(&self, timeout_ms: u32) -> Result<bool, ErrorFor<Spi, Cs>> {
        poll_until(&self.ticks, timeout_ms, || {
            self.receive()
                .map(|token| (token == tokens::AVAILABLE).then_some(()))
        })
        .map(|ready| ready.is_some())
    }

    /// Activate chip select and wait for the card, `false` (and deselected) on timeout.
    fn select(&self) -> Result<bool, ErrorFor<Spi, Cs>> {
        self.cs.borrow_mut().on().map_err(Error::SelectError)?;
        self.skip_bytes(1)?;

        if self.wait_ready(Config::CARD_READY_TIMEOUT_MS)? {
            return Ok(true);
        }

        self.deselect()?;
        Ok(false)
    }

    /// Deactivate chip select, one more byte lets the card release its output.
    fn deselect(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        self.cs.borrow_mut().off().map_err(Error::SelectError)?;
        self.skip_bytes(1)
    }

    /// Runs `f` and leaves the card deselected whatever it returned.
    fn deselect_after<T, F>(&self, f: F) -> Result<T, ErrorFor<Spi, Cs>>
    where
        F: FnOnce(&Self) -> Result<T, ErrorFor<Spi, Cs>>,
    {
        let result = f(self);
        self.deselect()?;

        result
    }

    /// Send a single command, R1 as received.
    fn send_command_impl(&self, cmd: u8, arg: u32) -> Result<R1Response, ErrorFor<Spi, Cs>> {
        self.deselect()?;

        if !self.select()? {
            warn!("SD busy, CMD{} not sent", commands::index(cmd));
            return Ok(R1Response::NO_RESPONSE);
        }

        self.send_slice(&command_frame(cmd, arg))?;

        if cmd == commands::CMD12 {
            self.skip_bytes(1)?;
        }

        let mut r1 = R1Response::NO_RESPONSE;

        for _ in 0..Config::READ_R1_ATTEMPTS {
            r1 = R1Response(self.receive()?);

            if r1.is_valid() {
                break;
            }
        }

        trace!("CMD{}({}) -> {:02X}", commands::index(cmd), arg, r1.0);

        Ok(r1)
    }

    /// Send command, prefixed by CMD55 for application commands.
    fn send_command(&self, cmd: u8, arg: u32) -> Result<R1Response, ErrorFor<Spi, Cs>> {
        if (cmd & commands::ACMD_FLAG) != 0 {
            let r1 = self.send_command_impl(commands::CMD55, 0x0000_0000)?;

            if !r1.is_accepted() {
                return Ok(r1);
            }
        }

        self.send_command_impl(cmd & !commands::ACMD_FLAG, arg)
    }

    /// Send command and require the ready state.
    fn command_ok(&self, cmd: u8, arg: u32) -> Result<(), ErrorFor<Spi, Cs>> {
        let r1 = self.send_command(cmd, arg)?;

        if r1 == R1Response::READY_STATE {
            Ok(())
        } else {
            debug!("CMD{} rejected: {:02X}", commands::index(cmd), r1.0);
            Err(Error::ErrorCommand(commands::index(cmd)))
        }
    }

    /// Receive a data block into `data`.
    fn receive_block(&self, data: &mut [u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        let token = poll_until(&self.ticks, Config::DATA_TOKEN_TIMEOUT_MS, || {
            self.receive()
                .map(|token| (token != tokens::AVAILABLE).then_some(token))
        })?;

        match token {
            Some(tokens::DATA_START_BLOCK) => {}
            Some(token) => {
                warn!("SD unexpected data token: {:02X}", token);
                return Err(Error::ReadError);
            }
            None => return Err(Error::TimeoutReadBuffer),
        }

        self.receive_slice(data)?;

        let card_crc = u16::from_be_bytes([self.receive()?, self.receive()?]);

        if Config::VERIFY_READ_CRC {
            let host_crc = crc16(data);

            if card_crc != host_crc {
                return Err(Error::CrcError(card_crc, host_crc));
            }
        }

        Ok(())
    }

    /// Transmit a data block, started by `token`.
    fn transmit_block(&self, token: u8, data: &[u8]) -> Result<(), ErrorFor<Spi, Cs>> {
        if !self.wait_ready(Config::CARD_READY_TIMEOUT_MS)? {
            return Err(Error::TimeoutWaitAvailable);
        }

        self.send(token)?;
        self.send_slice(data)?;
        self.send_slice(&[0xFF, 0xFF])?;

        let response = self.receive()?;

        if (response & tokens::DATA_RES_MASK) != tokens::DATA_RES_ACCEPTED {
            warn!("SD data block rejected: {:02X}", response);
            Err(Error::WriteError)
        } else {
            Ok(())
        }
    }

    /// Transmit the stop token ending a multiple block write.
    fn transmit_stop(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        if !self.wait_ready(Config::CARD_READY_TIMEOUT_MS)? {
            return Err(Error::TimeoutWaitAvailable);
        }

        self.send(tokens::STOP_TRAN)
    }

    /// Read a 16-byte register sent as a data block.
    fn read_register(&self, cmd: u8, data: &mut [u8; 16]) -> Result<(), ErrorFor<Spi, Cs>> {
        self.command_ok(cmd, 0x0000_0000)?;
        self.receive_block(data)
    }

    /// Read CSD.
    fn read_csd(&self) -> Result<Csd, ErrorFor<Spi, Cs>> {
        let mut csd_data: CsdData = Default::default();

        self.read_register(commands::CMD9, &mut csd_data)?;

        Ok(Csd::from(csd_data))
    }

    /// Read OCR.
    fn read_ocr(&self, ocr: &mut OcrData) -> Result<(), ErrorFor<Spi, Cs>> {
        self.command_ok(commands::CMD58, 0x0000_0000)?;
        self.receive_slice(ocr)
    }

    /// Read SD status.
    fn read_sd_status(&self, status: &mut SdStatusData) -> Result<(), ErrorFor<Spi, Cs>> {
        self.command_ok(commands::ACMD13, 0x0000_0000)?;
        // second byte of the R2 response
        self.skip_bytes(1)?;
        self.receive_block(status)
    }

    /// Read erase block size in sectors.
    fn read_erase_block_sectors(
        &self,
        card: CardClass,
        csd: &Csd,
    ) -> Result<u32, ErrorFor<Spi, Cs>> {
        match card {
            CardClass::SdV2(_) => {
                let mut status: SdStatusData = [0; 64];
                self.read_sd_status(&mut status)?;
                Ok(sd_status_erase_block_sectors(&status))
            }
            CardClass::SdV1 => Ok(csd.sd_erase_block_sectors()),
            CardClass::Mmc => Ok(csd.mmc_erase_block_sectors()),
        }
    }

    /// Power cycle the card.
    fn power_on(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        debug!("SD power cycle");

        self.power.borrow_mut().off().map_err(Error::PowerError)?;
        self.cs.borrow_mut().on().map_err(Error::SelectError)?;
        pause(&self.ticks, Config::POWER_DOWN_MS);

        self.power.borrow_mut().on().map_err(Error::PowerError)?;
        self.cs.borrow_mut().off().map_err(Error::SelectError)?;

        if !self.wait_ready(Config::CARD_READY_TIMEOUT_MS)? {
            warn!("SD bus not released after power on");
        }

        Ok(())
    }

    /// Power the card down, letting it finish pending work first.
    fn power_off(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        debug!("SD power off");

        self.power.borrow_mut().off().map_err(Error::PowerError)?;
        self.select()?;
        self.deselect()
    }

    /// Poll `cmd` until the card leaves the idle state, `false` when `deadline` passes.
    fn wait_initialized(
        &self,
        deadline: &Deadline,
        cmd: u8,
        arg: u32,
    ) -> Result<bool, ErrorFor<Spi, Cs>> {
        deadline
            .poll(&self.ticks, || {
                self.send_command(cmd, arg)
                    .map(|r1| (r1 == R1Response::READY_STATE).then_some(()))
            })
            .map(|ready| ready.is_some())
    }

    /// Enter SD to SPI mode.
    fn enter_spi_mode(&self) -> Result<(), ErrorFor<Spi, Cs>> {
        info!("Entering SPI mode");

        match self.send_command(commands::CMD0, 0x0000_0000)? {
            R1Response::IN_IDLE_STATE => Ok(()),
            R1Response::NO_RESPONSE => {
                warn!("No response from CMD0");
                Err(Error::CardNotFound)
            }
            r1 => {
                warn!("Wrong response from CMD0: {:02X}", r1.0);
                Err(Error::ErrorCommand(commands::index(commands::CMD0)))
            }
        }
    }

    /// SDv2 card: wait for the end of initialization with host capacity support, then
    /// read the addressing mode from the OCR.
    fn init_sd_v2(&self, deadline: &Deadline) -> Result<CardClass, ErrorFor<Spi, Cs>> {
        let mut r7: R7Payload = [0; 4];
        self.receive_slice(&mut r7)?;

        if r7[2..] != [0x01, 0xAA] {
            warn!("SD interface condition echo: {:02X} {:02X}", r7[2], r7[3]);
            return Err(Error::VoltageMismatch);
        }

        info!("Sending host capacity support information and activates");

        if !self.wait_initialized(deadline, commands::ACMD41, args::ACMD41_HCS)? {
            return Err(Error::TimeoutCommand(commands::index(commands::ACMD41)));
        }

        let mut ocr: OcrData = [0; 4];
        self.read_ocr(&mut ocr)?;

        if (ocr[0] & tokens::OCR_CCS) != 0 {
            Ok(CardClass::SdV2(Addressing::Block))
        } else {
            Ok(CardClass::SdV2(Addressing::Byte))
        }
    }

    /// SDv1 or MMC card, told apart by whether ACMD41 is understood.
    fn init_sd_v1_or_mmc(&self, deadline: &Deadline) -> Result<CardClass, ErrorFor<Spi, Cs>> {
        let (card, cmd) = if self.send_command(commands::ACMD41, 0x0000_0000)?.is_accepted() {
            (CardClass::SdV1, commands::ACMD41)
        } else {
            (CardClass::Mmc, commands::CMD1)
        };

        info!("Waiting for {} initialization", card.name());

        if !self.wait_initialized(deadline, cmd, 0x0000_0000)? {
            return Err(Error::TimeoutCommand(commands::index(cmd)));
        }

        self.command_ok(commands::CMD16, BLOCK_SIZE_U32)?;

        Ok(card)
    }

    /// Check SD type.
    fn check_type(&self) -> Result<CardClass, ErrorFor<Spi, Cs>> {
        self.enter_spi_mode()?;

        info!("Verifing SD Memory Card interface operating condition");

        let deadline = Deadline::start(&self.ticks, Config::INIT_TIMEOUT_MS);

        if self.send_command(commands::CMD8, args::CMD8_CHECK_PATTERN)?
            == R1Response::IN_IDLE_STATE
        {
            self.init_sd_v2(&deadline)
        } else {
            self.init_sd_v1_or_mmc(&deadline)
        }
    }

    /// Power up, clock the card into SPI mode and classify it.
    fn init(&self) -> Result<CardClass, ErrorFor<Spi, Cs>> {
        self.power_on()?;
        self.spi.borrow_mut().set_spi_speed(SpiSpeed::Slow);

        for _ in 0..Self::INIT_SET_SIZE {
            self.send(Self::INIT_SET_VALUE)?;
        }

        let card = self.deselect_after(|s| s.check_type());
        self.spi.borrow_mut().set_spi_speed(SpiSpeed::Fast);

        card
    }

    /// Decode geometry and write protection of the card.
    fn load_geometry(&mut self, card: CardClass) {
        let result = self.deselect_after(|s| {
            let csd = s.read_csd()?;
            let erase_block_sectors = s.read_erase_block_sectors(card, &csd)?;

            Ok((csd, erase_block_sectors))
        });

        match result {
            Ok((csd, erase_block_sectors)) => {
                let geometry = Geometry {
                    sector_count: csd.sector_count(),
                    erase_block_sectors,
                };

                info!(
                    "SD geometry: {} sectors, erase block {} sectors, {} bytes",
                    geometry.sector_count,
                    geometry.erase_block_sectors,
                    geometry.capacity().bytes()
                );

                if csd.write_protected() {
                    warn!("SD is write protected");
                    self.status.insert(DriveStatus::WRITE_PROTECTED);
                }

                self.geometry = Some(geometry);
            }
            Err(_) => {
                error!("Failed to read SD geometry, card stays initialized");
                self.geometry = None;
            }
        }
    }

    /// Initialize the card, always running the whole sequence again.
    ///
    /// Returns the new status, without [`DriveStatus::NOT_INITIALIZED`] on success.
    pub fn initialize(&mut self) -> DriveStatus {
        info!("SD initialize started");

        self.card = None;
        self.geometry = None;
        self.status = DriveStatus::NOT_INITIALIZED;

        match self.init() {
            Ok(card) => {
                info!("SD successfully initialized, version: {}", card.name());

                self.card = Some(card);
                self.status.remove(DriveStatus::NOT_INITIALIZED);
                self.load_geometry(card);
            }
            Err(err) => {
                error!("Failed to initialize SD");

                if self.power_off().is_err() {
                    warn!("SD power off failed");
                }

                if matches!(err, Error::CardNotFound) {
                    self.status.insert(DriveStatus::NO_MEDIA);
                }
            }
        }

        self.status
    }
}
