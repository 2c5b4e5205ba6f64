//! Simulated card answering the SPI-mode protocol byte by byte, for driver tests.

use std::{
    cell::{RefCell, RefMut},
    collections::{BTreeMap, VecDeque},
    rc::Rc,
    vec::Vec,
};

use core::{convert::Infallible, mem};

use embedded_hal::blocking::spi::{Transfer, Write};
use hex_literal::hex;
use switch_hal::OutputSwitch;

use crate::{
    bus::{SetSpiSpeed, SpiSpeed},
    config::{DefaultSdMmcSpiConfig, SdMmcSpiConfig},
    consts::{tokens, BLOCK_SIZE, BLOCK_SIZE_U32},
    crc::{crc16, crc7},
    csd::{CidData, CsdData, SdStatusData},
    timing::TickSource,
    SdMmcSpi,
};

pub const SD1_CSD: CsdData = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");
pub const SD2_CSD: CsdData = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");
pub const MMC_CSD: CsdData = hex!("90 26 00 32 5F 59 83 C8 AD DB BC 7F D2 40 40 A5");
pub const CID: CidData = hex!("03 53 44 53 44 31 36 47 80 0D 2E 4A 1B 01 4A 65");

// R1 bits
const IDLE: u8 = 0x01;
const ILLEGAL_COMMAND: u8 = 0x04;
const CRC_ERROR: u8 = 0x08;
const ADDRESS_ERROR: u8 = 0x20;
const PARAMETER_ERROR: u8 = 0x40;

/// Sent by the card right after the CMD12 frame, reads as a valid R1.
pub const STUFF_BYTE: u8 = 0x7F;
/// Data response, accepted. Only the low 5 bits are defined.
const DATA_ACCEPTED: u8 = 0xE5;
/// Data response, rejected with a CRC error.
const DATA_REJECTED: u8 = 0x0B;
/// Data error token, out of range.
const DATA_ERROR_TOKEN: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Mmc,
    SdV1,
    SdV2 { block_addressed: bool },
}

enum Mode {
    Command,
    ReadMultiple { sector: u32 },
    WriteSingle { sector: u32 },
    WriteMultiple { sector: u32 },
    Receive { sector: u32, multiple: bool, data: Vec<u8> },
}

pub struct Card {
    kind: Option<Kind>,
    pub csd: CsdData,
    pub cid: CidData,
    pub sd_status: SdStatusData,
    /// ACMD41/CMD1 polls answered idle before the card is ready.
    pub init_polls: u32,
    /// Index of the written block to reject, counted from the first block ever written.
    pub reject_block: Option<usize>,
    /// Sector answered with an error token inside a multiple block read.
    pub read_error_sector: Option<u32>,
    pub corrupt_crc: bool,
    /// Refuse CSD and SD status reads.
    pub reject_registers: bool,
    /// Hold MISO low (busy) whenever nothing else is queued. Cleared by a power cycle.
    pub busy: bool,
    /// Turn busy after answering this command index.
    pub busy_after_command: Option<u8>,
    /// Turn busy after storing the written block with this index.
    pub busy_after_block: Option<usize>,
    /// Answer CMD17 without ever sending the data block.
    pub swallow_data_token: bool,
    /// Echo a wrong check pattern to CMD8.
    pub bad_echo: bool,
    /// CMD0 answer replacing the idle state.
    pub cmd0_response: Option<u8>,
    /// MISO bytes clocked after the last CMD12 frame, until deselect.
    pub after_stop: Vec<u8>,
    pub sectors: BTreeMap<u32, [u8; BLOCK_SIZE]>,
    /// Received commands, application commands flagged with `0x80`.
    pub commands: Vec<(u8, u32)>,
    pub stop_tokens: usize,
    pub speed: Option<SpiSpeed>,
    pub millis: u32,
    pub powered: bool,
    selected: bool,
    recording_stop: bool,
    idle: bool,
    app_command: bool,
    frame: Vec<u8>,
    out: VecDeque<u8>,
    mode: Mode,
    blocks_written: usize,
    erase_start: u32,
    erase_end: u32,
}

impl Card {
    fn new(kind: Option<Kind>) -> Self {
        let mut sd_status = [0; 64];
        sd_status[10] = 0x90;

        let mut card = Card {
            kind: None,
            csd: [0; 16],
            cid: CID,
            sd_status,
            init_polls: 3,
            reject_block: None,
            read_error_sector: None,
            corrupt_crc: false,
            reject_registers: false,
            busy: false,
            busy_after_command: None,
            busy_after_block: None,
            swallow_data_token: false,
            bad_echo: false,
            cmd0_response: None,
            after_stop: Vec::new(),
            sectors: BTreeMap::new(),
            commands: Vec::new(),
            stop_tokens: 0,
            speed: None,
            millis: 0,
            powered: false,
            selected: false,
            recording_stop: false,
            idle: true,
            app_command: false,
            frame: Vec::new(),
            out: VecDeque::new(),
            mode: Mode::Command,
            blocks_written: 0,
            erase_start: 0,
            erase_end: 0,
        };

        if let Some(kind) = kind {
            card.insert(kind);
        }

        card
    }

    /// Put a card of `kind` in the slot.
    pub fn insert(&mut self, kind: Kind) {
        self.kind = Some(kind);
        self.csd = match kind {
            Kind::Mmc => MMC_CSD,
            Kind::SdV1 => SD1_CSD,
            Kind::SdV2 { .. } => SD2_CSD,
        };
    }

    pub fn selected(&self) -> bool {
        self.selected
    }

    pub fn command_indexes(&self) -> Vec<u8> {
        self.commands.iter().map(|&(cmd, _)| cmd).collect()
    }

    pub fn arguments_of(&self, cmd: u8) -> Vec<u32> {
        self.commands
            .iter()
            .filter(|&&(sent, _)| sent == cmd)
            .map(|&(_, arg)| arg)
            .collect()
    }

    pub fn sector(&self, sector: u32) -> [u8; BLOCK_SIZE] {
        self.sectors
            .get(&sector)
            .copied()
            .unwrap_or([0; BLOCK_SIZE])
    }

    fn reset(&mut self) {
        self.idle = true;
        self.busy = false;
        self.app_command = false;
        self.frame.clear();
        self.out.clear();
        self.mode = Mode::Command;
    }

    fn set_powered(&mut self, powered: bool) {
        if !powered {
            self.reset();
        }

        self.powered = powered;
    }

    fn set_selected(&mut self, selected: bool) {
        if !selected {
            self.frame.clear();
            self.out.clear();
            self.recording_stop = false;
        }

        self.selected = selected;
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.powered || !self.selected || self.kind.is_none() {
            return 0xFF;
        }

        let miso = match self.out.pop_front() {
            Some(miso) => miso,
            None if self.busy => 0x00,
            None => 0xFF,
        };

        if self.recording_stop {
            self.after_stop.push(miso);
        }

        self.receive(mosi);

        if self.out.is_empty() {
            if let Mode::ReadMultiple { sector } = self.mode {
                self.mode = Mode::ReadMultiple {
                    sector: sector.wrapping_add(1),
                };
                self.queue_sector(sector);
            }
        }

        miso
    }

    fn receive(&mut self, mosi: u8) {
        match mem::replace(&mut self.mode, Mode::Command) {
            Mode::WriteSingle { sector } => {
                self.mode = if mosi == tokens::DATA_START_BLOCK {
                    Mode::Receive {
                        sector,
                        multiple: false,
                        data: Vec::new(),
                    }
                } else {
                    Mode::WriteSingle { sector }
                };
            }
            Mode::WriteMultiple { sector } => match mosi {
                tokens::WRITE_MULTIPLE => {
                    self.mode = Mode::Receive {
                        sector,
                        multiple: true,
                        data: Vec::new(),
                    }
                }
                tokens::STOP_TRAN => {
                    self.stop_tokens += 1;
                    self.out.extend([0xFF, 0x00, 0x00]);
                }
                _ => self.mode = Mode::WriteMultiple { sector },
            },
            Mode::Receive {
                sector,
                multiple,
                mut data,
            } => {
                data.push(mosi);

                if data.len() < BLOCK_SIZE + 2 {
                    self.mode = Mode::Receive {
                        sector,
                        multiple,
                        data,
                    };
                } else {
                    self.store_block(sector, multiple, &data[..BLOCK_SIZE]);
                }
            }
            mode => {
                self.mode = mode;
                self.receive_command_byte(mosi);
            }
        }
    }

    fn store_block(&mut self, sector: u32, multiple: bool, data: &[u8]) {
        let index = self.blocks_written;
        self.blocks_written += 1;

        let next = if self.reject_block == Some(index) {
            self.out.push_back(DATA_REJECTED);
            sector
        } else {
            let mut block = [0; BLOCK_SIZE];
            block.copy_from_slice(data);
            self.sectors.insert(sector, block);
            self.out.extend([DATA_ACCEPTED, 0x00, 0x00]);
            sector.wrapping_add(1)
        };

        if self.busy_after_block == Some(index) {
            self.busy = true;
        }

        if multiple {
            self.mode = Mode::WriteMultiple { sector: next };
        }
    }

    fn receive_command_byte(&mut self, mosi: u8) {
        if self.frame.is_empty() && (mosi & 0xC0) != 0x40 {
            return;
        }

        self.frame.push(mosi);

        if self.frame.len() == 6 {
            let frame = mem::take(&mut self.frame);
            self.execute(&frame);
        }
    }

    fn respond(&mut self, r1: u8, payload: &[u8]) {
        self.out.push_back(0xFF);
        self.out.push_back(r1);
        self.out.extend(payload.iter().copied());
    }

    fn queue_block(&mut self, data: &[u8]) {
        let crc = crc16(data) ^ if self.corrupt_crc { 0xFFFF } else { 0x0000 };

        self.out.extend([0xFF, 0xFF, tokens::DATA_START_BLOCK]);
        self.out.extend(data.iter().copied());
        self.out.extend(crc.to_be_bytes());
    }

    fn queue_sector(&mut self, sector: u32) {
        if self.read_error_sector == Some(sector) {
            self.out.extend([0xFF, DATA_ERROR_TOKEN]);
        } else {
            let data = self.sector(sector);
            self.queue_block(&data);
        }
    }

    /// Sector addressed by a data command argument.
    fn sector_of(&self, arg: u32) -> Option<u32> {
        match self.kind {
            Some(Kind::SdV2 {
                block_addressed: true,
            }) => Some(arg),
            _ => (arg % BLOCK_SIZE_U32 == 0).then(|| arg / BLOCK_SIZE_U32),
        }
    }

    fn poll_initialization(&mut self) {
        if self.init_polls > 0 {
            self.init_polls -= 1;
        } else {
            self.idle = false;
        }
    }

    fn execute(&mut self, frame: &[u8]) {
        let kind = match self.kind {
            Some(kind) => kind,
            None => return,
        };

        let cmd = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let app = mem::take(&mut self.app_command);

        self.commands
            .push((if app { 0x80 | cmd } else { cmd }, arg));

        if (cmd == 0 || cmd == 8) && frame[5] != (crc7(&frame[..5]) << 1) | 0x01 {
            self.respond(IDLE | CRC_ERROR, &[]);
            return;
        }

        if cmd == 12 {
            if let Mode::ReadMultiple { .. } = self.mode {
                self.out.clear();
                self.mode = Mode::Command;
            }

            self.out.push_back(STUFF_BYTE);
            self.respond(0x00, &[]);
            self.after_stop.clear();
            self.recording_stop = true;
            return;
        }

        self.answer(kind, app, cmd, arg);

        if self.busy_after_command == Some(cmd) {
            self.busy = true;
        }
    }

    fn answer(&mut self, kind: Kind, app: bool, cmd: u8, arg: u32) {
        let state = if self.idle { IDLE } else { 0x00 };

        match (app, cmd) {
            (false, 0) => {
                self.reset();
                self.respond(self.cmd0_response.unwrap_or(IDLE), &[]);
            }
            (false, 8) => match kind {
                Kind::SdV2 { .. } => {
                    let pattern = if self.bad_echo { !arg as u8 } else { arg as u8 };
                    self.respond(state, &[0x00, 0x00, ((arg >> 8) & 0x0F) as u8, pattern])
                }
                Kind::Mmc | Kind::SdV1 => self.respond(state | ILLEGAL_COMMAND, &[]),
            },
            (false, 55) => {
                if kind == Kind::Mmc {
                    self.respond(state | ILLEGAL_COMMAND, &[]);
                } else {
                    self.app_command = true;
                    self.respond(state, &[]);
                }
            }
            (true, 41) => {
                self.poll_initialization();
                self.respond(if self.idle { IDLE } else { 0x00 }, &[]);
            }
            (false, 1) if kind == Kind::Mmc => {
                self.poll_initialization();
                self.respond(if self.idle { IDLE } else { 0x00 }, &[]);
            }
            (false, 58) => {
                let powered_up = if self.idle { 0x00 } else { 0x80 };
                let ccs = match kind {
                    Kind::SdV2 {
                        block_addressed: true,
                    } if !self.idle => tokens::OCR_CCS,
                    _ => 0x00,
                };

                self.respond(state, &[powered_up | ccs, 0xFF, 0x80, 0x00]);
            }
            _ if self.idle => self.respond(state | ILLEGAL_COMMAND, &[]),
            (false, 9) | (true, 13) if self.reject_registers => {
                self.respond(PARAMETER_ERROR, &[])
            }
            (false, 9) => {
                self.respond(0x00, &[]);
                let csd = self.csd;
                self.queue_block(&csd);
            }
            (false, 10) => {
                self.respond(0x00, &[]);
                let cid = self.cid;
                self.queue_block(&cid);
            }
            (true, 13) => {
                self.respond(0x00, &[0x00]);
                let status = self.sd_status;
                self.queue_block(&status);
            }
            (false, 16) => {
                let r1 = if arg == BLOCK_SIZE_U32 {
                    0x00
                } else {
                    PARAMETER_ERROR
                };
                self.respond(r1, &[]);
            }
            (false, 17) => match self.sector_of(arg) {
                Some(sector) => {
                    self.respond(0x00, &[]);

                    if !self.swallow_data_token {
                        self.queue_sector(sector);
                    }
                }
                None => self.respond(ADDRESS_ERROR, &[]),
            },
            (false, 18) => match self.sector_of(arg) {
                Some(sector) => {
                    self.respond(0x00, &[]);
                    self.mode = Mode::ReadMultiple { sector };
                }
                None => self.respond(ADDRESS_ERROR, &[]),
            },
            (false, 24) => match self.sector_of(arg) {
                Some(sector) => {
                    self.respond(0x00, &[]);
                    self.mode = Mode::WriteSingle { sector };
                }
                None => self.respond(ADDRESS_ERROR, &[]),
            },
            (false, 25) => match self.sector_of(arg) {
                Some(sector) => {
                    self.respond(0x00, &[]);
                    self.mode = Mode::WriteMultiple { sector };
                }
                None => self.respond(ADDRESS_ERROR, &[]),
            },
            (true, 23) => self.respond(0x00, &[]),
            (false, 32) | (false, 33) => match self.sector_of(arg) {
                Some(sector) => {
                    if cmd == 32 {
                        self.erase_start = sector;
                    } else {
                        self.erase_end = sector;
                    }
                    self.respond(0x00, &[]);
                }
                None => self.respond(ADDRESS_ERROR, &[]),
            },
            (false, 38) => {
                for sector in self.erase_start..=self.erase_end {
                    self.sectors.remove(&sector);
                }
                self.respond(0x00, &[0x00, 0x00]);
            }
            _ => self.respond(state | ILLEGAL_COMMAND, &[]),
        }
    }
}

/// Driver wired to a simulated card.
pub type SimDriver<Config = DefaultSdMmcSpiConfig> =
    SdMmcSpi<SimSpi, SimCs, SimPower, SimTicks, Config>;

pub struct SimSpi(Rc<RefCell<Card>>);
pub struct SimCs(Rc<RefCell<Card>>);
pub struct SimPower(Rc<RefCell<Card>>);
/// Every reading advances the clock by one millisecond.
pub struct SimTicks(Rc<RefCell<Card>>);

impl Transfer<u8> for SimSpi {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let mut card = self.0.borrow_mut();

        for word in words.iter_mut() {
            *word = card.exchange(*word);
        }

        Ok(words)
    }
}

impl Write<u8> for SimSpi {
    type Error = Infallible;

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();

        for &word in words {
            card.exchange(word);
        }

        Ok(())
    }
}

impl SetSpiSpeed for SimSpi {
    fn set_spi_speed(&mut self, speed: SpiSpeed) {
        self.0.borrow_mut().speed = Some(speed);
    }
}

impl OutputSwitch for SimCs {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().set_selected(true);
        Ok(())
    }

    fn off(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().set_selected(false);
        Ok(())
    }
}

impl OutputSwitch for SimPower {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().set_powered(true);
        Ok(())
    }

    fn off(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().set_powered(false);
        Ok(())
    }
}

impl TickSource for SimTicks {
    fn now_millis(&self) -> u32 {
        let mut card = self.0.borrow_mut();
        card.millis = card.millis.wrapping_add(1);
        card.millis
    }
}

/// Card slot shared by the test and the driver.
pub struct Sim(Rc<RefCell<Card>>);

impl Sim {
    pub fn new(kind: Kind) -> Self {
        Sim(Rc::new(RefCell::new(Card::new(Some(kind)))))
    }

    /// Empty slot, nothing drives MISO.
    pub fn absent() -> Self {
        Sim(Rc::new(RefCell::new(Card::new(None))))
    }

    pub fn card(&self) -> RefMut<'_, Card> {
        self.0.borrow_mut()
    }

    pub fn driver(&self) -> SimDriver {
        self.driver_with()
    }

    pub fn driver_with<Config: SdMmcSpiConfig>(&self) -> SimDriver<Config> {
        SdMmcSpi::new(
            SimSpi(self.0.clone()),
            SimCs(self.0.clone()),
            SimPower(self.0.clone()),
            SimTicks(self.0.clone()),
        )
    }
}
