//! NOR flash device contract and the SPI driver implementing it.
//!
//! The storage backend is an 8 MiB, 24-bit byte-addressable NOR device
//! (Cypress S25FL064-class): 256-byte page programs, 4 KiB subsector and
//! 64 KiB sector erases, full-chip erase. Programming can only pull bits
//! from 1 to 0; an erase sets the whole extent back to 1.

use embedded_hal::spi::{Operation, SpiDevice};

/// Size of one programmable page in bytes.
pub const PAGE_SIZE: usize = 256;
/// Size of one erasable 4 KiB subsector in bytes.
pub const SUBSECTOR_SIZE: usize = PAGE_SIZE * 16;
/// Size of one erasable 64 KiB sector in bytes.
pub const SECTOR_SIZE: usize = PAGE_SIZE * 256;
/// Total device capacity in bytes.
pub const DEVICE_SIZE: u32 = 0x0080_0000;
/// Total number of pages on the device.
pub const DEVICE_PAGES: u32 = DEVICE_SIZE / PAGE_SIZE as u32;

/// Value every byte of an erased extent reads as.
pub const ERASED_BYTE: u8 = 0xFF;

/// Returns true when `bytes` reads as erased flash.
#[inline]
pub fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == ERASED_BYTE)
}

/// Failure kinds of the flash abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// A previous program/erase has not completed yet.
    Busy,
    /// Address or length outside the device, or a program crossing a page.
    InvalidRange,
    /// The device reported a program or erase failure, or the bus failed.
    Device,
}

/// Byte-addressable NOR store with page programs and block erases.
///
/// Implementations serialize their own operations: every entry point waits
/// for a previous program/erase to finish before issuing the next command,
/// so `Busy` never escapes to callers of this trait.
pub trait FlashDevice {
    /// Reads `buf.len()` bytes starting at `address`. No alignment
    /// constraint; reads may span pages and sectors.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Programs up to one page at `address`. The caller guarantees the
    /// target bytes were erased since they were last programmed; the data
    /// must not wrap past the end of the page.
    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erases the 4 KiB subsector containing `address`.
    fn erase_subsector(&mut self, address: u32) -> Result<(), FlashError>;

    /// Erases the 64 KiB sector containing `address`.
    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError>;

    /// Erases the entire device.
    fn erase_device(&mut self) -> Result<(), FlashError>;

    /// Returns the address of the lowest page that reads entirely erased,
    /// or `DEVICE_SIZE` when every page holds data.
    fn scan_first_empty(&mut self) -> Result<u32, FlashError> {
        let mut page = [0u8; PAGE_SIZE];
        for index in 0..DEVICE_PAGES {
            let address = index * PAGE_SIZE as u32;
            self.read(address, &mut page)?;
            if is_erased(&page) {
                return Ok(address);
            }
        }
        Ok(DEVICE_SIZE)
    }
}

/* Command set shared by 25-series SPI NOR parts. */
#[repr(u8)]
#[allow(dead_code)]
enum Opcode {
    ReadJedecId = 0x9F,
    WriteEnable = 0x06,
    ReadStatus = 0x05,
    ClearStatus = 0x30,
    Read = 0x03,
    PageProgram = 0x02,
    SubsectorErase = 0x20,
    SectorErase = 0xD8,
    ChipErase = 0xC7,
}

/* Expected JEDEC identification bytes. */
const MANUFACTURER_ID: u8 = 0x01;
const DEVICE_ID_MSB: u8 = 0x02;
const DEVICE_ID_LSB: u8 = 0x16;

/// Status register of the device.
#[derive(Debug, Clone, Copy)]
struct Status(u8);

impl Status {
    /// Write (program or erase) in progress.
    fn busy(self) -> bool {
        self.0 & 0x01 != 0
    }

    /// Program error latched by the device.
    fn program_error(self) -> bool {
        self.0 >> 6 & 0x01 != 0
    }

    /// Erase error latched by the device.
    fn erase_error(self) -> bool {
        self.0 >> 5 & 0x01 != 0
    }
}

#[inline]
fn address_bytes(address: u32) -> [u8; 3] {
    [(address >> 16) as u8, (address >> 8) as u8, address as u8]
}

/// SPI NOR flash driver over an [`embedded_hal::spi::SpiDevice`].
///
/// The device serializes programs and erases internally; the driver polls
/// the write-in-progress bit before every command, so callers never see
/// [`FlashError::Busy`] from this implementation.
pub struct SpiNorFlash<SPI> {
    spi: SPI,
}

impl<SPI: SpiDevice<u8>> SpiNorFlash<SPI> {
    /// Probes the JEDEC id and returns the driver.
    ///
    /// An unexpected id is logged, not fatal: the command set below is
    /// common to the whole part family.
    pub fn new(spi: SPI) -> Result<Self, FlashError> {
        let mut flash = Self { spi };
        let id = flash.read_jedec_id()?;
        if id != [MANUFACTURER_ID, DEVICE_ID_MSB, DEVICE_ID_LSB] {
            log::warn!(
                "Unexpected flash id {:02x} {:02x} {:02x}, continuing anyway",
                id[0],
                id[1],
                id[2]
            );
        } else {
            log::info!("NOR flash identified: {:02x} {:02x} {:02x}", id[0], id[1], id[2]);
        }
        Ok(flash)
    }

    /// Releases the underlying SPI device.
    pub fn release(self) -> SPI {
        self.spi
    }

    fn read_jedec_id(&mut self) -> Result<[u8; 3], FlashError> {
        let mut id = [0u8; 3];
        self.spi
            .transaction(&mut [Operation::Write(&[Opcode::ReadJedecId as u8]), Operation::Read(&mut id)])
            .map_err(|_| FlashError::Device)?;
        Ok(id)
    }

    fn read_status(&mut self) -> Result<Status, FlashError> {
        let mut status = [0u8; 1];
        self.spi
            .transaction(&mut [Operation::Write(&[Opcode::ReadStatus as u8]), Operation::Read(&mut status)])
            .map_err(|_| FlashError::Device)?;
        Ok(Status(status[0]))
    }

    // The hardware bounds every program/erase, so the poll carries no
    // deadline of its own.
    fn wait_idle(&mut self) -> Result<Status, FlashError> {
        loop {
            let status = self.read_status()?;
            if !status.busy() {
                return Ok(status);
            }
        }
    }

    fn write_enable(&mut self) -> Result<(), FlashError> {
        self.spi
            .transaction(&mut [Operation::Write(&[Opcode::WriteEnable as u8])])
            .map_err(|_| FlashError::Device)
    }

    fn command_with_address(&mut self, opcode: Opcode, address: u32) -> Result<(), FlashError> {
        let addr = address_bytes(address);
        self.spi
            .transaction(&mut [Operation::Write(&[opcode as u8]), Operation::Write(&addr)])
            .map_err(|_| FlashError::Device)
    }

    fn erase_common(&mut self, opcode: Opcode, address: u32) -> Result<(), FlashError> {
        if address >= DEVICE_SIZE {
            return Err(FlashError::InvalidRange);
        }
        self.wait_idle()?;
        self.write_enable()?;
        self.command_with_address(opcode, address)?;
        if self.wait_idle()?.erase_error() {
            log::error!("Erase failed at {:#08x}", address);
            return Err(FlashError::Device);
        }
        Ok(())
    }
}

impl<SPI: SpiDevice<u8>> FlashDevice for SpiNorFlash<SPI> {
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if u64::from(address) + buf.len() as u64 > u64::from(DEVICE_SIZE) {
            return Err(FlashError::InvalidRange);
        }
        self.wait_idle()?;
        let addr = address_bytes(address);
        self.spi
            .transaction(&mut [
                Operation::Write(&[Opcode::Read as u8]),
                Operation::Write(&addr),
                Operation::Read(buf),
            ])
            .map_err(|_| FlashError::Device)
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        if data.is_empty() || data.len() > PAGE_SIZE {
            return Err(FlashError::InvalidRange);
        }
        // A program that runs past the page boundary silently wraps inside
        // the page on these parts; reject it instead.
        if address as usize % PAGE_SIZE + data.len() > PAGE_SIZE || address >= DEVICE_SIZE {
            return Err(FlashError::InvalidRange);
        }
        self.wait_idle()?;
        self.write_enable()?;
        let addr = address_bytes(address);
        self.spi
            .transaction(&mut [
                Operation::Write(&[Opcode::PageProgram as u8]),
                Operation::Write(&addr),
                Operation::Write(data),
            ])
            .map_err(|_| FlashError::Device)?;
        if self.wait_idle()?.program_error() {
            log::error!("Page program failed at {:#08x}", address);
            return Err(FlashError::Device);
        }
        Ok(())
    }

    fn erase_subsector(&mut self, address: u32) -> Result<(), FlashError> {
        self.erase_common(Opcode::SubsectorErase, address)
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        self.erase_common(Opcode::SectorErase, address)
    }

    fn erase_device(&mut self) -> Result<(), FlashError> {
        self.wait_idle()?;
        self.write_enable()?;
        self.spi
            .transaction(&mut [Operation::Write(&[Opcode::ChipErase as u8])])
            .map_err(|_| FlashError::Device)?;
        if self.wait_idle()?.erase_error() {
            log::error!("Chip erase failed");
            return Err(FlashError::Device);
        }
        Ok(())
    }
}
