//! Flash-backed memory manager.
//!
//! The 8 MiB device is carved into a fixed system region and seven user
//! data sectors:
//!
//! | region                  | size      | contents                         |
//! |-------------------------|-----------|----------------------------------|
//! | global configuration    | 4 KiB     | append log of [`GlobalConfig`]   |
//! | layout metadata         | 2 MiB     | append log of [`LayoutMetadata`] |
//! | user data               | remainder | seven record streams             |
//!
//! Records are staged into per-sector RAM page buffers; a full page swaps
//! into the read half of the double buffer and a copy is queued for the
//! writer, which drains pages to flash in FIFO order. The write side never
//! blocks: a full queue or a full sector drops the page and tells the
//! caller. A reboot restores the configuration and layout from the last
//! valid record of each system region, then re-locates the true end of
//! every sector by binary search, so recording resumes where it stopped.

use heapless::Deque;

use crate::cfg::{GlobalConfig, MemoryConfig, DATA_INTEGRITY_SIGNATURE};
use crate::data::{
    ms_to_ticks, BaroRecord, ContinuityRecord, DataContainer, FlightEventRecord, InertialRecord,
    InvalidRecord, Record, Ticks,
};
use crate::flash::{is_erased, FlashDevice, FlashError, DEVICE_SIZE, ERASED_BYTE, PAGE_SIZE, SUBSECTOR_SIZE};

/// Number of user data sectors.
pub const USER_SECTOR_COUNT: usize = 7;

/// Depth of the page queue between producers and the writer.
pub const PAGE_QUEUE_DEPTH: usize = 10;

/// Metadata flush threshold of the data-based autosave mode, in records.
pub const METADATA_AUTOSAVE_DATA_INTERVAL: u32 = 200;
/// Metadata flush period of the time-based autosave mode.
pub const METADATA_AUTOSAVE_TIME_INTERVAL: Ticks = ms_to_ticks(250);

const GLOBAL_CONFIG_BASE: u32 = 0;
const GLOBAL_CONFIG_PAGES: u32 = (SUBSECTOR_SIZE / PAGE_SIZE) as u32;
const METADATA_BASE: u32 = GLOBAL_CONFIG_BASE + SUBSECTOR_SIZE as u32;
const METADATA_SIZE: u32 = 0x0020_0000;
const METADATA_PAGES: u32 = METADATA_SIZE / PAGE_SIZE as u32;
const USER_DATA_BASE: u32 = METADATA_BASE + METADATA_SIZE;

/// Memory manager failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// The writer queue is full; the page was dropped.
    QueueFull,
    /// The sector reached its byte budget; nothing further is accepted.
    SectorFull,
    /// A record index past the written extent of the sector.
    OutOfRange,
    /// Caller error: mismatched record type or impossible argument.
    InvalidInput,
    /// The flash device rejected the operation.
    Flash(FlashError),
}

impl From<FlashError> for MemError {
    fn from(err: FlashError) -> Self {
        MemError::Flash(err)
    }
}

impl From<InvalidRecord> for MemError {
    fn from(_: InvalidRecord) -> Self {
        MemError::InvalidInput
    }
}

/// When the in-RAM layout metadata is flushed to its on-flash log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MetadataAutosave {
    /// Every [`METADATA_AUTOSAVE_DATA_INTERVAL`] record updates.
    DataBased,
    /// Every [`METADATA_AUTOSAVE_TIME_INTERVAL`] ticks.
    #[default]
    TimeBased,
}

/// The seven user record streams, in on-flash order.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSector {
    Gyro = 0,
    Accel = 1,
    Mag = 2,
    Pressure = 3,
    Temperature = 4,
    Continuity = 5,
    FlightEvent = 6,
}

impl UserSector {
    pub const ALL: [UserSector; USER_SECTOR_COUNT] = [
        UserSector::Gyro,
        UserSector::Accel,
        UserSector::Mag,
        UserSector::Pressure,
        UserSector::Temperature,
        UserSector::Continuity,
        UserSector::FlightEvent,
    ];

    /// Packed size of one record of this stream.
    pub fn record_size(self) -> usize {
        match self {
            UserSector::Gyro | UserSector::Accel | UserSector::Mag => InertialRecord::SIZE,
            UserSector::Pressure | UserSector::Temperature => BaroRecord::SIZE,
            UserSector::Continuity => ContinuityRecord::SIZE,
            UserSector::FlightEvent => FlightEventRecord::SIZE,
        }
    }

    /// Whole records per page.
    pub fn records_per_page(self) -> usize {
        PAGE_SIZE / self.record_size()
    }

    /// Largest whole-record boundary within a page; bytes past it stay
    /// erased.
    fn page_capacity(self) -> usize {
        self.records_per_page() * self.record_size()
    }
}

/// Location and fill state of one user sector.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SectorInfo {
    pub start_address: u32,
    pub end_address: u32,
    pub size: u32,
    pub bytes_written: u32,
}

impl SectorInfo {
    fn pages(&self) -> u32 {
        self.size / PAGE_SIZE as u32
    }
}

impl Record for SectorInfo {
    const SIZE: usize = 16;

    fn encode(&self, out: &mut [u8]) {
        crate::data::put_u32(out, 0, self.start_address);
        crate::data::put_u32(out, 4, self.end_address);
        crate::data::put_u32(out, 8, self.size);
        crate::data::put_u32(out, 12, self.bytes_written);
    }

    fn decode(bytes: &[u8]) -> Result<Self, InvalidRecord> {
        if bytes.len() < Self::SIZE {
            return Err(InvalidRecord);
        }
        Ok(Self {
            start_address: crate::data::get_u32(bytes, 0),
            end_address: crate::data::get_u32(bytes, 4),
            size: crate::data::get_u32(bytes, 8),
            bytes_written: crate::data::get_u32(bytes, 12),
        })
    }
}

/// The signed memory-layout record kept in the metadata log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LayoutMetadata {
    pub user_sectors: [SectorInfo; USER_SECTOR_COUNT],
}

impl Record for LayoutMetadata {
    const SIZE: usize = DATA_INTEGRITY_SIGNATURE.len() + USER_SECTOR_COUNT * SectorInfo::SIZE;

    fn encode(&self, out: &mut [u8]) {
        out[..12].copy_from_slice(&DATA_INTEGRITY_SIGNATURE);
        for (i, info) in self.user_sectors.iter().enumerate() {
            info.encode(&mut out[12 + i * SectorInfo::SIZE..12 + (i + 1) * SectorInfo::SIZE]);
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, InvalidRecord> {
        if bytes.len() < Self::SIZE || bytes[..12] != DATA_INTEGRITY_SIGNATURE {
            return Err(InvalidRecord);
        }
        let mut user_sectors = [SectorInfo::default(); USER_SECTOR_COUNT];
        for (i, info) in user_sectors.iter_mut().enumerate() {
            *info = SectorInfo::decode(&bytes[12 + i * SectorInfo::SIZE..12 + (i + 1) * SectorInfo::SIZE])?;
        }
        Ok(Self { user_sectors })
    }
}

impl LayoutMetadata {
    /// Carves the user data region according to the configured byte
    /// budgets. Budgets are clamped, in sector order, to the space that is
    /// actually left on the device; a sector past the end gets zero bytes.
    fn carve(memory: &MemoryConfig) -> Self {
        let mut layout = Self::default();
        let mut offset = USER_DATA_BASE;
        for (index, info) in layout.user_sectors.iter_mut().enumerate() {
            let budget = memory.user_sector_sizes[index];
            let remaining = DEVICE_SIZE.saturating_sub(offset);
            let size = budget.min(remaining) & !(PAGE_SIZE as u32 - 1);
            *info = SectorInfo {
                start_address: offset,
                end_address: offset + size,
                size,
                bytes_written: 0,
            };
            offset += size;
        }
        layout
    }
}

/// One page on its way to flash.
enum PageRequest {
    Config { page: [u8; PAGE_SIZE] },
    Metadata { page: [u8; PAGE_SIZE] },
    User { sector: UserSector, address: u32, page: [u8; PAGE_SIZE] },
}

/// Double page buffer of one user sector.
struct SectorBuffer {
    write: [u8; PAGE_SIZE],
    read: [u8; PAGE_SIZE],
    write_len: usize,
    read_len: usize,
}

impl SectorBuffer {
    const fn new() -> Self {
        Self {
            write: [ERASED_BYTE; PAGE_SIZE],
            read: [ERASED_BYTE; PAGE_SIZE],
            write_len: 0,
            read_len: 0,
        }
    }

    /// Moves the full write half into the read half and hands back a copy
    /// for the queue. The new write half starts erased.
    fn swap(&mut self) -> [u8; PAGE_SIZE] {
        if self.read_len != 0 {
            // The writer has not drained the previous page yet; it was
            // copied into the queue, so only the marker is stale.
            log::warn!("Page writer is lagging behind the data producer");
        }
        core::mem::swap(&mut self.write, &mut self.read);
        self.read_len = self.write_len;
        self.write_len = 0;
        self.write = [ERASED_BYTE; PAGE_SIZE];
        self.read
    }

    fn drained(&mut self) {
        self.read = [ERASED_BYTE; PAGE_SIZE];
        self.read_len = 0;
    }
}

/// A region binary/linear page searches run over.
#[derive(Debug, Clone, Copy)]
struct Region {
    base: u32,
    pages: u32,
}

/// Owner of the flash device and of everything staged for it.
pub struct MemoryManager<F> {
    flash: F,
    config: GlobalConfig,
    metadata: LayoutMetadata,
    buffers: [SectorBuffer; USER_SECTOR_COUNT],
    queue: Deque<PageRequest, PAGE_QUEUE_DEPTH>,
    autosave: MetadataAutosave,
    autosave_updates: u32,
    autosave_last_flush: Ticks,
    config_next_page: u32,
    metadata_next_page: u32,
}

impl<F: FlashDevice> MemoryManager<F> {
    /// Brings the manager up from whatever the flash currently holds.
    ///
    /// The last valid configuration and layout records are adopted when
    /// their signature checks out; otherwise defaults are installed and
    /// queued for write. Every user sector is then re-anchored to its true
    /// on-flash end, which may be ahead of what the last metadata flush
    /// captured.
    pub fn new(flash: F) -> Result<Self, MemError> {
        let mut manager = Self {
            flash,
            config: GlobalConfig::default(),
            metadata: LayoutMetadata::default(),
            buffers: [const { SectorBuffer::new() }; USER_SECTOR_COUNT],
            queue: Deque::new(),
            autosave: MetadataAutosave::default(),
            autosave_updates: 0,
            autosave_last_flush: 0,
            config_next_page: 0,
            metadata_next_page: 0,
        };

        let config_region = Region { base: GLOBAL_CONFIG_BASE, pages: GLOBAL_CONFIG_PAGES };
        let metadata_region = Region { base: METADATA_BASE, pages: METADATA_PAGES };

        let config_last = manager.binary_search_region(config_region)?;
        manager.config_next_page = config_last.map_or(0, |last| last + 1);
        match manager.read_region_record::<GlobalConfig>(config_region, config_last)? {
            Some(config) => {
                log::info!("Configuration restored from flash");
                manager.config = config;
            }
            None => {
                log::warn!("No valid configuration on flash, installing defaults");
                manager.config = GlobalConfig::default();
                manager.enqueue_config()?;
            }
        }

        let metadata_last = manager.binary_search_region(metadata_region)?;
        manager.metadata_next_page = metadata_last.map_or(0, |last| last + 1);
        match manager.read_region_record::<LayoutMetadata>(metadata_region, metadata_last)? {
            Some(metadata) => {
                log::info!("Memory layout restored from flash");
                manager.metadata = metadata;
            }
            None => {
                log::warn!("No valid memory layout on flash, carving a fresh one");
                manager.metadata = LayoutMetadata::carve(&manager.config.memory);
                manager.enqueue_metadata()?;
            }
        }

        // The last metadata flush can trail the data streams; walk every
        // sector to find where writing really stopped.
        for sector in UserSector::ALL {
            let info = manager.metadata.user_sectors[sector as usize];
            if info.size == 0 {
                continue;
            }
            let region = Region { base: info.start_address, pages: info.pages() };
            let on_flash = manager
                .binary_search_region(region)?
                .map_or(0, |last| (last + 1) * PAGE_SIZE as u32);
            let info = &mut manager.metadata.user_sectors[sector as usize];
            if on_flash > info.bytes_written {
                log::info!(
                    "{:?} sector is {} bytes ahead of its metadata, re-anchoring",
                    sector,
                    on_flash - info.bytes_written
                );
                info.bytes_written = on_flash;
            }
        }

        Ok(manager)
    }

    /// Consumes the manager and returns the flash device.
    pub fn release(self) -> F {
        self.flash
    }

    /// Currently effective flight-system configuration.
    pub fn system_config(&self) -> &crate::cfg::FlightConfig {
        &self.config.flight
    }

    /// Currently effective memory-manager configuration.
    pub fn memory_config(&self) -> &MemoryConfig {
        &self.config.memory
    }

    /// Sector layout as currently tracked in RAM.
    pub fn sector_info(&self, sector: UserSector) -> SectorInfo {
        self.metadata.user_sectors[sector as usize]
    }

    /// Selects when metadata flushes happen.
    pub fn set_metadata_autosave(&mut self, mode: MetadataAutosave) {
        self.autosave = mode;
    }

    /// Replaces the flight-system configuration and queues it for write.
    pub fn set_system_config(&mut self, flight: crate::cfg::FlightConfig) -> Result<(), MemError> {
        self.config.flight = flight;
        self.enqueue_config()
    }

    /// Replaces the memory configuration and queues it for write.
    ///
    /// While nothing has been recorded yet the user partition is re-carved
    /// with the new budgets; once any sector holds data the layout is
    /// frozen for the rest of the mission.
    pub fn set_memory_config(&mut self, memory: MemoryConfig) -> Result<(), MemError> {
        self.config.memory = memory;
        let untouched = self
            .metadata
            .user_sectors
            .iter()
            .all(|info| info.bytes_written == 0);
        if untouched {
            self.metadata = LayoutMetadata::carve(&self.config.memory);
            self.enqueue_metadata()?;
        } else {
            log::warn!("Sector budgets changed mid-mission, layout stays frozen");
        }
        self.enqueue_config()
    }

    /// Stores the pad reference captured from the first barometric sample
    /// and queues the updated configuration.
    pub fn set_ground_reference(&mut self, pressure_pa: f32, temperature_c: f32) -> Result<(), MemError> {
        self.config.flight.ground_pressure_pa = pressure_pa;
        self.config.flight.ground_temperature_c = temperature_c;
        self.enqueue_config()
    }

    /// Takes every fresh datum out of `container` and stages it for its
    /// sector, then runs the metadata autosave policy.
    ///
    /// Returns the first staging error; later fields are still processed,
    /// a dropped page never stops the stream.
    pub fn user_data_update(&mut self, container: &mut DataContainer, now: Ticks) -> Result<(), MemError> {
        let mut first_error = None;
        let mut scratch = [0u8; PAGE_SIZE];

        macro_rules! stage_field {
            ($field:ident, $sector:expr) => {
                if let Some(record) = container.$field.take() {
                    let size = $sector.record_size();
                    record.encode(&mut scratch[..size]);
                    if let Err(err) = self.stage($sector, &scratch[..size]) {
                        log::warn!("{:?} record dropped: {:?}", $sector, err);
                        first_error.get_or_insert(err);
                    }
                    self.autosave_updates += 1;
                }
            };
        }

        stage_field!(gyro, UserSector::Gyro);
        stage_field!(acc, UserSector::Accel);
        stage_field!(mag, UserSector::Mag);
        stage_field!(pressure, UserSector::Pressure);
        stage_field!(temperature, UserSector::Temperature);
        stage_field!(continuity, UserSector::Continuity);
        stage_field!(event, UserSector::FlightEvent);

        match self.autosave {
            MetadataAutosave::DataBased => {
                if self.autosave_updates >= METADATA_AUTOSAVE_DATA_INTERVAL {
                    self.autosave_updates = 0;
                    if let Err(err) = self.enqueue_metadata() {
                        first_error.get_or_insert(err);
                    }
                }
            }
            MetadataAutosave::TimeBased => {
                if now.wrapping_sub(self.autosave_last_flush) >= METADATA_AUTOSAVE_TIME_INTERVAL {
                    self.autosave_last_flush = now;
                    if let Err(err) = self.enqueue_metadata() {
                        first_error.get_or_insert(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Appends one encoded record to the sector's write buffer. As soon as
    /// the page cannot take another whole record it is swapped out and
    /// queued, so single-record pages (events, continuity) reach flash
    /// without waiting for a successor.
    fn stage(&mut self, sector: UserSector, bytes: &[u8]) -> Result<(), MemError> {
        if bytes.len() != sector.record_size() {
            return Err(MemError::InvalidInput);
        }

        let buffer = &mut self.buffers[sector as usize];
        buffer.write[buffer.write_len..buffer.write_len + bytes.len()].copy_from_slice(bytes);
        buffer.write_len += bytes.len();

        if self.buffers[sector as usize].write_len + sector.record_size() > sector.page_capacity() {
            self.flush_sector(sector)?;
        }
        Ok(())
    }

    /// Swaps the sector's full page out and queues it for the writer,
    /// reserving its flash address up front.
    fn flush_sector(&mut self, sector: UserSector) -> Result<(), MemError> {
        let info = self.metadata.user_sectors[sector as usize];
        if info.bytes_written + PAGE_SIZE as u32 > info.size {
            // The sector is at its budget; the stale page stays in the
            // write buffer and gets overwritten by the caller.
            self.buffers[sector as usize].write_len = 0;
            return Err(MemError::SectorFull);
        }
        if self.queue.is_full() {
            self.buffers[sector as usize].write_len = 0;
            return Err(MemError::QueueFull);
        }

        let address = info.start_address + info.bytes_written;
        let page = self.buffers[sector as usize].swap();
        // The reservation happens here so a later metadata flush never
        // under-counts a page that is already on its way out.
        self.metadata.user_sectors[sector as usize].bytes_written += PAGE_SIZE as u32;
        self.queue
            .push_back(PageRequest::User { sector, address, page })
            .ok();
        Ok(())
    }

    fn enqueue_config(&mut self) -> Result<(), MemError> {
        let mut page = [ERASED_BYTE; PAGE_SIZE];
        self.config.encode(&mut page[..GlobalConfig::SIZE]);
        self.queue
            .push_back(PageRequest::Config { page })
            .map_err(|_| MemError::QueueFull)
    }

    fn enqueue_metadata(&mut self) -> Result<(), MemError> {
        let mut page = [ERASED_BYTE; PAGE_SIZE];
        self.metadata.encode(&mut page[..LayoutMetadata::SIZE]);
        self.queue
            .push_back(PageRequest::Metadata { page })
            .map_err(|_| MemError::QueueFull)
    }

    /// Drains the writer queue to flash. Returns the number of pages
    /// programmed; a page that fails to program is logged and lost.
    pub fn service_queue(&mut self) -> usize {
        let mut written = 0;
        while let Some(request) = self.queue.pop_front() {
            match request {
                PageRequest::Config { page } => {
                    if self.config_next_page >= GLOBAL_CONFIG_PAGES {
                        // The append log is full; start the subsector over.
                        if let Err(err) = self.flash.erase_subsector(GLOBAL_CONFIG_BASE) {
                            log::error!("Configuration subsector erase failed: {:?}", err);
                            continue;
                        }
                        self.config_next_page = 0;
                    }
                    let address = GLOBAL_CONFIG_BASE + self.config_next_page * PAGE_SIZE as u32;
                    match self.flash.program_page(address, &page) {
                        Ok(()) => {
                            self.config_next_page += 1;
                            written += 1;
                        }
                        Err(err) => log::error!("Configuration page lost: {:?}", err),
                    }
                }
                PageRequest::Metadata { page } => {
                    if self.metadata_next_page >= METADATA_PAGES {
                        log::warn!("Metadata log full, flush dropped");
                        continue;
                    }
                    let address = METADATA_BASE + self.metadata_next_page * PAGE_SIZE as u32;
                    match self.flash.program_page(address, &page) {
                        Ok(()) => {
                            self.metadata_next_page += 1;
                            written += 1;
                        }
                        Err(err) => log::error!("Metadata page lost: {:?}", err),
                    }
                }
                PageRequest::User { sector, address, page } => {
                    match self.flash.program_page(address, &page) {
                        Ok(()) => {
                            self.buffers[sector as usize].drained();
                            written += 1;
                        }
                        Err(err) => log::error!("{:?} page lost at {:#08x}: {:?}", sector, address, err),
                    }
                }
            }
        }
        written
    }

    /// Number of pages waiting for the writer.
    pub fn pending_pages(&self) -> usize {
        self.queue.len()
    }

    /// Reads record `index` (zero-based) of a user sector back from flash.
    ///
    /// The record type must match the sector's stream.
    pub fn read_record<R: Record>(&mut self, sector: UserSector, index: u32) -> Result<R, MemError> {
        if R::SIZE != sector.record_size() {
            return Err(MemError::InvalidInput);
        }
        let info = self.metadata.user_sectors[sector as usize];
        let per_page = sector.records_per_page() as u32;
        let page_index = index / per_page;
        if (page_index + 1) * PAGE_SIZE as u32 > info.bytes_written {
            return Err(MemError::OutOfRange);
        }
        let mut page = [0u8; PAGE_SIZE];
        self.flash.read(info.start_address + page_index * PAGE_SIZE as u32, &mut page)?;
        let offset = (index % per_page) as usize * R::SIZE;
        Ok(R::decode(&page[offset..offset + R::SIZE])?)
    }

    /// Reads the newest record of a user sector, if the sector holds any.
    pub fn last_record<R: Record>(&mut self, sector: UserSector) -> Result<Option<R>, MemError> {
        if R::SIZE != sector.record_size() {
            return Err(MemError::InvalidInput);
        }
        let info = self.metadata.user_sectors[sector as usize];
        if info.size == 0 {
            return Ok(None);
        }
        let region = Region { base: info.start_address, pages: info.pages() };
        let Some(last_page) = self.binary_search_region(region)? else {
            return Ok(None);
        };
        let mut page = [0u8; PAGE_SIZE];
        self.flash.read(info.start_address + last_page * PAGE_SIZE as u32, &mut page)?;
        // Within the page the newest record is the last slot that is not
        // erased anymore.
        for slot in (0..sector.records_per_page()).rev() {
            let bytes = &page[slot * R::SIZE..(slot + 1) * R::SIZE];
            if !is_erased(bytes) {
                return Ok(Some(R::decode(bytes)?));
            }
        }
        Ok(None)
    }

    /// The newest flight event on flash; the phase authority after reboot.
    pub fn last_flight_event(&mut self) -> Result<Option<FlightEventRecord>, MemError> {
        self.last_record::<FlightEventRecord>(UserSector::FlightEvent)
    }

    /// Index of the last written page of a user sector, `None` while the
    /// sector is still erased. O(log n) reads.
    pub fn binary_search_last_page(&mut self, sector: UserSector) -> Result<Option<u32>, MemError> {
        let info = self.metadata.user_sectors[sector as usize];
        self.binary_search_region(Region { base: info.start_address, pages: info.pages() })
    }

    /// Same as [`Self::binary_search_last_page`] but O(n); kept as the
    /// reference the fast path is validated against.
    pub fn linear_search_last_page(&mut self, sector: UserSector) -> Result<Option<u32>, MemError> {
        let info = self.metadata.user_sectors[sector as usize];
        let region = Region { base: info.start_address, pages: info.pages() };
        let mut page = [0u8; PAGE_SIZE];
        for index in 0..region.pages {
            self.flash.read(region.base + index * PAGE_SIZE as u32, &mut page)?;
            if is_erased(&page) {
                return Ok(index.checked_sub(1));
            }
        }
        Ok(region.pages.checked_sub(1))
    }

    /// Binary search for the boundary between written and erased pages.
    /// Sound because pages are programmed front to back.
    fn binary_search_region(&mut self, region: Region) -> Result<Option<u32>, MemError> {
        let mut page = [0u8; PAGE_SIZE];
        let mut low = 0i64;
        let mut high = region.pages as i64 - 1;
        while low <= high {
            let middle = (low + high) / 2;
            self.flash.read(region.base + middle as u32 * PAGE_SIZE as u32, &mut page)?;
            if is_erased(&page) {
                high = middle - 1;
            } else {
                low = middle + 1;
            }
        }
        Ok(if high < 0 { None } else { Some(high as u32) })
    }

    /// Reads and decodes the record stored in `last` of a system region.
    fn read_region_record<R: Record>(&mut self, region: Region, last: Option<u32>) -> Result<Option<R>, MemError> {
        let Some(index) = last else { return Ok(None) };
        let mut page = [0u8; PAGE_SIZE];
        self.flash.read(region.base + index * PAGE_SIZE as u32, &mut page)?;
        Ok(R::decode(&page[..R::SIZE]).ok())
    }

    /// Erases the configuration subsector.
    pub fn erase_configuration(&mut self) -> Result<(), MemError> {
        self.flash.erase_subsector(GLOBAL_CONFIG_BASE)?;
        self.config_next_page = 0;
        Ok(())
    }

    /// Erases the whole device and starts a fresh layout from the current
    /// configuration.
    pub fn erase_everything(&mut self) -> Result<(), MemError> {
        self.flash.erase_device()?;
        self.queue.clear();
        self.buffers = [const { SectorBuffer::new() }; USER_SECTOR_COUNT];
        self.metadata = LayoutMetadata::carve(&self.config.memory);
        self.config_next_page = 0;
        self.metadata_next_page = 0;
        Ok(())
    }

    /// Snapshot for the `mem stats` report.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats { layout: self.metadata }
    }
}

/// Per-sector report, rendered line oriented for the debug UART.
pub struct MemoryStats {
    layout: LayoutMetadata,
}

impl core::fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "----- Memory Statistics -----")?;
        for sector in UserSector::ALL {
            let info = self.layout.user_sectors[sector as usize];
            writeln!(f, "Sector {:?}:", sector)?;
            writeln!(f, "  size:            {}", info.size)?;
            writeln!(f, "  begin:           {}", info.start_address)?;
            writeln!(f, "  end:             {}", info.end_address)?;
            writeln!(f, "  bytes on flash:  {}", info.bytes_written)?;
            writeln!(f, "  pages on flash:  {}", info.bytes_written / PAGE_SIZE as u32)?;
            writeln!(
                f,
                "  entries on flash: {}",
                info.bytes_written / PAGE_SIZE as u32 * sector.records_per_page() as u32
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FlightPhase;
    use crate::sim::SimFlash;

    fn small_sectors() -> MemoryConfig {
        MemoryConfig {
            // Two pages of gyro, one subsector for everything else.
            user_sector_sizes: [512, 4096, 4096, 4096, 4096, 4096, 4096],
            ..MemoryConfig::default()
        }
    }

    fn manager_with_small_sectors() -> MemoryManager<SimFlash> {
        let mut manager = MemoryManager::new(SimFlash::new()).unwrap();
        manager.set_memory_config(small_sectors()).unwrap();
        manager.service_queue();
        manager
    }

    fn gyro_record(timestamp: Ticks) -> DataContainer {
        DataContainer {
            timestamp,
            gyro: Some(InertialRecord { timestamp, data: [1.0, 2.0, 3.0] }),
            ..DataContainer::default()
        }
    }

    #[test]
    fn fresh_device_installs_defaults() {
        let mut manager = MemoryManager::new(SimFlash::new()).unwrap();
        assert_eq!(manager.system_config().main_chute_altitude_m, 381);
        assert!(manager.pending_pages() > 0);
        manager.service_queue();

        // A second boot of the same flash restores the written defaults.
        let mut manager = MemoryManager::new(manager.release()).unwrap();
        assert_eq!(manager.pending_pages(), 0);
        assert_eq!(*manager.memory_config(), MemoryConfig::default());
        let _ = manager;
    }

    #[test]
    fn partition_carve_is_contiguous_and_clamped() {
        let layout = LayoutMetadata::carve(&MemoryConfig::default());
        let mut expected_start = USER_DATA_BASE;
        for info in layout.user_sectors {
            assert_eq!(info.start_address, expected_start);
            assert_eq!(info.end_address, info.start_address + info.size);
            assert!(info.end_address <= DEVICE_SIZE);
            assert_eq!(info.size % PAGE_SIZE as u32, 0);
            expected_start = info.end_address;
        }
    }

    #[test]
    fn records_reach_flash_in_order() {
        let mut manager = manager_with_small_sectors();
        // 16 inertial records fill exactly one gyro page, which goes
        // straight to the writer queue.
        for i in 0..16u32 {
            let mut container = gyro_record(i);
            manager.user_data_update(&mut container, i).unwrap();
        }
        assert!(manager.pending_pages() > 0);
        manager.service_queue();

        assert_eq!(manager.sector_info(UserSector::Gyro).bytes_written, 256);
        for i in 0..16u32 {
            let record: InertialRecord = manager.read_record(UserSector::Gyro, i).unwrap();
            assert_eq!(record.timestamp, i);
        }
        assert!(matches!(
            manager.read_record::<InertialRecord>(UserSector::Gyro, 16),
            Err(MemError::OutOfRange)
        ));
    }

    #[test]
    fn full_sector_rejects_pages_and_leaves_neighbours_alone() {
        let mut manager = manager_with_small_sectors();
        // 64 gyro records are 4 pages; only 2 fit into the 512-byte budget.
        let mut last_error = None;
        for i in 0..64u32 {
            let mut container = gyro_record(i);
            if let Err(err) = manager.user_data_update(&mut container, i) {
                last_error = Some(err);
            }
            manager.service_queue();
        }
        assert_eq!(last_error, Some(MemError::SectorFull));

        let info = manager.sector_info(UserSector::Gyro);
        assert_eq!(info.bytes_written, info.size);

        // The neighbouring accel sector is untouched.
        assert_eq!(manager.sector_info(UserSector::Accel).bytes_written, 0);
        assert_eq!(manager.binary_search_last_page(UserSector::Accel).unwrap(), None);
    }

    #[test]
    fn binary_and_linear_search_agree() {
        let mut manager = manager_with_small_sectors();
        for sector in UserSector::ALL {
            assert_eq!(
                manager.binary_search_last_page(sector).unwrap(),
                manager.linear_search_last_page(sector).unwrap(),
            );
        }

        for pages in 1..=4u32 {
            for i in 0..32u32 {
                let timestamp = pages * 100 + i;
                let mut container = DataContainer {
                    timestamp,
                    pressure: Some(BaroRecord { timestamp, value: 101_325.0 }),
                    ..DataContainer::default()
                };
                manager.user_data_update(&mut container, timestamp).unwrap();
            }
            manager.service_queue();
            assert_eq!(
                manager.binary_search_last_page(UserSector::Pressure).unwrap(),
                manager.linear_search_last_page(UserSector::Pressure).unwrap(),
            );
        }
    }

    #[test]
    fn written_pages_are_never_blank() {
        let mut manager = manager_with_small_sectors();
        for i in 0..10u32 {
            let mut container = DataContainer {
                timestamp: i,
                event: Some(FlightEventRecord { timestamp: i, phase: FlightPhase::Launchpad }),
                ..DataContainer::default()
            };
            manager.user_data_update(&mut container, i).unwrap();
            manager.service_queue();
        }

        let info = manager.sector_info(UserSector::FlightEvent);
        assert_eq!(info.bytes_written % PAGE_SIZE as u32, 0);
        let record_size = UserSector::FlightEvent.record_size();
        let mut flash = manager.release();
        let mut page = [0u8; PAGE_SIZE];
        for index in 0..info.bytes_written / PAGE_SIZE as u32 {
            flash.read(info.start_address + index * PAGE_SIZE as u32, &mut page).unwrap();
            assert!(!is_erased(&page));
            // The page tail after the last whole record stays erased.
            assert!(is_erased(&page[record_size..]));
        }
    }

    #[test]
    fn configuration_survives_reboot() {
        let mut manager = MemoryManager::new(SimFlash::new()).unwrap();
        let mut flight = *manager.system_config();
        flight.ground_pressure_pa = 99_500.0;
        manager.set_system_config(flight).unwrap();
        manager.service_queue();

        let mut manager = MemoryManager::new(manager.release()).unwrap();
        assert_eq!(manager.system_config().ground_pressure_pa, 99_500.0);
        let _ = &mut manager;
    }

    #[test]
    fn reboot_reanchors_sectors_past_stale_metadata() {
        let mut manager = manager_with_small_sectors();
        // Fill one page; its write goes through, but no metadata flush
        // happens afterwards, so on-flash metadata trails the stream.
        for i in 0..16u32 {
            let mut container = gyro_record(i);
            manager.user_data_update(&mut container, 0).unwrap();
        }
        manager.service_queue();

        let mut manager = MemoryManager::new(manager.release()).unwrap();
        assert_eq!(manager.sector_info(UserSector::Gyro).bytes_written, 256);

        // New records continue after the recovered page instead of
        // clobbering it.
        for i in 16..32u32 {
            let mut container = gyro_record(i);
            manager.user_data_update(&mut container, 0).unwrap();
        }
        manager.service_queue();
        assert_eq!(manager.sector_info(UserSector::Gyro).bytes_written, 512);
        let first_of_second_page: InertialRecord =
            manager.read_record(UserSector::Gyro, 16).unwrap();
        assert_eq!(first_of_second_page.timestamp, 16);
    }

    #[test]
    fn erase_everything_leaves_erased_flash() {
        let mut manager = manager_with_small_sectors();
        for i in 0..20u32 {
            let mut container = gyro_record(i);
            manager.user_data_update(&mut container, i).unwrap();
        }
        manager.service_queue();
        manager.erase_everything().unwrap();

        let mut flash = manager.release();
        let mut page = [0u8; PAGE_SIZE];
        for index in 0..64u32 {
            flash.read(index * PAGE_SIZE as u32, &mut page).unwrap();
            assert!(is_erased(&page));
        }
    }
}
