//! Host-side simulation backends.
//!
//! Everything the firmware talks to on the flight board has a deterministic
//! stand-in here: a byte-array NOR flash with real 1→0 programming
//! semantics, scripted sample sources, and a recovery circuit that records
//! its firings instead of burning e-matches. The test suite and the
//! simulator build run the unmodified flight logic against these.

use crate::cfg::{BaroTuning, ImuTuning};
use crate::controller::RecoveryCircuit;
use crate::data::{Continuity, Overcurrent, RecoveryChannel};
use crate::flash::{FlashDevice, FlashError, DEVICE_SIZE, ERASED_BYTE, PAGE_SIZE, SECTOR_SIZE, SUBSECTOR_SIZE};
use crate::sensors::{BaroSample, ImuSample, SampleQueue, SampleSource};

/// In-memory NOR flash with the same geometry as the flight device.
///
/// Programming ANDs data into the array, so a page programmed twice
/// without an erase shows the same bit decay the real part would.
pub struct SimFlash {
    memory: Vec<u8>,
    program_failures_armed: u32,
}

impl SimFlash {
    pub fn new() -> Self {
        Self {
            memory: vec![ERASED_BYTE; DEVICE_SIZE as usize],
            program_failures_armed: 0,
        }
    }

    /// Makes the next `count` page programs report a device failure.
    pub fn arm_program_failures(&mut self, count: u32) {
        self.program_failures_armed = count;
    }

    /// Direct view of the array, for assertions.
    pub fn contents(&self) -> &[u8] {
        &self.memory
    }
}

impl Default for SimFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashDevice for SimFlash {
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let start = address as usize;
        let end = start + buf.len();
        if end > self.memory.len() {
            return Err(FlashError::InvalidRange);
        }
        buf.copy_from_slice(&self.memory[start..end]);
        Ok(())
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        if data.is_empty() || data.len() > PAGE_SIZE {
            return Err(FlashError::InvalidRange);
        }
        if address as usize % PAGE_SIZE + data.len() > PAGE_SIZE {
            return Err(FlashError::InvalidRange);
        }
        let start = address as usize;
        if start + data.len() > self.memory.len() {
            return Err(FlashError::InvalidRange);
        }
        if self.program_failures_armed > 0 {
            self.program_failures_armed -= 1;
            return Err(FlashError::Device);
        }
        for (dst, src) in self.memory[start..start + data.len()].iter_mut().zip(data) {
            *dst &= *src;
        }
        Ok(())
    }

    fn erase_subsector(&mut self, address: u32) -> Result<(), FlashError> {
        if address >= DEVICE_SIZE {
            return Err(FlashError::InvalidRange);
        }
        let base = address as usize / SUBSECTOR_SIZE * SUBSECTOR_SIZE;
        self.memory[base..base + SUBSECTOR_SIZE].fill(ERASED_BYTE);
        Ok(())
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        if address >= DEVICE_SIZE {
            return Err(FlashError::InvalidRange);
        }
        let base = address as usize / SECTOR_SIZE * SECTOR_SIZE;
        self.memory[base..base + SECTOR_SIZE].fill(ERASED_BYTE);
        Ok(())
    }

    fn erase_device(&mut self) -> Result<(), FlashError> {
        self.memory.fill(ERASED_BYTE);
        Ok(())
    }
}

/// Scripted inertial source: tests push samples, the controller reads them
/// through the same bounded queue the flight build uses.
pub struct ScriptedImu {
    queue: SampleQueue<ImuSample>,
    running: bool,
    config: ImuTuning,
}

impl ScriptedImu {
    pub fn new() -> Self {
        Self { queue: SampleQueue::new(), running: true, config: ImuTuning::default() }
    }

    pub fn push(&mut self, sample: ImuSample) {
        self.queue.push(sample);
    }
}

impl Default for ScriptedImu {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for ScriptedImu {
    type Sample = ImuSample;
    type Config = ImuTuning;

    fn try_read(&mut self) -> Option<ImuSample> {
        if self.running { self.queue.pop() } else { None }
    }

    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn configure(&mut self, config: ImuTuning) {
        self.config = config;
    }

    fn default_config() -> ImuTuning {
        ImuTuning::default()
    }

    fn current_config(&self) -> ImuTuning {
        self.config
    }
}

/// Scripted barometric source.
pub struct ScriptedBaro {
    queue: SampleQueue<BaroSample>,
    running: bool,
    config: BaroTuning,
}

impl ScriptedBaro {
    pub fn new() -> Self {
        Self { queue: SampleQueue::new(), running: true, config: BaroTuning::default() }
    }

    pub fn push(&mut self, sample: BaroSample) {
        self.queue.push(sample);
    }
}

impl Default for ScriptedBaro {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for ScriptedBaro {
    type Sample = BaroSample;
    type Config = BaroTuning;

    fn try_read(&mut self) -> Option<BaroSample> {
        if self.running { self.queue.pop() } else { None }
    }

    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn configure(&mut self, config: BaroTuning) {
        self.config = config;
    }

    fn default_config() -> BaroTuning {
        BaroTuning::default()
    }

    fn current_config(&self) -> BaroTuning {
        self.config
    }
}

/// Recovery circuit stand-in. Firings are recorded in order; continuity
/// and overcurrent states are set by the test.
pub struct SimRecovery {
    continuity: [Continuity; RecoveryChannel::COUNT],
    overcurrent: [Overcurrent; RecoveryChannel::COUNT],
    enabled: [bool; RecoveryChannel::COUNT],
    fired: Vec<RecoveryChannel>,
}

impl SimRecovery {
    pub fn new() -> Self {
        Self {
            continuity: [Continuity::Open; RecoveryChannel::COUNT],
            overcurrent: [Overcurrent::Clear; RecoveryChannel::COUNT],
            enabled: [false; RecoveryChannel::COUNT],
            fired: Vec::new(),
        }
    }

    pub fn set_continuity(&mut self, channel: RecoveryChannel, status: Continuity) {
        self.continuity[channel as usize] = status;
    }

    pub fn set_overcurrent(&mut self, channel: RecoveryChannel, status: Overcurrent) {
        self.overcurrent[channel as usize] = status;
    }

    /// Channels fired so far, in firing order.
    pub fn fired(&self) -> &[RecoveryChannel] {
        &self.fired
    }
}

impl Default for SimRecovery {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryCircuit for SimRecovery {
    fn enable(&mut self, channel: RecoveryChannel) {
        self.enabled[channel as usize] = true;
    }

    fn activate(&mut self, channel: RecoveryChannel) {
        if self.enabled[channel as usize] {
            self.fired.push(channel);
            // The drive protocol disables the driver again afterwards.
            self.enabled[channel as usize] = false;
        } else {
            log::warn!("{:?} activated without enable, ignored", channel);
        }
    }

    fn continuity(&mut self, channel: RecoveryChannel) -> Continuity {
        self.continuity[channel as usize]
    }

    fn overcurrent(&mut self, channel: RecoveryChannel) -> Overcurrent {
        self.overcurrent[channel as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::is_erased;

    #[test]
    fn programming_only_clears_bits() {
        let mut flash = SimFlash::new();
        flash.program_page(0, &[0xF0; 16]).unwrap();
        flash.program_page(0, &[0x0F; 16]).unwrap();
        let mut buf = [0u8; 16];
        flash.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0x00; 16]);
    }

    #[test]
    fn subsector_erase_restores_ff() {
        let mut flash = SimFlash::new();
        flash.program_page(SUBSECTOR_SIZE as u32, &[0u8; PAGE_SIZE]).unwrap();
        flash.erase_subsector(SUBSECTOR_SIZE as u32 + 100).unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        flash.read(SUBSECTOR_SIZE as u32, &mut buf).unwrap();
        assert!(is_erased(&buf));
    }

    #[test]
    fn page_wrap_is_rejected() {
        let mut flash = SimFlash::new();
        assert_eq!(
            flash.program_page(PAGE_SIZE as u32 - 4, &[0u8; 8]),
            Err(FlashError::InvalidRange)
        );
    }

    #[test]
    fn scan_finds_first_empty_page() {
        let mut flash = SimFlash::new();
        flash.program_page(0, &[0u8; PAGE_SIZE]).unwrap();
        flash.program_page(PAGE_SIZE as u32, &[0u8; PAGE_SIZE]).unwrap();
        assert_eq!(flash.scan_first_empty().unwrap(), 2 * PAGE_SIZE as u32);
    }
}
