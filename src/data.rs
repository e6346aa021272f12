//! Core flight data types and their packed on-flash representation.
//!
//! Every record that ends up on the NOR device goes through the [`Record`]
//! codec: packed, little-endian, fixed size. Pages hold
//! `PAGE_SIZE / Record::SIZE` records back to back; the tail of a page that
//! cannot hold another whole record keeps its erased `0xFF` value.

use crate::flash::PAGE_SIZE;

/// Scheduler tick count. The tick runs at [`TICK_HZ`].
pub type Ticks = u32;

/// Ticks per second of the system time base.
pub const TICK_HZ: u32 = 1_000;

/// Converts milliseconds to ticks.
#[inline]
pub const fn ms_to_ticks(ms: u32) -> Ticks {
    ms * (TICK_HZ / 1_000)
}

/// Returned when a byte slice cannot be decoded into a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRecord;

/// Fixed-size little-endian codec for everything written to flash.
///
/// Implementations must write exactly [`Record::SIZE`] bytes and must be
/// able to reconstruct themselves from the same bytes. Padding bytes are
/// written as zeros so that a programmed page is never all-`0xFF`.
pub trait Record: Sized {
    /// Packed size of one record in bytes.
    const SIZE: usize;

    /// Number of whole records that fit into one flash page.
    const PER_PAGE: usize = PAGE_SIZE / Self::SIZE;

    /// Serializes the record into `out[..Self::SIZE]`.
    fn encode(&self, out: &mut [u8]);

    /// Reconstructs a record from `bytes[..Self::SIZE]`.
    fn decode(bytes: &[u8]) -> Result<Self, InvalidRecord>;
}

#[inline]
pub(crate) fn put_u32(out: &mut [u8], offset: usize, value: u32) {
    out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn get_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap_or([0; 4]))
}

#[inline]
pub(crate) fn put_f32(out: &mut [u8], offset: usize, value: f32) {
    out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn get_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap_or([0; 4]))
}

/// Discrete flight phases in strict mission order.
///
/// The detector only ever moves forward through this sequence; the ordering
/// derived here is the authority for "forward".
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlightPhase {
    /// On the pad, waiting for the launch acceleration spike.
    #[default]
    Launchpad = 0,
    /// Powered ascent and coast, waiting for apogee.
    PreApogee = 1,
    /// Apogee reached, drogue dwell running.
    Apogee = 2,
    /// Descending under drogue.
    PostApogee = 3,
    /// Main-chute altitude crossed, main dwell running.
    MainChute = 4,
    /// Descending under main.
    PostMain = 5,
    /// Touchdown detected, final dwell running.
    Landed = 6,
    /// Mission complete, nothing left to do.
    Exit = 7,
}

impl TryFrom<u8> for FlightPhase {
    type Error = InvalidRecord;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use FlightPhase::*;
        Ok(match value {
            0 => Launchpad,
            1 => PreApogee,
            2 => Apogee,
            3 => PostApogee,
            4 => MainChute,
            5 => PostMain,
            6 => Landed,
            7 => Exit,
            _ => return Err(InvalidRecord),
        })
    }
}

/// Recovery pyro channels, in the order their continuity is recorded.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryChannel {
    Drogue = 0,
    Main = 1,
}

impl RecoveryChannel {
    pub const COUNT: usize = 2;

    pub const ALL: [RecoveryChannel; Self::COUNT] = [RecoveryChannel::Drogue, RecoveryChannel::Main];
}

/// Electrical state of an e-match circuit.
///
/// `Short` means the ignitor is present and the circuit is complete.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    #[default]
    Open = 0,
    Short = 1,
}

impl TryFrom<u8> for Continuity {
    type Error = InvalidRecord;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Continuity::Open),
            1 => Ok(Continuity::Short),
            _ => Err(InvalidRecord),
        }
    }
}

/// Overcurrent flag of a pyro driver. Observed and logged, never persisted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Overcurrent {
    #[default]
    Clear,
    Tripped,
}

/// One axis-triple from the IMU: either acceleration in g or angular rate
/// in deg/s, depending on which stream it was recorded to.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct InertialRecord {
    pub timestamp: Ticks,
    pub data: [f32; 3],
}

impl Record for InertialRecord {
    const SIZE: usize = 16;

    fn encode(&self, out: &mut [u8]) {
        put_u32(out, 0, self.timestamp);
        for (i, v) in self.data.iter().enumerate() {
            put_f32(out, 4 + 4 * i, *v);
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, InvalidRecord> {
        if bytes.len() < Self::SIZE {
            return Err(InvalidRecord);
        }
        Ok(Self {
            timestamp: get_u32(bytes, 0),
            data: [get_f32(bytes, 4), get_f32(bytes, 8), get_f32(bytes, 12)],
        })
    }
}

/// One scalar from the barometric sensor: pressure in Pa or temperature
/// in °C, depending on the stream.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct BaroRecord {
    pub timestamp: Ticks,
    pub value: f32,
}

impl Record for BaroRecord {
    const SIZE: usize = 8;

    fn encode(&self, out: &mut [u8]) {
        put_u32(out, 0, self.timestamp);
        put_f32(out, 4, self.value);
    }

    fn decode(bytes: &[u8]) -> Result<Self, InvalidRecord> {
        if bytes.len() < Self::SIZE {
            return Err(InvalidRecord);
        }
        Ok(Self { timestamp: get_u32(bytes, 0), value: get_f32(bytes, 4) })
    }
}

/// Continuity snapshot of both pyro channels.
///
/// Padded to fill a page on its own; continuity changes are rare and a
/// whole-page record keeps the stream trivially seekable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ContinuityRecord {
    pub timestamp: Ticks,
    pub status: [Continuity; RecoveryChannel::COUNT],
}

impl Record for ContinuityRecord {
    const SIZE: usize = 250;

    fn encode(&self, out: &mut [u8]) {
        out[..Self::SIZE].fill(0);
        put_u32(out, 0, self.timestamp);
        out[4] = self.status[0] as u8;
        out[5] = self.status[1] as u8;
    }

    fn decode(bytes: &[u8]) -> Result<Self, InvalidRecord> {
        if bytes.len() < Self::SIZE {
            return Err(InvalidRecord);
        }
        Ok(Self {
            timestamp: get_u32(bytes, 0),
            status: [bytes[4].try_into()?, bytes[5].try_into()?],
        })
    }
}

/// A single phase transition, padded to one record per page.
///
/// The last of these on flash is the authority for phase recovery after a
/// mid-flight reboot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlightEventRecord {
    pub timestamp: Ticks,
    pub phase: FlightPhase,
}

impl Record for FlightEventRecord {
    const SIZE: usize = 253;

    fn encode(&self, out: &mut [u8]) {
        out[..Self::SIZE].fill(0);
        put_u32(out, 0, self.timestamp);
        out[4] = self.phase as u8;
    }

    fn decode(bytes: &[u8]) -> Result<Self, InvalidRecord> {
        if bytes.len() < Self::SIZE {
            return Err(InvalidRecord);
        }
        Ok(Self { timestamp: get_u32(bytes, 0), phase: bytes[4].try_into()? })
    }
}

/// Everything one controller tick learned about the world.
///
/// A field is `Some` when a fresh datum arrived this tick; consumers take
/// the fields they persist and leave the rest untouched.
#[derive(Debug, Default, Clone)]
pub struct DataContainer {
    /// Tick at which this container was assembled.
    pub timestamp: Ticks,
    pub gyro: Option<InertialRecord>,
    pub acc: Option<InertialRecord>,
    pub mag: Option<InertialRecord>,
    pub pressure: Option<BaroRecord>,
    pub temperature: Option<BaroRecord>,
    pub continuity: Option<ContinuityRecord>,
    pub event: Option<FlightEventRecord>,
}

impl DataContainer {
    /// Drops all pending data, keeping the timestamp.
    pub fn clear(&mut self) {
        let timestamp = self.timestamp;
        *self = Self { timestamp, ..Self::default() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inertial_record_round_trip() {
        let record = InertialRecord { timestamp: 1234, data: [1.5, -2.25, 9.81] };
        let mut buf = [0xFFu8; InertialRecord::SIZE];
        record.encode(&mut buf);
        assert_eq!(InertialRecord::decode(&buf), Ok(record));
    }

    #[test]
    fn whole_records_per_page() {
        assert_eq!(InertialRecord::PER_PAGE, 16);
        assert_eq!(BaroRecord::PER_PAGE, 32);
        assert_eq!(ContinuityRecord::PER_PAGE, 1);
        assert_eq!(FlightEventRecord::PER_PAGE, 1);
    }

    #[test]
    fn event_record_is_never_blank() {
        // A phase-zero event at tick zero must still program at least one
        // bit, otherwise the page would read back as erased.
        let record = FlightEventRecord { timestamp: 0, phase: FlightPhase::Launchpad };
        let mut buf = [0xFFu8; FlightEventRecord::SIZE];
        record.encode(&mut buf);
        assert!(buf[..FlightEventRecord::SIZE].iter().any(|&b| b != 0xFF));
    }

    #[test]
    fn phase_order_is_total() {
        use FlightPhase::*;
        let order = [Launchpad, PreApogee, Apogee, PostApogee, MainChute, PostMain, Landed, Exit];
        for pair in order.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn rejects_unknown_phase_byte() {
        let mut buf = [0u8; FlightEventRecord::SIZE];
        buf[4] = 0x5A;
        assert!(FlightEventRecord::decode(&buf).is_err());
    }
}
