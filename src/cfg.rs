//! Mission configuration: the crash-safe global record kept in the first
//! flash subsector, split into the memory-manager half and the flight-system
//! half.
//!
//! The record starts with a 12-byte ASCII signature. Erased flash reads as
//! `0xFF` everywhere, so a matching signature is what separates "a record
//! was written here" from "fresh device"; decoding fails without it and the
//! caller installs defaults.

use crate::data::{get_f32, get_u32, put_f32, put_u32, InvalidRecord, Record};
use crate::mem::USER_SECTOR_COUNT;

/// Sentinel distinguishing a valid record from erased flash.
pub const DATA_INTEGRITY_SIGNATURE: [u8; 12] = *b"6e2201ac6e0d";

/// Write policy knobs of the memory manager.
///
/// The per-sector byte budgets may exceed what the device can hold; they
/// are upper bounds, and the partition carve clamps them to the space that
/// actually exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    pub write_pre_launch_multiplier: u8,
    pub write_pre_apogee_multiplier: u8,
    pub write_post_apogee_multiplier: u8,
    pub write_ground_multiplier: u8,

    pub write_interval_accelerometer_ms: u16,
    pub write_interval_gyroscope_ms: u16,
    pub write_interval_magnetometer_ms: u16,
    pub write_interval_pressure_ms: u16,
    pub write_interval_altitude_ms: u16,
    pub write_interval_temperature_ms: u16,
    pub write_interval_flight_state_ms: u16,
    pub write_interval_drogue_continuity_ms: u16,
    pub write_interval_main_continuity_ms: u16,

    /// Byte budget per user data sector, in sector enum order.
    pub user_sector_sizes: [u32; USER_SECTOR_COUNT],
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            write_pre_launch_multiplier: 0,
            write_pre_apogee_multiplier: 0,
            write_post_apogee_multiplier: 0,
            write_ground_multiplier: 0,
            write_interval_accelerometer_ms: 0,
            write_interval_gyroscope_ms: 0,
            write_interval_magnetometer_ms: 0,
            write_interval_pressure_ms: 0,
            write_interval_altitude_ms: 0,
            write_interval_temperature_ms: 0,
            write_interval_flight_state_ms: 0,
            write_interval_drogue_continuity_ms: 0,
            write_interval_main_continuity_ms: 0,
            user_sector_sizes: [
                0xE0_0000, /* gyro, 14 MiB   */
                0xE0_0000, /* accel, 14 MiB  */
                0x04_EC00, /* mag, 315 KiB   */
                0x07_E400, /* press, 505 KiB */
                0x07_E400, /* temp, 505 KiB  */
                0x02_8000, /* cont, 160 KiB  */
                0x02_8000, /* event, 160 KiB */
            ],
        }
    }
}

impl Record for MemoryConfig {
    const SIZE: usize = 4 + 9 * 2 + USER_SECTOR_COUNT * 4;

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.write_pre_launch_multiplier;
        out[1] = self.write_pre_apogee_multiplier;
        out[2] = self.write_post_apogee_multiplier;
        out[3] = self.write_ground_multiplier;
        let intervals = [
            self.write_interval_accelerometer_ms,
            self.write_interval_gyroscope_ms,
            self.write_interval_magnetometer_ms,
            self.write_interval_pressure_ms,
            self.write_interval_altitude_ms,
            self.write_interval_temperature_ms,
            self.write_interval_flight_state_ms,
            self.write_interval_drogue_continuity_ms,
            self.write_interval_main_continuity_ms,
        ];
        for (i, v) in intervals.iter().enumerate() {
            out[4 + 2 * i..6 + 2 * i].copy_from_slice(&v.to_le_bytes());
        }
        for (i, v) in self.user_sector_sizes.iter().enumerate() {
            put_u32(out, 22 + 4 * i, *v);
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, InvalidRecord> {
        if bytes.len() < Self::SIZE {
            return Err(InvalidRecord);
        }
        let word = |i: usize| u16::from_le_bytes([bytes[4 + 2 * i], bytes[5 + 2 * i]]);
        let mut user_sector_sizes = [0u32; USER_SECTOR_COUNT];
        for (i, size) in user_sector_sizes.iter_mut().enumerate() {
            *size = get_u32(bytes, 22 + 4 * i);
        }
        Ok(Self {
            write_pre_launch_multiplier: bytes[0],
            write_pre_apogee_multiplier: bytes[1],
            write_post_apogee_multiplier: bytes[2],
            write_ground_multiplier: bytes[3],
            write_interval_accelerometer_ms: word(0),
            write_interval_gyroscope_ms: word(1),
            write_interval_magnetometer_ms: word(2),
            write_interval_pressure_ms: word(3),
            write_interval_altitude_ms: word(4),
            write_interval_temperature_ms: word(5),
            write_interval_flight_state_ms: word(6),
            write_interval_drogue_continuity_ms: word(7),
            write_interval_main_continuity_ms: word(8),
            user_sector_sizes,
        })
    }
}

/// IMU tuning handed to the inertial source. Values are the sensor's own
/// register codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImuTuning {
    pub accel_bandwidth: u8,
    pub accel_output_data_rate: u8,
    pub accel_range: u8,
    pub accel_power: u8,
    pub gyro_bandwidth: u8,
    pub gyro_output_data_rate: u8,
    pub gyro_range: u8,
    pub gyro_power: u8,
}

impl Default for ImuTuning {
    fn default() -> Self {
        Self {
            accel_bandwidth: 0x02,        /* normal filter */
            accel_output_data_rate: 0x08, /* 100 Hz */
            accel_range: 0x02,            /* ±12 g */
            accel_power: 0x00,            /* active */
            gyro_bandwidth: 0x02,
            gyro_output_data_rate: 0x02,
            gyro_range: 0x01, /* ±1000 deg/s */
            gyro_power: 0x00,
        }
    }
}

impl Record for ImuTuning {
    const SIZE: usize = 8;

    fn encode(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&[
            self.accel_bandwidth,
            self.accel_output_data_rate,
            self.accel_range,
            self.accel_power,
            self.gyro_bandwidth,
            self.gyro_output_data_rate,
            self.gyro_range,
            self.gyro_power,
        ]);
    }

    fn decode(bytes: &[u8]) -> Result<Self, InvalidRecord> {
        if bytes.len() < Self::SIZE {
            return Err(InvalidRecord);
        }
        Ok(Self {
            accel_bandwidth: bytes[0],
            accel_output_data_rate: bytes[1],
            accel_range: bytes[2],
            accel_power: bytes[3],
            gyro_bandwidth: bytes[4],
            gyro_output_data_rate: bytes[5],
            gyro_range: bytes[6],
            gyro_power: bytes[7],
        })
    }
}

/// Barometric sensor tuning, register codes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaroTuning {
    pub output_data_rate: u8,
    pub temperature_oversampling: u8,
    pub pressure_oversampling: u8,
    pub iir_filter_coefficient: u8,
}

impl Default for BaroTuning {
    fn default() -> Self {
        Self {
            output_data_rate: 0x02, /* 50 Hz */
            temperature_oversampling: 0x00,
            pressure_oversampling: 0x03, /* 8x */
            iir_filter_coefficient: 0x02,
        }
    }
}

impl Record for BaroTuning {
    const SIZE: usize = 4;

    fn encode(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&[
            self.output_data_rate,
            self.temperature_oversampling,
            self.pressure_oversampling,
            self.iir_filter_coefficient,
        ]);
    }

    fn decode(bytes: &[u8]) -> Result<Self, InvalidRecord> {
        if bytes.len() < Self::SIZE {
            return Err(InvalidRecord);
        }
        Ok(Self {
            output_data_rate: bytes[0],
            temperature_oversampling: bytes[1],
            pressure_oversampling: bytes[2],
            iir_filter_coefficient: bytes[3],
        })
    }
}

/// Flight-system half of the global configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlightConfig {
    /// Fallback timers for each leg of the flight, seconds.
    pub backup_time_launch_to_apogee_s: u32,
    pub backup_time_apogee_to_main_s: u32,
    pub backup_time_main_to_ground_s: u32,

    /// Altitude above launch at which the main chute deploys, meters.
    pub main_chute_altitude_m: u16,

    /// Pad-level reference captured before launch.
    pub ground_pressure_pa: f32,
    pub ground_temperature_c: f32,

    /// Vertical acceleration that counts as a launch, in g.
    pub launch_acceleration_g: f32,
    /// Rotation rate under which the airframe counts as landed, deg/s.
    pub landing_rotation_speed_deg_s: f32,

    /// Accepted magnitude band of the smoothed altitude-gradient flip that
    /// marks apogee, meters. Airframe-specific tuning.
    pub apogee_delta_min_m: f32,
    pub apogee_delta_max_m: f32,

    /// How long an e-match drive line stays active, milliseconds.
    pub e_match_active_ms: u16,

    /// Set when the sources deliver raw register values that still need
    /// conversion to g / deg/s respectively Pa / °C.
    pub imu_needs_conversion: bool,
    pub baro_needs_conversion: bool,

    pub imu: ImuTuning,
    pub baro: BaroTuning,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            backup_time_launch_to_apogee_s: 27,
            backup_time_apogee_to_main_s: 116,
            backup_time_main_to_ground_s: 191,
            main_chute_altitude_m: 381,
            ground_pressure_pa: 101_325.0,
            ground_temperature_c: 15.0,
            launch_acceleration_g: 6.9,
            landing_rotation_speed_deg_s: 5.0,
            apogee_delta_min_m: 0.2,
            apogee_delta_max_m: 5.0,
            e_match_active_ms: 50,
            imu_needs_conversion: true,
            baro_needs_conversion: true,
            imu: ImuTuning::default(),
            baro: BaroTuning::default(),
        }
    }
}

impl Record for FlightConfig {
    const SIZE: usize = 3 * 4 + 2 + 6 * 4 + 2 + 2 + ImuTuning::SIZE + BaroTuning::SIZE;

    fn encode(&self, out: &mut [u8]) {
        put_u32(out, 0, self.backup_time_launch_to_apogee_s);
        put_u32(out, 4, self.backup_time_apogee_to_main_s);
        put_u32(out, 8, self.backup_time_main_to_ground_s);
        out[12..14].copy_from_slice(&self.main_chute_altitude_m.to_le_bytes());
        put_f32(out, 14, self.ground_pressure_pa);
        put_f32(out, 18, self.ground_temperature_c);
        put_f32(out, 22, self.launch_acceleration_g);
        put_f32(out, 26, self.landing_rotation_speed_deg_s);
        put_f32(out, 30, self.apogee_delta_min_m);
        put_f32(out, 34, self.apogee_delta_max_m);
        out[38..40].copy_from_slice(&self.e_match_active_ms.to_le_bytes());
        out[40] = self.imu_needs_conversion as u8;
        out[41] = self.baro_needs_conversion as u8;
        self.imu.encode(&mut out[42..42 + ImuTuning::SIZE]);
        self.baro.encode(&mut out[50..50 + BaroTuning::SIZE]);
    }

    fn decode(bytes: &[u8]) -> Result<Self, InvalidRecord> {
        if bytes.len() < Self::SIZE {
            return Err(InvalidRecord);
        }
        Ok(Self {
            backup_time_launch_to_apogee_s: get_u32(bytes, 0),
            backup_time_apogee_to_main_s: get_u32(bytes, 4),
            backup_time_main_to_ground_s: get_u32(bytes, 8),
            main_chute_altitude_m: u16::from_le_bytes([bytes[12], bytes[13]]),
            ground_pressure_pa: get_f32(bytes, 14),
            ground_temperature_c: get_f32(bytes, 18),
            launch_acceleration_g: get_f32(bytes, 22),
            landing_rotation_speed_deg_s: get_f32(bytes, 26),
            apogee_delta_min_m: get_f32(bytes, 30),
            apogee_delta_max_m: get_f32(bytes, 34),
            e_match_active_ms: u16::from_le_bytes([bytes[38], bytes[39]]),
            imu_needs_conversion: bytes[40] != 0,
            baro_needs_conversion: bytes[41] != 0,
            imu: ImuTuning::decode(&bytes[42..42 + ImuTuning::SIZE])?,
            baro: BaroTuning::decode(&bytes[50..50 + BaroTuning::SIZE])?,
        })
    }
}

/// The full signed configuration record as it lives on flash.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct GlobalConfig {
    pub memory: MemoryConfig,
    pub flight: FlightConfig,
}

impl Record for GlobalConfig {
    const SIZE: usize = DATA_INTEGRITY_SIGNATURE.len() + MemoryConfig::SIZE + FlightConfig::SIZE;

    fn encode(&self, out: &mut [u8]) {
        out[..12].copy_from_slice(&DATA_INTEGRITY_SIGNATURE);
        self.memory.encode(&mut out[12..12 + MemoryConfig::SIZE]);
        self.flight.encode(&mut out[12 + MemoryConfig::SIZE..Self::SIZE]);
    }

    fn decode(bytes: &[u8]) -> Result<Self, InvalidRecord> {
        if bytes.len() < Self::SIZE || bytes[..12] != DATA_INTEGRITY_SIGNATURE {
            return Err(InvalidRecord);
        }
        Ok(Self {
            memory: MemoryConfig::decode(&bytes[12..12 + MemoryConfig::SIZE])?,
            flight: FlightConfig::decode(&bytes[12 + MemoryConfig::SIZE..Self::SIZE])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::PAGE_SIZE;

    #[test]
    fn global_config_fits_one_page() {
        assert!(GlobalConfig::SIZE <= PAGE_SIZE);
    }

    #[test]
    fn global_config_round_trip() {
        let mut config = GlobalConfig::default();
        config.flight.ground_pressure_pa = 99_500.0;
        config.memory.user_sector_sizes[0] = 512;

        let mut buf = [0xFFu8; GlobalConfig::SIZE];
        config.encode(&mut buf);
        assert_eq!(GlobalConfig::decode(&buf), Ok(config));
    }

    #[test]
    fn erased_bytes_do_not_decode() {
        let buf = [0xFFu8; GlobalConfig::SIZE];
        assert!(GlobalConfig::decode(&buf).is_err());
    }

    #[test]
    fn signature_mismatch_is_rejected() {
        let mut buf = [0u8; GlobalConfig::SIZE];
        GlobalConfig::default().encode(&mut buf);
        buf[3] ^= 0x01;
        assert!(GlobalConfig::decode(&buf).is_err());
    }
}
