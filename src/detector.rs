//! Flight event detection.
//!
//! A pure consumer of fused samples: pressure turns into altitude above
//! launch, altitude and inertial data drive the forward-only phase
//! sequence, and every transition is stamped into the outgoing container
//! as a flight-event record. The detector itself never touches hardware
//! and never fails; bad input simply detects nothing.

use num_traits::Float;

use crate::cfg::FlightConfig;
use crate::data::{ms_to_ticks, DataContainer, FlightEventRecord, FlightPhase, Ticks};

/// Altitude samples the apogee gradient is smoothed over.
pub const ALTITUDE_WINDOW_CAPACITY: usize = 100;

/// Acceleration magnitude under which the airframe is in free fall, g.
const APOGEE_FREE_FALL_G: f32 = 0.1;

/// Band around a target altitude that counts as "crossed", meters.
const ALTITUDE_THRESHOLD_M: f32 = 25.0;

/// Minimum residency in a phase before the timed follow-up transition.
const PHASE_DWELL: Ticks = ms_to_ticks(1_000);

/* Standard-atmosphere constants of the barometric formula. */
const SEA_LEVEL_PRESSURE_PA: f32 = 101_325.0;
const SEA_LEVEL_TEMPERATURE_K: f32 = 288.15;
const TEMPERATURE_LAPSE_RATE_K_M: f32 = -0.006_5;
const GAS_CONSTANT: f32 = 8.314_32;
const GRAVITY_M_S2: f32 = 9.806_65;
const AIR_MOLAR_MASS_KG_MOL: f32 = 0.028_964_4;

/// Altitude above sea level for a static pressure, standard atmosphere.
pub fn pressure_to_altitude(pressure_pa: f32) -> f32 {
    let exponent = (-GAS_CONSTANT * TEMPERATURE_LAPSE_RATE_K_M) / (GRAVITY_M_S2 * AIR_MOLAR_MASS_KG_MOL);
    (SEA_LEVEL_TEMPERATURE_K / TEMPERATURE_LAPSE_RATE_K_M)
        * ((pressure_pa / SEA_LEVEL_PRESSURE_PA).powf(exponent) - 1.0)
}

/// Inverse of [`pressure_to_altitude`]; the simulator scripts flights with
/// it.
pub fn altitude_to_pressure(altitude_m: f32) -> f32 {
    let exponent = (GRAVITY_M_S2 * AIR_MOLAR_MASS_KG_MOL) / (-GAS_CONSTANT * TEMPERATURE_LAPSE_RATE_K_M);
    SEA_LEVEL_PRESSURE_PA
        * (1.0 + altitude_m * TEMPERATURE_LAPSE_RATE_K_M / SEA_LEVEL_TEMPERATURE_K).powf(exponent)
}

#[inline]
fn vector_norm(v: [f32; 3]) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// Fixed-capacity ring of the most recent altitude readings, iterated
/// oldest first.
pub struct AltitudeWindow<const N: usize> {
    buffer: [f32; N],
    head: usize,
    len: usize,
}

impl<const N: usize> AltitudeWindow<N> {
    pub const fn new() -> Self {
        Self { buffer: [0.0; N], head: 0, len: 0 }
    }

    pub fn push(&mut self, value: f32) {
        self.buffer[self.head] = value;
        self.head = (self.head + 1) % N;
        if self.len < N {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Values in insertion order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = f32> + '_ {
        let start = (self.head + N - self.len) % N;
        (0..self.len).map(move |i| self.buffer[(start + i) % N])
    }
}

impl<const N: usize> Default for AltitudeWindow<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// How apogee is recognized.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ApogeeStrategy {
    /// Sign flip of the smoothed altitude gradient over the sample window,
    /// bounded by the configured magnitude band.
    #[default]
    SmoothedGradient,
    /// Acceleration magnitude dropping below the free-fall threshold.
    FreeFall,
}

/// The flight phase state machine.
pub struct EventDetector {
    config: FlightConfig,
    strategy: ApogeeStrategy,
    phase: FlightPhase,
    ground_altitude_m: f32,
    current_altitude_m: f32,
    window: AltitudeWindow<ALTITUDE_WINDOW_CAPACITY>,
    dwell_started: Ticks,
}

impl EventDetector {
    /// Builds the detector from a configuration snapshot and the phase
    /// restored from flash, if any.
    pub fn new(config: FlightConfig, restored: Option<FlightPhase>, strategy: ApogeeStrategy) -> Self {
        let phase = restored.unwrap_or(FlightPhase::Launchpad);
        if phase != FlightPhase::Launchpad {
            log::info!("Resuming flight in phase {:?}", phase);
        }
        Self {
            ground_altitude_m: pressure_to_altitude(config.ground_pressure_pa),
            config,
            strategy,
            phase,
            current_altitude_m: 0.0,
            window: AltitudeWindow::new(),
            dwell_started: 0,
        }
    }

    pub fn phase(&self) -> FlightPhase {
        self.phase
    }

    /// Altitude above launch from the latest pressure sample, meters.
    pub fn current_altitude(&self) -> f32 {
        self.current_altitude_m
    }

    pub fn flight_started(&self) -> bool {
        self.phase != FlightPhase::Launchpad
    }

    /// Re-reads the ground reference after the pad snapshot was taken.
    pub fn update_ground_reference(&mut self, config: &FlightConfig) {
        self.config.ground_pressure_pa = config.ground_pressure_pa;
        self.config.ground_temperature_c = config.ground_temperature_c;
        self.ground_altitude_m = pressure_to_altitude(config.ground_pressure_pa);
    }

    /// Consumes one tick worth of samples and returns the (possibly new)
    /// phase. A transition is stamped into `data.event`.
    pub fn feed(&mut self, data: &mut DataContainer) -> FlightPhase {
        if let Some(pressure) = data.pressure {
            self.current_altitude_m = pressure_to_altitude(pressure.value) - self.ground_altitude_m;
            self.window.push(self.current_altitude_m);
        }
        let now = data.timestamp;

        match self.phase {
            FlightPhase::Launchpad => {
                if let Some(acc) = data.acc {
                    if acc.data[0] > self.config.launch_acceleration_g {
                        log::info!("Launch detected at {:.1} g", acc.data[0]);
                        self.advance(data, FlightPhase::PreApogee);
                    }
                }
            }
            FlightPhase::PreApogee => {
                let detected = match self.strategy {
                    ApogeeStrategy::SmoothedGradient => {
                        data.pressure.is_some() && self.apogee_from_window()
                    }
                    ApogeeStrategy::FreeFall => data
                        .acc
                        .map_or(false, |acc| vector_norm(acc.data) < APOGEE_FREE_FALL_G),
                };
                if detected {
                    log::info!("Apogee detected at {:.1} m", self.current_altitude_m);
                    self.advance(data, FlightPhase::Apogee);
                    self.dwell_started = now;
                }
            }
            FlightPhase::Apogee => {
                if now.wrapping_sub(self.dwell_started) >= PHASE_DWELL {
                    self.advance(data, FlightPhase::PostApogee);
                }
            }
            FlightPhase::PostApogee => {
                if data.pressure.is_some() {
                    let target = self.config.main_chute_altitude_m as f32;
                    if (self.current_altitude_m - target).abs() < ALTITUDE_THRESHOLD_M {
                        log::info!("Main chute altitude crossed at {:.1} m", self.current_altitude_m);
                        self.advance(data, FlightPhase::MainChute);
                        self.dwell_started = now;
                    }
                }
            }
            FlightPhase::MainChute => {
                if now.wrapping_sub(self.dwell_started) >= PHASE_DWELL {
                    self.advance(data, FlightPhase::PostMain);
                }
            }
            FlightPhase::PostMain => {
                let by_rotation = data
                    .gyro
                    .map_or(false, |gyro| vector_norm(gyro.data) < self.config.landing_rotation_speed_deg_s);
                let by_altitude =
                    data.pressure.is_some() && self.current_altitude_m.abs() < ALTITUDE_THRESHOLD_M;
                if by_rotation || by_altitude {
                    log::info!("Landing detected");
                    self.advance(data, FlightPhase::Landed);
                    self.dwell_started = now;
                }
            }
            FlightPhase::Landed => {
                if now.wrapping_sub(self.dwell_started) >= PHASE_DWELL {
                    self.advance(data, FlightPhase::Exit);
                }
            }
            FlightPhase::Exit => {}
        }

        self.phase
    }

    /// Smoothed-gradient apogee predicate over the altitude window.
    ///
    /// The two sliding means differ only in their end points, so the
    /// gradient reduces to `(newest - oldest) / (n - 1)`. The magnitude
    /// band rejects both sensor noise and physically impossible jumps.
    /// A part-filled window is insufficient data: with few samples the
    /// divisor shrinks and noise alone could pass the band.
    fn apogee_from_window(&self) -> bool {
        let n = self.window.len();
        if n < ALTITUDE_WINDOW_CAPACITY {
            return false;
        }
        let mut sum = 0.0f32;
        let mut oldest = 0.0f32;
        let mut newest = 0.0f32;
        for (i, value) in self.window.iter().enumerate() {
            if i == 0 {
                oldest = value;
            }
            if i == n - 1 {
                newest = value;
            }
            sum += value;
        }
        let span = (n - 1) as f32;
        let previous_mean = (sum - newest) / span;
        let last_mean = (sum - oldest) / span;

        let difference = last_mean - previous_mean;
        let magnitude = (last_mean.abs() - previous_mean.abs()).abs();
        difference < 0.0
            && magnitude > self.config.apogee_delta_min_m
            && magnitude < self.config.apogee_delta_max_m
    }

    fn advance(&mut self, data: &mut DataContainer, next: FlightPhase) {
        debug_assert!(next > self.phase);
        self.phase = next;
        data.event = Some(FlightEventRecord { timestamp: data.timestamp, phase: next });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BaroRecord, InertialRecord};

    fn container_at(now: Ticks) -> DataContainer {
        DataContainer { timestamp: now, ..DataContainer::default() }
    }

    fn with_acc(now: Ticks, acc: [f32; 3]) -> DataContainer {
        DataContainer {
            timestamp: now,
            acc: Some(InertialRecord { timestamp: now, data: acc }),
            ..DataContainer::default()
        }
    }

    fn with_altitude(now: Ticks, altitude_m: f32) -> DataContainer {
        DataContainer {
            timestamp: now,
            pressure: Some(BaroRecord { timestamp: now, value: altitude_to_pressure(altitude_m) }),
            ..DataContainer::default()
        }
    }

    fn detector() -> EventDetector {
        EventDetector::new(FlightConfig::default(), None, ApogeeStrategy::SmoothedGradient)
    }

    #[test]
    fn barometric_formula_is_sane() {
        assert!(pressure_to_altitude(SEA_LEVEL_PRESSURE_PA).abs() < 0.5);
        let one_km = pressure_to_altitude(altitude_to_pressure(1_000.0));
        assert!((one_km - 1_000.0).abs() < 1.0);
        assert!(pressure_to_altitude(90_000.0) > 0.0);
    }

    #[test]
    fn launch_fires_on_vertical_acceleration() {
        let mut detector = detector();
        let mut data = with_acc(10, [5.0, 0.0, 0.0]);
        assert_eq!(detector.feed(&mut data), FlightPhase::Launchpad);
        assert!(data.event.is_none());

        let mut data = with_acc(20, [7.0, 0.0, 0.0]);
        assert_eq!(detector.feed(&mut data), FlightPhase::PreApogee);
        assert_eq!(data.event.map(|e| e.phase), Some(FlightPhase::PreApogee));
    }

    #[test]
    fn one_altitude_sample_cannot_be_apogee() {
        let mut detector =
            EventDetector::new(FlightConfig::default(), Some(FlightPhase::PreApogee), ApogeeStrategy::SmoothedGradient);
        let mut data = with_altitude(10, 500.0);
        assert_eq!(detector.feed(&mut data), FlightPhase::PreApogee);
        assert!(data.event.is_none());
    }

    #[test]
    fn apogee_found_at_the_top_of_a_parabola() {
        let mut detector =
            EventDetector::new(FlightConfig::default(), Some(FlightPhase::PreApogee), ApogeeStrategy::SmoothedGradient);
        let mut apogee_events = 0;
        let mut now = 0;
        // Up 0 → 1000 m and back down, 2 m per 20 ms sample.
        for step in 0..1_000i32 {
            let altitude = if step < 500 { step * 2 } else { 2_000 - step * 2 };
            now += 20;
            let mut data = with_altitude(now, altitude as f32);
            detector.feed(&mut data);
            if data.event.map(|e| e.phase) == Some(FlightPhase::Apogee) {
                apogee_events += 1;
            }
        }
        assert_eq!(apogee_events, 1);
        assert!(detector.phase() >= FlightPhase::Apogee);
    }

    #[test]
    fn free_fall_strategy_uses_acceleration_norm() {
        let mut detector =
            EventDetector::new(FlightConfig::default(), Some(FlightPhase::PreApogee), ApogeeStrategy::FreeFall);
        let mut data = with_acc(10, [0.02, 0.03, 0.05]);
        assert_eq!(detector.feed(&mut data), FlightPhase::Apogee);
    }

    #[test]
    fn dwell_holds_the_drogue_for_a_second() {
        let mut detector =
            EventDetector::new(FlightConfig::default(), Some(FlightPhase::PreApogee), ApogeeStrategy::FreeFall);
        let mut data = with_acc(1_000, [0.0, 0.0, 0.0]);
        assert_eq!(detector.feed(&mut data), FlightPhase::Apogee);

        let mut data = container_at(1_900);
        assert_eq!(detector.feed(&mut data), FlightPhase::Apogee);
        let mut data = container_at(2_000);
        assert_eq!(detector.feed(&mut data), FlightPhase::PostApogee);
    }

    #[test]
    fn landing_by_rotation_rate() {
        let mut detector =
            EventDetector::new(FlightConfig::default(), Some(FlightPhase::PostMain), ApogeeStrategy::SmoothedGradient);
        let mut data = container_at(10);
        data.gyro = Some(InertialRecord { timestamp: 10, data: [30.0, 10.0, 4.0] });
        assert_eq!(detector.feed(&mut data), FlightPhase::PostMain);

        let mut data = container_at(20);
        data.gyro = Some(InertialRecord { timestamp: 20, data: [1.0, 2.0, 1.0] });
        assert_eq!(detector.feed(&mut data), FlightPhase::Landed);
    }

    #[test]
    fn phase_never_regresses() {
        let mut detector =
            EventDetector::new(FlightConfig::default(), Some(FlightPhase::Landed), ApogeeStrategy::SmoothedGradient);
        // A launch-grade acceleration spike means nothing after touchdown.
        let mut data = with_acc(10, [9.0, 0.0, 0.0]);
        let phase = detector.feed(&mut data);
        assert!(phase >= FlightPhase::Landed);
    }
}
