//! Flight controller: the top-level per-tick orchestration.
//!
//! Each tick pulls at most one inertial and one barometric sample, feeds
//! them to the event detector, dispatches the per-phase action (which may
//! fire a recovery channel), and forwards everything fresh to the memory
//! manager. Construction restores the phase from the flight-event stream,
//! so a reboot in the air resumes mid-mission.

use crate::data::{
    Continuity, ContinuityRecord, DataContainer, FlightPhase, InertialRecord, Overcurrent,
    RecoveryChannel, Ticks,
};
use crate::detector::{ApogeeStrategy, EventDetector};
use crate::flash::FlashDevice;
use crate::mem::{MemError, MemoryManager};
use crate::sensors::{BaroSample, ImuSample, SampleSource};

/// Seam to the pyro hardware.
///
/// `activate` runs the full drive protocol: clear the drive line, pull it
/// active for the configured e-match duration, release it and disable the
/// driver again. Implementations block for the hold time, so this is only
/// ever called from the controller task.
pub trait RecoveryCircuit {
    fn enable(&mut self, channel: RecoveryChannel);
    fn activate(&mut self, channel: RecoveryChannel);
    fn continuity(&mut self, channel: RecoveryChannel) -> Continuity;
    fn overcurrent(&mut self, channel: RecoveryChannel) -> Overcurrent;
}

/// Top-level flight state machine and actuator.
pub struct FlightController<R> {
    detector: EventDetector,
    recovery: R,
    last_continuity: [Continuity; RecoveryChannel::COUNT],
    drogue_fired: bool,
    main_fired: bool,
    ground_reference_set: bool,
}

impl<R: RecoveryCircuit> FlightController<R> {
    /// Restores the phase from the flight-event stream and builds the
    /// detector from the persisted configuration.
    ///
    /// On the pad the ground reference is still unset; the first
    /// barometric sample of [`Self::tick`] captures it. After a mid-flight
    /// reboot the restored configuration already carries it.
    pub fn new<F: FlashDevice>(
        manager: &mut MemoryManager<F>,
        recovery: R,
        strategy: ApogeeStrategy,
    ) -> Result<Self, MemError> {
        let restored = manager.last_flight_event()?;
        if let Some(event) = restored {
            log::info!("Last recorded flight event: {:?} at tick {}", event.phase, event.timestamp);
        }
        let detector = EventDetector::new(*manager.system_config(), restored.map(|e| e.phase), strategy);
        let ground_reference_set = detector.flight_started();
        Ok(Self {
            detector,
            recovery,
            last_continuity: [Continuity::Open; RecoveryChannel::COUNT],
            drogue_fired: false,
            main_fired: false,
            ground_reference_set,
        })
    }

    pub fn phase(&self) -> FlightPhase {
        self.detector.phase()
    }

    /// The recovery circuit, e.g. for continuity diagnostics.
    pub fn recovery(&self) -> &R {
        &self.recovery
    }

    pub fn recovery_mut(&mut self) -> &mut R {
        &mut self.recovery
    }

    /// Altitude above launch as the detector currently sees it.
    pub fn current_altitude(&self) -> f32 {
        self.detector.current_altitude()
    }

    /// Pulls fresh samples from both sources and runs one tick.
    pub fn poll<F, I, B>(
        &mut self,
        manager: &mut MemoryManager<F>,
        imu: &mut I,
        baro: &mut B,
        now: Ticks,
    ) -> FlightPhase
    where
        F: FlashDevice,
        I: SampleSource<Sample = ImuSample>,
        B: SampleSource<Sample = BaroSample>,
    {
        let imu_sample = imu.try_read();
        let baro_sample = baro.try_read();
        self.tick(manager, imu_sample, baro_sample, now)
    }

    /// Runs one controller tick over already-pulled samples.
    pub fn tick<F: FlashDevice>(
        &mut self,
        manager: &mut MemoryManager<F>,
        imu: Option<ImuSample>,
        baro: Option<BaroSample>,
        now: Ticks,
    ) -> FlightPhase {
        let mut container = DataContainer { timestamp: now, ..DataContainer::default() };

        if let Some(sample) = imu {
            container.acc = Some(InertialRecord { timestamp: sample.timestamp, data: sample.acc });
            container.gyro = Some(InertialRecord { timestamp: sample.timestamp, data: sample.gyro });
        }

        if let Some(sample) = baro {
            // On the pad the very first barometric sample becomes the
            // ground reference, before the detector ever sees it.
            if !self.ground_reference_set {
                log::info!(
                    "Ground reference captured: {:.0} Pa, {:.1} °C",
                    sample.pressure_pa,
                    sample.temperature_c
                );
                if let Err(err) = manager.set_ground_reference(sample.pressure_pa, sample.temperature_c) {
                    log::warn!("Ground reference not persisted: {:?}", err);
                }
                self.detector.update_ground_reference(manager.system_config());
                self.ground_reference_set = true;
            }
            container.pressure =
                Some(crate::data::BaroRecord { timestamp: sample.timestamp, value: sample.pressure_pa });
            container.temperature =
                Some(crate::data::BaroRecord { timestamp: sample.timestamp, value: sample.temperature_c });
        }

        let phase = self.detector.feed(&mut container);
        self.dispatch(phase, &mut container, now);

        if let Err(err) = manager.user_data_update(&mut container, now) {
            // Degraded telemetry is preferred over stalling the mission.
            log::warn!("Memory update incomplete: {:?}", err);
        }

        phase
    }

    /// Per-phase action table.
    fn dispatch(&mut self, phase: FlightPhase, container: &mut DataContainer, now: Ticks) {
        match phase {
            FlightPhase::Launchpad | FlightPhase::Exit => {}
            FlightPhase::PreApogee
            | FlightPhase::PostApogee
            | FlightPhase::PostMain
            | FlightPhase::Landed => self.sample_continuity(container, now),
            FlightPhase::Apogee => {
                if !self.drogue_fired {
                    self.fire(RecoveryChannel::Drogue);
                    self.drogue_fired = true;
                }
            }
            FlightPhase::MainChute => {
                if !self.main_fired {
                    self.fire(RecoveryChannel::Main);
                    self.main_fired = true;
                }
            }
        }
    }

    fn fire(&mut self, channel: RecoveryChannel) {
        log::info!("Firing {:?} recovery channel", channel);
        self.recovery.enable(channel);
        self.recovery.activate(channel);
    }

    /// Emits a continuity record only when a channel changed since the
    /// last observation.
    fn sample_continuity(&mut self, container: &mut DataContainer, now: Ticks) {
        let mut changed = false;
        for channel in RecoveryChannel::ALL {
            let current = self.recovery.continuity(channel);
            if current != self.last_continuity[channel as usize] {
                self.last_continuity[channel as usize] = current;
                changed = true;
                log::info!("{:?} continuity changed to {:?}", channel, current);
            }
            if self.recovery.overcurrent(channel) == Overcurrent::Tripped {
                log::warn!("{:?} driver reports overcurrent", channel);
            }
        }
        if changed {
            container.continuity =
                Some(ContinuityRecord { timestamp: now, status: self.last_continuity });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::MemoryConfig;
    use crate::sim::{SimFlash, SimRecovery};

    fn test_memory_config() -> MemoryConfig {
        MemoryConfig {
            user_sector_sizes: [4096; crate::mem::USER_SECTOR_COUNT],
            ..MemoryConfig::default()
        }
    }

    fn manager() -> MemoryManager<SimFlash> {
        let mut manager = MemoryManager::new(SimFlash::new()).unwrap();
        manager.set_memory_config(test_memory_config()).unwrap();
        manager.service_queue();
        manager
    }

    fn imu_at(now: Ticks, acc: [f32; 3], gyro: [f32; 3]) -> ImuSample {
        ImuSample { timestamp: now, acc, gyro }
    }

    #[test]
    fn first_baro_sample_becomes_ground_reference() {
        let mut manager = manager();
        let mut controller =
            FlightController::new(&mut manager, SimRecovery::new(), ApogeeStrategy::SmoothedGradient).unwrap();

        let baro = BaroSample { timestamp: 1, pressure_pa: 99_500.0, temperature_c: 21.0 };
        controller.tick(&mut manager, None, Some(baro), 1);
        assert_eq!(manager.system_config().ground_pressure_pa, 99_500.0);
        assert_eq!(manager.system_config().ground_temperature_c, 21.0);
        // Referenced against the pad, the pad is zero.
        assert!(controller.current_altitude().abs() < 0.5);
    }

    #[test]
    fn drogue_fires_once_during_apogee() {
        let mut manager = manager();
        let mut controller =
            FlightController::new(&mut manager, SimRecovery::new(), ApogeeStrategy::FreeFall).unwrap();

        controller.tick(&mut manager, Some(imu_at(0, [8.0, 0.0, 0.0], [0.0; 3])), None, 0);
        assert_eq!(controller.phase(), FlightPhase::PreApogee);

        // Free fall holds through the whole apogee dwell.
        for ms in 1..1_500u32 {
            controller.tick(&mut manager, Some(imu_at(ms, [0.0; 3], [50.0, 0.0, 0.0])), None, ms);
        }
        assert_eq!(controller.phase(), FlightPhase::PostApogee);
        assert_eq!(controller.recovery.fired(), &[RecoveryChannel::Drogue]);
    }

    #[test]
    fn continuity_change_is_recorded_exactly_once() {
        let mut manager = manager();
        let mut controller =
            FlightController::new(&mut manager, SimRecovery::new(), ApogeeStrategy::SmoothedGradient).unwrap();

        // Into PreApogee, where continuity is being watched.
        controller.tick(&mut manager, Some(imu_at(0, [8.0, 0.0, 0.0], [0.0; 3])), None, 0);

        for ms in 1..10u32 {
            controller.tick(&mut manager, None, None, ms);
        }
        controller.recovery.set_continuity(RecoveryChannel::Drogue, Continuity::Short);
        controller.tick(&mut manager, None, None, 10);
        for ms in 11..20u32 {
            controller.tick(&mut manager, None, None, ms);
        }
        manager.service_queue();

        // Exactly one continuity page: the Open→Short edge at t=10.
        let record: ContinuityRecord =
            manager.last_record(crate::mem::UserSector::Continuity).unwrap().unwrap();
        assert_eq!(record.timestamp, 10);
        assert_eq!(record.status[RecoveryChannel::Drogue as usize], Continuity::Short);
        assert_eq!(record.status[RecoveryChannel::Main as usize], Continuity::Open);
        assert!(manager
            .read_record::<ContinuityRecord>(crate::mem::UserSector::Continuity, 1)
            .is_err());
    }
}
