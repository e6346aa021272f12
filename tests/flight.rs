//! Full-mission scenarios against the simulated flash and scripted
//! sensor sources.

use NorthStarFC::cfg::MemoryConfig;
use NorthStarFC::controller::FlightController;
use NorthStarFC::data::{FlightEventRecord, FlightPhase, InertialRecord, RecoveryChannel, Ticks};
use NorthStarFC::detector::{altitude_to_pressure, ApogeeStrategy};
use NorthStarFC::mem::{MemError, MemoryManager, UserSector};
use NorthStarFC::sensors::{BaroSample, ImuSample};
use NorthStarFC::sim::{ScriptedBaro, ScriptedImu, SimFlash, SimRecovery};

/// Controller loop period, milliseconds.
const TICK_MS: u32 = 20;

fn test_memory_config() -> MemoryConfig {
    MemoryConfig {
        // Room for a whole mission at full rate, small enough to keep the
        // searches honest.
        user_sector_sizes: [
            0x1_0000, /* gyro  */
            0x1_0000, /* accel */
            0x4000,   /* mag   */
            0x4000,   /* press */
            0x4000,   /* temp  */
            0x4000,   /* cont  */
            0x4000,   /* event */
        ],
        ..MemoryConfig::default()
    }
}

/// One flight computer plus its scripted environment.
struct Flight {
    manager: MemoryManager<SimFlash>,
    controller: FlightController<SimRecovery>,
    imu: ScriptedImu,
    baro: ScriptedBaro,
    now: Ticks,
}

impl Flight {
    fn new() -> Self {
        let mut manager = MemoryManager::new(SimFlash::new()).unwrap();
        manager.set_memory_config(test_memory_config()).unwrap();
        manager.service_queue();
        Self::with_manager(manager)
    }

    /// Boots a second flight computer on the same flash, as after a power
    /// cycle.
    fn resume(flash: SimFlash, now: Ticks) -> Self {
        let manager = MemoryManager::new(flash).unwrap();
        let mut flight = Self::with_manager(manager);
        flight.now = now;
        flight
    }

    fn with_manager(mut manager: MemoryManager<SimFlash>) -> Self {
        let controller =
            FlightController::new(&mut manager, SimRecovery::new(), ApogeeStrategy::SmoothedGradient)
                .unwrap();
        Self {
            manager,
            controller,
            imu: ScriptedImu::new(),
            baro: ScriptedBaro::new(),
            now: 0,
        }
    }

    /// Advances one controller period: poll, tick, drain the writer.
    fn step(&mut self) -> FlightPhase {
        self.now += TICK_MS;
        let phase = self
            .controller
            .poll(&mut self.manager, &mut self.imu, &mut self.baro, self.now);
        self.manager.service_queue();
        phase
    }

    fn push_altitude(&mut self, altitude_m: f32) {
        self.baro.push(BaroSample {
            timestamp: self.now,
            pressure_pa: altitude_to_pressure(altitude_m),
            temperature_c: 15.0,
        });
    }

    fn push_imu(&mut self, acc: [f32; 3], gyro: [f32; 3]) {
        self.imu.push(ImuSample { timestamp: self.now, acc, gyro });
    }

    fn events(&mut self) -> Vec<FlightEventRecord> {
        let mut events = Vec::new();
        for index in 0.. {
            match self.manager.read_record::<FlightEventRecord>(UserSector::FlightEvent, index) {
                Ok(event) => events.push(event),
                Err(MemError::OutOfRange) => break,
                Err(err) => panic!("flight event read failed: {:?}", err),
            }
        }
        events
    }
}

/// Drives the nominal mission profile up to (excluding) `until` ms.
///
/// Pad hold until 1 s, launch spike at 1 s, then a 100 m/s climb to
/// 1000 m and a 100 m/s descent back to the ground, barometer at 10 Hz,
/// IMU every tick. The airframe stops rotating at 20 s.
fn run_nominal(flight: &mut Flight, until: Ticks, stop_at: Option<FlightPhase>) {
    while flight.now + TICK_MS < until {
        let t = flight.now + TICK_MS; // tick being produced
        if t < 1_000 {
            if t % 100 == 0 {
                flight.push_altitude(0.0);
            }
        } else {
            if t == 1_000 {
                flight.push_imu([7.0, 0.0, 0.0], [10.0, 0.0, 0.0]);
            } else {
                let spinning = t < 20_000;
                let gyro = if spinning { [40.0, 5.0, 5.0] } else { [1.0, 0.0, 0.0] };
                flight.push_imu([1.0, 0.0, 0.0], gyro);
            }
            if t % 100 == 0 && t <= 21_000 {
                let altitude = if t <= 11_000 {
                    (t - 1_000) as f32 / 10.0
                } else {
                    1_000.0 - (t - 11_000) as f32 / 10.0
                };
                flight.push_altitude(altitude);
            }
        }
        let phase = flight.step();
        if stop_at == Some(phase) {
            return;
        }
    }
}

#[test]
fn nominal_flight_records_all_seven_events() {
    let mut flight = Flight::new();
    run_nominal(&mut flight, 24_000, None);

    assert_eq!(flight.controller.phase(), FlightPhase::Exit);

    let events = flight.events();
    let phases: Vec<FlightPhase> = events.iter().map(|e| e.phase).collect();
    assert_eq!(
        phases,
        [
            FlightPhase::PreApogee,
            FlightPhase::Apogee,
            FlightPhase::PostApogee,
            FlightPhase::MainChute,
            FlightPhase::PostMain,
            FlightPhase::Landed,
            FlightPhase::Exit,
        ]
    );

    // Event timestamps follow the mission order.
    for pair in events.windows(2) {
        assert!(pair[1].timestamp >= pair[0].timestamp);
    }

    // Both channels fired, drogue first.
    assert_eq!(
        flight.controller.recovery().fired(),
        &[RecoveryChannel::Drogue, RecoveryChannel::Main]
    );

    // The gyro stream kept its timestamps in order on flash.
    let mut previous = 0;
    for index in 0.. {
        match flight.manager.read_record::<InertialRecord>(UserSector::Gyro, index) {
            Ok(record) => {
                assert!(record.timestamp >= previous);
                previous = record.timestamp;
            }
            Err(_) => break,
        }
    }
}

#[test]
fn mid_flight_reboot_resumes_in_post_apogee() {
    let mut flight = Flight::new();
    run_nominal(&mut flight, 24_000, Some(FlightPhase::PostApogee));
    assert_eq!(flight.controller.phase(), FlightPhase::PostApogee);

    let ground_pressure = flight.manager.system_config().ground_pressure_pa;
    let reboot_at = flight.now;
    let altitude_at_reboot = flight.controller.current_altitude();

    // Power cycle: RAM is gone, flash survives.
    let flash = flight.manager.release();
    let mut flight = Flight::resume(flash, reboot_at);

    assert_eq!(flight.controller.phase(), FlightPhase::PostApogee);
    assert_eq!(flight.manager.system_config().ground_pressure_pa, ground_pressure);

    // The descent continues; the main-chute threshold must still fire.
    let mut altitude = altitude_at_reboot;
    for _ in 0..600 {
        flight.push_altitude(altitude);
        altitude -= 2.0;
        flight.step();
        if flight.controller.phase() >= FlightPhase::MainChute {
            break;
        }
    }
    assert!(flight.controller.phase() >= FlightPhase::MainChute);
}

#[test]
fn gyro_sector_overflow_stays_contained() {
    let mut manager = MemoryManager::new(SimFlash::new()).unwrap();
    manager
        .set_memory_config(MemoryConfig {
            user_sector_sizes: [512, 0x4000, 0x4000, 0x4000, 0x4000, 0x4000, 0x4000],
            ..MemoryConfig::default()
        })
        .unwrap();
    manager.service_queue();
    let mut controller =
        FlightController::new(&mut manager, SimRecovery::new(), ApogeeStrategy::SmoothedGradient)
            .unwrap();

    // 64 IMU ticks are four gyro pages; the 512-byte budget holds two.
    for i in 0..64u32 {
        let sample = ImuSample { timestamp: i, acc: [1.0, 0.0, 0.0], gyro: [2.0, 0.0, 0.0] };
        controller.tick(&mut manager, Some(sample), None, i);
        manager.service_queue();
    }

    let gyro = manager.sector_info(UserSector::Gyro);
    assert_eq!(gyro.bytes_written, 512);

    // The accel stream lives right behind the gyro sector and kept all
    // four of its pages.
    let accel = manager.sector_info(UserSector::Accel);
    assert_eq!(accel.start_address, gyro.end_address);
    assert_eq!(accel.bytes_written, 1024);
    let last_accel: InertialRecord = manager.read_record(UserSector::Accel, 63).unwrap();
    assert_eq!(last_accel.timestamp, 63);

    // Gyro reads past the cap fail instead of walking into the neighbour.
    assert!(matches!(
        manager.read_record::<InertialRecord>(UserSector::Gyro, 32),
        Err(MemError::OutOfRange)
    ));
}

/// Linear congruential generator driving the noise of the apogee test;
/// twelve summed uniforms approximate one gaussian draw.
struct Lcg(u64);

impl Lcg {
    fn uniform(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 40) as f32 / (1u64 << 24) as f32
    }

    fn gaussian(&mut self, sigma: f32) -> f32 {
        let sum: f32 = (0..12).map(|_| self.uniform()).sum();
        (sum - 6.0) * sigma
    }
}

#[test]
fn noisy_sine_produces_exactly_one_apogee() {
    let mut flight = Flight::new();
    // Straight into PreApogee via the launch spike.
    flight.push_imu([8.0, 0.0, 0.0], [0.0; 3]);
    flight.step();
    assert_eq!(flight.controller.phase(), FlightPhase::PreApogee);

    let mut rng = Lcg(0x5EED);
    let start = flight.now;
    let mut apogee_at = None;

    // 20 s of h(t) = 500 sin(pi t / 10) plus sigma = 2 m of noise, 50 Hz.
    while flight.now - start < 20_000 {
        let t = (flight.now - start) as f32 / 1_000.0;
        let clean = 500.0 * (core::f32::consts::PI * t / 10.0).sin();
        flight.push_altitude(clean + rng.gaussian(2.0));
        flight.step();
        if apogee_at.is_none() && flight.controller.phase() >= FlightPhase::Apogee {
            apogee_at = Some(t);
        }
    }

    let events = flight.events();
    let apogee_events = events.iter().filter(|e| e.phase == FlightPhase::Apogee).count();
    assert_eq!(apogee_events, 1);

    // The smoothed gradient flips sign a little after the physical peak.
    let apogee_at = apogee_at.expect("apogee never detected");
    assert!(apogee_at > 5.0 && apogee_at < 8.0, "apogee at t = {apogee_at}");
}

#[test]
fn configuration_round_trips_through_power_cycle() {
    let mut manager = MemoryManager::new(SimFlash::new()).unwrap();
    let mut flight_config = *manager.system_config();
    flight_config.ground_pressure_pa = 99_500.0;
    manager.set_system_config(flight_config).unwrap();
    manager.service_queue();

    let mut manager = MemoryManager::new(manager.release()).unwrap();
    assert_eq!(*manager.system_config(), flight_config);
    assert_eq!(manager.system_config().ground_pressure_pa, 99_500.0);
    let _ = &mut manager;
}
