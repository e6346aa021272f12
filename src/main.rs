//! Main application entry point.
//!
//! Four long-lived tasks share the flight work: two samplers feed the
//! bounded channels, the flight controller consumes them tick by tick, and
//! the memory writer drains full pages to the NOR flash.

#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_main)]

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod board;

#[cfg(all(target_arch = "arm", target_os = "none"))]
panic_custom::define_panic!(|info| {
    log::error!("System panic occured: {}", info);
});

#[cfg(all(target_arch = "arm", target_os = "none"))]
#[rtic::app(
    device = stm32f1::stm32f103,
    dispatchers = [EXTI0, EXTI1, EXTI2, EXTI3],
    peripherals = true,
)]
mod app {
    use rtic_monotonics::systick::prelude::*;
    use rtic_sync::channel::{Receiver, Sender};
    use rtic_sync::make_channel;

    use NorthStarFC::controller::FlightController;
    use NorthStarFC::detector::ApogeeStrategy;
    use NorthStarFC::flash::SpiNorFlash;
    use NorthStarFC::mem::MemoryManager;
    use NorthStarFC::sensors::{BaroSample, ImuSample, SAMPLE_QUEUE_DEPTH};

    use crate::board::{self, FlashSpi, PyroCircuit, Sensors};

    systick_monotonic!(Mono, 1_000);

    /* Sample periods, milliseconds. */
    const IMU_PERIOD_MS: u32 = 10;
    const BARO_PERIOD_MS: u32 = 20;
    const WRITER_PERIOD_MS: u32 = 5;

    type ImuSender = Sender<'static, ImuSample, SAMPLE_QUEUE_DEPTH>;
    type ImuReceiver = Receiver<'static, ImuSample, SAMPLE_QUEUE_DEPTH>;
    type BaroSender = Sender<'static, BaroSample, SAMPLE_QUEUE_DEPTH>;
    type BaroReceiver = Receiver<'static, BaroSample, SAMPLE_QUEUE_DEPTH>;

    #[shared]
    struct Shared {
        manager: MemoryManager<SpiNorFlash<FlashSpi>>,
        /// One SPI bus serves both sensors, so the samplers take turns.
        sensors: Sensors,
    }

    #[local]
    struct Local {
        controller: FlightController<PyroCircuit>,
        imu_tx: ImuSender,
        baro_tx: BaroSender,
        imu_rx: ImuReceiver,
        baro_rx: BaroReceiver,
    }

    /// Board bring-up and task spawn.
    ///
    /// Failures in here are the only fatal ones of the whole firmware;
    /// they park the board on the buzzer pattern.
    #[init]
    fn init(cx: init::Context) -> (Shared, Local) {
        let (core, mut device) = (cx.core, cx.device);

        if NorthStarFC::logger::init().is_err() {
            board::fatal();
        }
        log::info!("Booting flight computer firmware version: [{}]", NorthStarFC::FC_FIRMWARE_VERSION);

        board::clock_init(&mut device.RCC, &mut device.FLASH);
        Mono::start(core.SYST, board::SYSCLK_HZ);

        let spi = FlashSpi::new(device.SPI2, device.GPIOB, &mut device.RCC);
        let Ok(flash) = SpiNorFlash::new(spi) else {
            board::fatal();
        };
        let Ok(mut manager) = MemoryManager::new(flash) else {
            board::fatal();
        };

        let recovery = PyroCircuit::new(device.GPIOA, &mut device.RCC, manager.system_config());
        let Ok(controller) = FlightController::new(&mut manager, recovery, ApogeeStrategy::SmoothedGradient)
        else {
            board::fatal();
        };

        let sensors = Sensors::new(device.SPI1, &mut device.RCC, *manager.system_config());

        let (imu_tx, imu_rx) = make_channel!(ImuSample, SAMPLE_QUEUE_DEPTH);
        let (baro_tx, baro_rx) = make_channel!(BaroSample, SAMPLE_QUEUE_DEPTH);

        imu_sampler::spawn().ok();
        baro_sampler::spawn().ok();
        flight::spawn().ok();
        memory_writer::spawn().ok();

        (
            Shared { manager, sensors },
            Local { controller, imu_tx, baro_tx, imu_rx, baro_rx },
        )
    }

    /// Periodic inertial acquisition into the IMU channel.
    #[task(priority = 5, shared = [sensors], local = [imu_tx])]
    async fn imu_sampler(mut cx: imu_sampler::Context) {
        loop {
            let now = Mono::now().ticks() as u32;
            if let Some(sample) = cx.shared.sensors.lock(|sensors| sensors.read_imu(now)) {
                if cx.local.imu_tx.try_send(sample).is_err() {
                    log::warn!("IMU queue full, sample dropped");
                }
            }
            Mono::delay(IMU_PERIOD_MS.millis()).await;
        }
    }

    /// Periodic barometric acquisition into the baro channel.
    #[task(priority = 5, shared = [sensors], local = [baro_tx])]
    async fn baro_sampler(mut cx: baro_sampler::Context) {
        loop {
            let now = Mono::now().ticks() as u32;
            if let Some(sample) = cx.shared.sensors.lock(|sensors| sensors.read_baro(now)) {
                if cx.local.baro_tx.try_send(sample).is_err() {
                    log::warn!("Baro queue full, sample dropped");
                }
            }
            Mono::delay(BARO_PERIOD_MS.millis()).await;
        }
    }

    /// The flight controller loop.
    #[task(priority = 5, shared = [manager], local = [controller, imu_rx, baro_rx])]
    async fn flight(mut cx: flight::Context) {
        loop {
            let now = Mono::now().ticks() as u32;
            let imu = cx.local.imu_rx.try_recv().ok();
            let baro = cx.local.baro_rx.try_recv().ok();
            cx.shared.manager.lock(|manager| {
                cx.local.controller.tick(manager, imu, baro, now);
            });
            Mono::delay(1.millis()).await;
        }
    }

    /// Writer task: drains queued pages to the flash device.
    #[task(priority = 5, shared = [manager])]
    async fn memory_writer(mut cx: memory_writer::Context) {
        loop {
            cx.shared.manager.lock(|manager| manager.service_queue());
            Mono::delay(WRITER_PERIOD_MS.millis()).await;
        }
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn main() {}
