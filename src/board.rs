//! Flight board bring-up: clock tree, the SPI bus to the NOR flash, the
//! recovery GPIO block and the sensor front-end.
//!
//! Everything in here is specific to the STM32F103 flight board revision;
//! the library above only ever sees the `embedded-hal` traits and the
//! sample/recovery seams.

use embedded_hal::spi::{Operation, SpiDevice};
use stm32f1::stm32f103::{FLASH, GPIOA, GPIOB, RCC, SPI1, SPI2};

use NorthStarFC::cfg::FlightConfig;
use NorthStarFC::controller::RecoveryCircuit;
use NorthStarFC::data::{Continuity, Overcurrent, RecoveryChannel, Ticks};
use NorthStarFC::sensors::{accel_raw_to_g, gyro_raw_to_deg_s, BaroSample, ImuSample};

/// Core clock after [`clock_init`], Hz.
pub const SYSCLK_HZ: u32 = 72_000_000;

/// Brings the clock tree to 72 MHz off the 8 MHz crystal.
pub fn clock_init(rcc: &mut RCC, flash: &mut FLASH) {
    rcc.cr.modify(|_, w| w.hseon().set_bit());
    while rcc.cr.read().hserdy().bit_is_clear() {}

    // Two wait states are required above 48 MHz.
    flash.acr.modify(|_, w| w.latency().ws2());

    rcc.cfgr.modify(|_, w| {
        w.pllsrc().hse_div_prediv() /* 8 MHz crystal           */
            .pllmul().mul9()        /* x9 -> 72 MHz            */
            .hpre().div1()
            .ppre1().div2()         /* APB1 is capped at 36 MHz */
            .ppre2().div1()
    });

    rcc.cr.modify(|_, w| w.pllon().set_bit());
    while rcc.cr.read().pllrdy().bit_is_clear() {}

    rcc.cfgr.modify(|_, w| w.sw().pll());
    while !rcc.cfgr.read().sws().is_pll() {}
}

/// Fatal-error handler: distinct buzzer pattern, then parked forever.
///
/// Only unrecoverable bring-up failures end here; everything after init
/// degrades instead of halting.
pub fn fatal() -> ! {
    let gpiob = unsafe { &*GPIOB::ptr() };
    gpiob.crl.modify(|_, w| w.mode5().output().cnf5().push_pull());
    loop {
        for _ in 0..3 {
            gpiob.bsrr.write(|w| w.bs5().set_bit());
            cortex_m::asm::delay(SYSCLK_HZ / 10);
            gpiob.bsrr.write(|w| w.br5().set_bit());
            cortex_m::asm::delay(SYSCLK_HZ / 10);
        }
        cortex_m::asm::delay(SYSCLK_HZ);
    }
}

#[derive(Debug)]
pub struct SpiBusError;

impl embedded_hal::spi::Error for SpiBusError {
    fn kind(&self) -> embedded_hal::spi::ErrorKind {
        embedded_hal::spi::ErrorKind::Other
    }
}

/// SPI2 wired to the NOR flash, chip select on PB12.
pub struct FlashSpi {
    spi: SPI2,
    gpiob: GPIOB,
}

impl FlashSpi {
    pub fn new(spi: SPI2, gpiob: GPIOB, rcc: &mut RCC) -> Self {
        rcc.apb1enr.modify(|_, w| w.spi2en().set_bit());
        rcc.apb2enr.modify(|_, w| w.iopben().set_bit());

        /* PB12 CS, PB13 SCK, PB15 MOSI outputs; PB14 MISO floating input. */
        gpiob.crh.modify(|_, w| {
            w.mode12().output().cnf12().push_pull()
                .mode13().output50().cnf13().alt_push_pull()
                .mode14().input().cnf14().open_drain()
                .mode15().output50().cnf15().alt_push_pull()
        });
        gpiob.bsrr.write(|w| w.bs12().set_bit());

        /* Mode 0 master, APB1/4 = 9 MHz, software slave management. */
        spi.cr1.modify(|_, w| {
            w.mstr().set_bit()
                .br().div4()
                .cpol().clear_bit()
                .cpha().clear_bit()
                .ssm().set_bit()
                .ssi().set_bit()
                .spe().set_bit()
        });

        Self { spi, gpiob }
    }

    fn select(&mut self) {
        self.gpiob.bsrr.write(|w| w.br12().set_bit());
    }

    fn deselect(&mut self) {
        while self.spi.sr.read().bsy().bit_is_set() {}
        self.gpiob.bsrr.write(|w| w.bs12().set_bit());
    }

    fn transfer_byte(&mut self, byte: u8) -> u8 {
        while self.spi.sr.read().txe().bit_is_clear() {}
        self.spi.dr.write(|w| w.dr().bits(byte as u16));
        while self.spi.sr.read().rxne().bit_is_clear() {}
        self.spi.dr.read().dr().bits() as u8
    }
}

impl embedded_hal::spi::ErrorType for FlashSpi {
    type Error = SpiBusError;
}

impl SpiDevice<u8> for FlashSpi {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), SpiBusError> {
        self.select();
        for operation in operations.iter_mut() {
            match operation {
                Operation::Write(bytes) => {
                    for byte in bytes.iter() {
                        self.transfer_byte(*byte);
                    }
                }
                Operation::Read(buf) => {
                    for slot in buf.iter_mut() {
                        *slot = self.transfer_byte(0x00);
                    }
                }
                Operation::Transfer(read, write) => {
                    for (slot, byte) in read.iter_mut().zip(write.iter()) {
                        *slot = self.transfer_byte(*byte);
                    }
                }
                Operation::TransferInPlace(buf) => {
                    for slot in buf.iter_mut() {
                        *slot = self.transfer_byte(*slot);
                    }
                }
                Operation::DelayNs(ns) => {
                    cortex_m::asm::delay(*ns / 14 + 1);
                }
            }
        }
        self.deselect();
        Ok(())
    }
}

/* Recovery pin map: PA1/PA2 drogue enable+activate, PA3/PA4 main,
 * PA5/PA6 continuity inputs, PA7/PA8 overcurrent inputs. Enables are
 * active low, activates are active high. */
pub struct PyroCircuit {
    gpioa: GPIOA,
    hold_ticks: u32,
}

impl PyroCircuit {
    pub fn new(gpioa: GPIOA, rcc: &mut RCC, config: &FlightConfig) -> Self {
        rcc.apb2enr.modify(|_, w| w.iopaen().set_bit());

        gpioa.crl.modify(|_, w| {
            w.mode1().output().cnf1().push_pull()
                .mode2().output().cnf2().push_pull()
                .mode3().output().cnf3().push_pull()
                .mode4().output().cnf4().push_pull()
                .mode5().input().cnf5().open_drain()
                .mode6().input().cnf6().open_drain()
                .mode7().input().cnf7().open_drain()
        });
        gpioa.crh.modify(|_, w| w.mode8().input().cnf8().open_drain());

        /* Safe defaults: drivers disabled, drive lines idle. */
        gpioa.bsrr.write(|w| w.bs1().set_bit().bs3().set_bit().br2().set_bit().br4().set_bit());

        Self {
            gpioa,
            hold_ticks: config.e_match_active_ms as u32 * (SYSCLK_HZ / 1_000),
        }
    }

    fn enable_pin(&self, channel: RecoveryChannel, active: bool) {
        match (channel, active) {
            /* Active low. */
            (RecoveryChannel::Drogue, true) => self.gpioa.bsrr.write(|w| w.br1().set_bit()),
            (RecoveryChannel::Drogue, false) => self.gpioa.bsrr.write(|w| w.bs1().set_bit()),
            (RecoveryChannel::Main, true) => self.gpioa.bsrr.write(|w| w.br3().set_bit()),
            (RecoveryChannel::Main, false) => self.gpioa.bsrr.write(|w| w.bs3().set_bit()),
        }
    }

    fn drive_pin(&self, channel: RecoveryChannel, active: bool) {
        match (channel, active) {
            (RecoveryChannel::Drogue, true) => self.gpioa.bsrr.write(|w| w.bs2().set_bit()),
            (RecoveryChannel::Drogue, false) => self.gpioa.bsrr.write(|w| w.br2().set_bit()),
            (RecoveryChannel::Main, true) => self.gpioa.bsrr.write(|w| w.bs4().set_bit()),
            (RecoveryChannel::Main, false) => self.gpioa.bsrr.write(|w| w.br4().set_bit()),
        }
    }
}

impl RecoveryCircuit for PyroCircuit {
    fn enable(&mut self, channel: RecoveryChannel) {
        self.enable_pin(channel, true);
    }

    fn activate(&mut self, channel: RecoveryChannel) {
        /* Drive low first in case a fault latched the line. */
        self.drive_pin(channel, false);
        self.drive_pin(channel, true);
        cortex_m::asm::delay(self.hold_ticks);
        self.drive_pin(channel, false);
        /* The driver must be re-enabled before the next firing. */
        self.enable_pin(channel, false);
    }

    fn continuity(&mut self, channel: RecoveryChannel) -> Continuity {
        let set = match channel {
            RecoveryChannel::Drogue => self.gpioa.idr.read().idr5().bit_is_set(),
            RecoveryChannel::Main => self.gpioa.idr.read().idr6().bit_is_set(),
        };
        if set { Continuity::Short } else { Continuity::Open }
    }

    fn overcurrent(&mut self, channel: RecoveryChannel) -> Overcurrent {
        let set = match channel {
            RecoveryChannel::Drogue => self.gpioa.idr.read().idr7().bit_is_set(),
            RecoveryChannel::Main => self.gpioa.idr.read().idr8().bit_is_set(),
        };
        if set { Overcurrent::Clear } else { Overcurrent::Tripped }
    }
}

/* BMI088 / BMP388 data registers read by the front-end. */
const ACCEL_DATA_REG: u8 = 0x12;
const GYRO_DATA_REG: u8 = 0x02;
const BARO_DATA_REG: u8 = 0x04;
const READ_FLAG: u8 = 0x80;

/// Sensor front-end on SPI1, with the IMU pair and the barometer behind
/// separate selects (PB0 accel, PB1 gyro, PB10 baro): raw data-register
/// reads plus unit conversion when the configuration asks for it.
pub struct Sensors {
    spi: SPI1,
    gpiob: &'static stm32f1::stm32f103::gpiob::RegisterBlock,
    config: FlightConfig,
}

impl Sensors {
    pub fn new(spi: SPI1, rcc: &mut RCC, config: FlightConfig) -> Self {
        rcc.apb2enr.modify(|_, w| w.spi1en().set_bit().iopben().set_bit());
        let gpiob = unsafe { &*GPIOB::ptr() };

        gpiob.crl.modify(|_, w| {
            w.mode0().output().cnf0().push_pull()
                .mode1().output().cnf1().push_pull()
        });
        gpiob.crh.modify(|_, w| w.mode10().output().cnf10().push_pull());
        gpiob.bsrr.write(|w| w.bs0().set_bit().bs1().set_bit().bs10().set_bit());

        spi.cr1.modify(|_, w| {
            w.mstr().set_bit()
                .br().div8()
                .ssm().set_bit()
                .ssi().set_bit()
                .spe().set_bit()
        });

        Self { spi, gpiob, config }
    }

    fn transfer_byte(&mut self, byte: u8) -> u8 {
        while self.spi.sr.read().txe().bit_is_clear() {}
        self.spi.dr.write(|w| w.dr().bits(byte as u16));
        while self.spi.sr.read().rxne().bit_is_clear() {}
        self.spi.dr.read().dr().bits() as u8
    }

    fn read_burst(&mut self, select: usize, register: u8, buf: &mut [u8]) {
        match select {
            0 => self.gpiob.bsrr.write(|w| w.br0().set_bit()),
            1 => self.gpiob.bsrr.write(|w| w.br1().set_bit()),
            _ => self.gpiob.bsrr.write(|w| w.br10().set_bit()),
        }
        self.transfer_byte(register | READ_FLAG);
        for slot in buf.iter_mut() {
            *slot = self.transfer_byte(0x00);
        }
        while self.spi.sr.read().bsy().bit_is_set() {}
        match select {
            0 => self.gpiob.bsrr.write(|w| w.bs0().set_bit()),
            1 => self.gpiob.bsrr.write(|w| w.bs1().set_bit()),
            _ => self.gpiob.bsrr.write(|w| w.bs10().set_bit()),
        }
    }

    /// Reads one fused IMU sample.
    pub fn read_imu(&mut self, now: Ticks) -> Option<ImuSample> {
        /* The accelerometer prepends one dummy byte in SPI reads. */
        let mut accel = [0u8; 7];
        self.read_burst(0, ACCEL_DATA_REG, &mut accel);
        let mut gyro = [0u8; 6];
        self.read_burst(1, GYRO_DATA_REG, &mut gyro);

        let word = |lo: u8, hi: u8| i16::from_le_bytes([lo, hi]);
        let raw_acc = [word(accel[1], accel[2]), word(accel[3], accel[4]), word(accel[5], accel[6])];
        let raw_rate = [word(gyro[0], gyro[1]), word(gyro[2], gyro[3]), word(gyro[4], gyro[5])];

        let mut acc = raw_acc.map(|v| v as f32);
        let mut rate = raw_rate.map(|v| v as f32);
        if self.config.imu_needs_conversion {
            acc = raw_acc.map(|v| accel_raw_to_g(v, self.config.imu.accel_range));
            rate = raw_rate.map(|v| gyro_raw_to_deg_s(v, self.config.imu.gyro_range));
        }
        Some(ImuSample { timestamp: now, acc, gyro: rate })
    }

    /// Reads one barometric sample.
    pub fn read_baro(&mut self, now: Ticks) -> Option<BaroSample> {
        let mut data = [0u8; 6];
        self.read_burst(2, BARO_DATA_REG, &mut data);
        let raw_pressure = u32::from_le_bytes([data[0], data[1], data[2], 0]);
        let raw_temperature = u32::from_le_bytes([data[3], data[4], data[5], 0]);

        if !self.config.baro_needs_conversion {
            return Some(BaroSample {
                timestamp: now,
                pressure_pa: raw_pressure as f32,
                temperature_c: raw_temperature as f32,
            });
        }
        // TODO: apply the trimming coefficients from NVM registers
        // 0x31..0x45; the linear scaling below is bring-up accuracy only.
        Some(BaroSample {
            timestamp: now,
            pressure_pa: raw_pressure as f32 / 64.0,
            temperature_c: raw_temperature as f32 / 1_048_576.0 + 15.0,
        })
    }
}
