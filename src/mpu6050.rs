use std::thread::sleep;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError,
                      deadline_exceeded_error, internal_error,
                      invalid_argument_error, unavailable_error};
use log::{debug, info, warn};
use rppal::i2c::I2c;

use crate::imu_transport::{ImuTransport, RawSample, MAX_BLOCK_READ};

// InvenSense MPU-6050 register map (subset).
const WHO_AM_I: u8 = 0x75;
const PWR_MGMT_1: u8 = 0x6B;
const SMPLRT_DIV: u8 = 0x19;
const CONFIG: u8 = 0x1A;
const GYRO_CONFIG: u8 = 0x1B;
const ACCEL_CONFIG: u8 = 0x1C;
const INT_STATUS: u8 = 0x3A;
const ACCEL_XOUT_H: u8 = 0x3B;  // 14 bytes: accel, temp, gyro; big-endian.

const EXPECTED_WHO_AM_I: u8 = 0x68;
const DATA_RDY_INT: u8 = 0x01;

const DATA_READY_DEADLINE: Duration = Duration::from_millis(20);

pub struct Mpu6050 {
    i2c: I2c,
}

impl Mpu6050 {
    pub fn new(bus: u8, addr: u16) -> Result<Self, CanonicalError> {
        let mut i2c = I2c::with_bus(bus)
            .map_err(|e| unavailable_error(
                &format!("Failed to open I2C bus {}: {:?}", bus, e)))?;
        i2c.set_slave_address(addr)
            .map_err(|e| invalid_argument_error(
                &format!("Failed to set I2C address 0x{:02X}: {:?}", addr, e)))?;

        let mut mpu = Mpu6050{i2c};
        mpu.init_device()?;
        info!("MPU-6050 initialized: bus={} addr=0x{:02X}", bus, addr);
        Ok(mpu)
    }

    fn init_device(&mut self) -> Result<(), CanonicalError> {
        let who_am_i = self.read_byte(WHO_AM_I)?;
        if who_am_i == EXPECTED_WHO_AM_I {
            info!("WHO_AM_I=0x{:02X} OK", who_am_i);
        } else {
            warn!("WHO_AM_I=0x{:02X} (expected 0x{:02X}); continuing",
                  who_am_i, EXPECTED_WHO_AM_I);
        }

        // Device reset for a clean state, then wake with the X-gyro as the
        // clock source.
        self.write_byte(PWR_MGMT_1, 0x80)?;
        sleep(Duration::from_millis(100));
        self.write_byte(PWR_MGMT_1, 0x01)?;
        sleep(Duration::from_millis(10));

        // 1 kHz / (19 + 1) = 50 Hz sample rate.
        self.write_byte(SMPLRT_DIV, 19)?;
        // DLPF ~44 Hz bandwidth.
        self.write_byte(CONFIG, 0x03)?;
        // Gyro ±250 dps, accel ±2 g.
        self.write_byte(GYRO_CONFIG, 0x00)?;
        self.write_byte(ACCEL_CONFIG, 0x00)?;
        Ok(())
    }
}

impl ImuTransport for Mpu6050 {
    fn read_byte(&mut self, reg: u8) -> Result<u8, CanonicalError> {
        let mut buffer = [0u8; 1];
        self.i2c.write_read(&[reg], &mut buffer)
            .map_err(|e| internal_error(
                &format!("I2C read of reg 0x{:02X} failed: {:?}", reg, e)))?;
        Ok(buffer[0])
    }

    fn read_block(&mut self, reg: u8, len: usize) -> Result<Vec<u8>, CanonicalError> {
        if len > MAX_BLOCK_READ {
            return Err(invalid_argument_error(
                &format!("Block read of {} bytes exceeds {}", len, MAX_BLOCK_READ)));
        }
        let mut block = Vec::with_capacity(len);
        for i in 0..len {
            block.push(self.read_byte(reg.wrapping_add(i as u8))?);
        }
        Ok(block)
    }

    fn write_byte(&mut self, reg: u8, value: u8) -> Result<(), CanonicalError> {
        self.i2c.write(&[reg, value])
            .map_err(|e| internal_error(
                &format!("I2C write of reg 0x{:02X} failed: {:?}", reg, e)))?;
        Ok(())
    }

    fn read_all_axes(&mut self) -> Result<RawSample, CanonicalError> {
        let deadline = Instant::now() + DATA_READY_DEADLINE;
        loop {
            let status = self.read_byte(INT_STATUS)?;
            if status & DATA_RDY_INT != 0 {
                break;
            }
            if Instant::now() >= deadline {
                return Err(deadline_exceeded_error(
                    &format!("IMU data not ready (INT_STATUS=0x{:02X})", status)));
            }
        }
        let block = self.read_block(ACCEL_XOUT_H, 14)?;
        // Big-endian per axis; bytes 6..8 are the temperature, skipped.
        let word = |i: usize| i16::from_be_bytes([block[i], block[i + 1]]) as i32;
        let sample = RawSample{
            ax: word(0), ay: word(2), az: word(4),
            gx: word(8), gy: word(10), gz: word(12),
        };
        debug!("MPU sample: {:?}", sample);
        Ok(sample)
    }

    fn model(&self) -> &'static str {
        "MPU-6050"
    }
}
