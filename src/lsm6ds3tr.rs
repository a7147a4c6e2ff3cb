use std::time::{Duration, Instant};

use canonical_error::{CanonicalError,
                      deadline_exceeded_error, internal_error,
                      invalid_argument_error, unavailable_error};
use log::{debug, info, warn};
use rppal::i2c::I2c;

use crate::imu_transport::{ImuTransport, RawSample, MAX_BLOCK_READ};

// ST LSM6DS3TR-C register map (subset).
const WHO_AM_I: u8 = 0x0F;
const CTRL1_XL: u8 = 0x10;
const CTRL2_G: u8 = 0x11;
const CTRL3_C: u8 = 0x12;
const CTRL10_C: u8 = 0x19;
const FIFO_CTRL5: u8 = 0x0A;
const INT1_CTRL: u8 = 0x0D;
const INT2_CTRL: u8 = 0x0E;
const TAP_CFG: u8 = 0x58;
const STATUS_REG: u8 = 0x1E;
const OUTX_L_G: u8 = 0x22;  // 12-byte gyro+accel block starts here.

const EXPECTED_WHO_AM_I: u8 = 0x69;

// CTRL3_C bits.
const BDU_BIT: u8 = 0x40;
const IF_INC_BIT: u8 = 0x04;

// STATUS_REG bits.
const STATUS_XLDA: u8 = 0x01;
const STATUS_GDA: u8 = 0x02;

// 52 Hz ODR, full scale ±2g / ±245 dps.
const CTRL1_XL_52HZ_2G: u8 = 0x30;
const CTRL2_G_52HZ_245DPS: u8 = 0x30;

// How long read_all_axes() waits for both data-ready flags.
const DATA_READY_DEADLINE: Duration = Duration::from_millis(20);

pub struct Lsm6ds3tr {
    i2c: I2c,
}

impl Lsm6ds3tr {
    // Opens the given I2C bus and runs the deterministic init sequence.
    // A WHO_AM_I mismatch is logged but not fatal, to aid bring-up.
    pub fn new(bus: u8, addr: u16) -> Result<Self, CanonicalError> {
        let mut i2c = I2c::with_bus(bus)
            .map_err(|e| unavailable_error(
                &format!("Failed to open I2C bus {}: {:?}", bus, e)))?;
        i2c.set_slave_address(addr)
            .map_err(|e| invalid_argument_error(
                &format!("Failed to set I2C address 0x{:02X}: {:?}", addr, e)))?;

        let mut imu = Lsm6ds3tr{i2c};
        imu.init_device()?;
        info!("LSM6DS3TR-C initialized: bus={} addr=0x{:02X}", bus, addr);
        Ok(imu)
    }

    fn init_device(&mut self) -> Result<(), CanonicalError> {
        let who_am_i = self.read_byte(WHO_AM_I)?;
        if who_am_i == EXPECTED_WHO_AM_I {
            info!("WHO_AM_I=0x{:02X} OK", who_am_i);
        } else {
            warn!("WHO_AM_I=0x{:02X} (expected 0x{:02X}); continuing",
                  who_am_i, EXPECTED_WHO_AM_I);
        }

        // No read-modify-write on the critical control bits: each register
        // gets one deterministic value.
        self.write_byte(CTRL3_C, BDU_BIT | IF_INC_BIT)?;
        // Setting a nonzero ODR also takes the part out of power-down.
        self.write_byte(CTRL1_XL, CTRL1_XL_52HZ_2G)?;
        self.write_byte(CTRL2_G, CTRL2_G_52HZ_245DPS)?;
        // Embedded functions (pedometer, tilt, timestamp) off.
        self.write_byte(CTRL10_C, 0x00)?;
        self.write_byte(TAP_CFG, 0x00)?;
        // FIFO bypass; no interrupts routed.
        self.write_byte(FIFO_CTRL5, 0x00)?;
        self.write_byte(INT1_CTRL, 0x00)?;
        self.write_byte(INT2_CTRL, 0x00)?;
        Ok(())
    }
}

impl ImuTransport for Lsm6ds3tr {
    fn read_byte(&mut self, reg: u8) -> Result<u8, CanonicalError> {
        let mut buffer = [0u8; 1];
        self.i2c.write_read(&[reg], &mut buffer)
            .map_err(|e| internal_error(
                &format!("I2C read of reg 0x{:02X} failed: {:?}", reg, e)))?;
        Ok(buffer[0])
    }

    // Byte-by-byte with repeated register addressing. The part's
    // auto-increment does not reliably refresh the gyro-status latch, so
    // bursts are avoided.
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
        // Both accel and gyro must report fresh data before the block read;
        // BDU then keeps the block coherent across the update boundary.
        let deadline = Instant::now() + DATA_READY_DEADLINE;
        loop {
            let status = self.read_byte(STATUS_REG)?;
            if status & (STATUS_XLDA | STATUS_GDA) == (STATUS_XLDA | STATUS_GDA) {
                break;
            }
            if Instant::now() >= deadline {
                return Err(deadline_exceeded_error(
                    &format!("IMU data not ready (STATUS=0x{:02X})", status)));
            }
        }
        let block = self.read_block(OUTX_L_G, 12)?;
        // Little-endian, gyro first: [GX, GY, GZ, AX, AY, AZ].
        let word = |i: usize| i16::from_le_bytes([block[i], block[i + 1]]) as i32;
        let sample = RawSample{
            gx: word(0), gy: word(2), gz: word(4),
            ax: word(6), ay: word(8), az: word(10),
        };
        debug!("LSM6 sample: {:?}", sample);
        Ok(sample)
    }

    fn model(&self) -> &'static str {
        "LSM6DS3TR-C"
    }
}
