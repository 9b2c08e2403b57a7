//! Frame decoding for the DHT20 (AHT20-compatible) I2C humidity sensor.

pub const I2C_ADDRESS: u8 = 0x38;
pub const TRIGGER_MEASUREMENT: [u8; 3] = [0xAC, 0x33, 0x00];
/// Calibration registers restored after power-up.
pub const RESET_REGISTERS: [u8; 3] = [0x1B, 0x1C, 0x1E];
/// Conversion time after a trigger.
pub const MEASUREMENT_DELAY_MS: u64 = 80;

const STATUS_BUSY: u8 = 0x80;
const STATUS_READY: u8 = 0x18;

pub fn needs_register_reset(status: u8) -> bool {
    status & STATUS_READY != STATUS_READY
}

/// Write-back command for `register` built from its 3-byte readback.
pub fn register_restore(register: u8, readback: &[u8; 3]) -> [u8; 3] {
    [0xB0 | register, readback[1], readback[2]]
}

/// Temperature (°C) and relative humidity (%) from a 7-byte measurement
/// frame, or `None` when the sensor was busy or the CRC does not match.
pub fn decode(frame: &[u8; 7]) -> Option<(f32, f32)> {
    if frame[0] & STATUS_BUSY != 0 || crc8(&frame[..6]) != frame[6] {
        return None;
    }

    let raw_humidity =
        (u32::from(frame[1]) << 12) | (u32::from(frame[2]) << 4) | (u32::from(frame[3]) >> 4);
    let raw_temperature =
        ((u32::from(frame[3]) & 0x0F) << 16) | (u32::from(frame[4]) << 8) | u32::from(frame[5]);

    let scale = (1_u32 << 20) as f32;
    let humidity = raw_humidity as f32 / scale * 100.0;
    let temperature_c = raw_temperature as f32 / scale * 200.0 - 50.0;
    Some((temperature_c, humidity))
}

// CRC-8, polynomial 0x31, init 0xFF.
fn crc8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0xFF_u8, |mut crc, byte| {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
        crc
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(status: u8, humidity: u32, temperature: u32) -> [u8; 7] {
        let mut frame = [
            status,
            (humidity >> 12) as u8,
            (humidity >> 4) as u8,
            (((humidity & 0x0F) << 4) | ((temperature >> 16) & 0x0F)) as u8,
            (temperature >> 8) as u8,
            temperature as u8,
            0,
        ];
        frame[6] = crc8(&frame[..6]);
        frame
    }

    #[test]
    fn decodes_a_valid_frame() {
        // 50 %RH and 25 °C.
        let (temperature, humidity) = decode(&frame(0x1C, 1 << 19, 0x60000)).unwrap();

        assert!((humidity - 50.0).abs() < 0.01);
        assert!((temperature - 25.0).abs() < 0.01);
    }

    #[test]
    fn rejects_busy_and_corrupt_frames() {
        assert_eq!(decode(&frame(0x9C, 1 << 19, 0x60000)), None);

        let mut corrupt = frame(0x1C, 1 << 19, 0x60000);
        corrupt[2] ^= 0x01;
        assert_eq!(decode(&corrupt), None);
    }

    #[test]
    fn register_reset_only_without_both_ready_bits() {
        assert!(!needs_register_reset(0x18));
        assert!(!needs_register_reset(0x1C));
        assert!(needs_register_reset(0x08));
        assert!(needs_register_reset(0x10));
        assert!(needs_register_reset(0x00));
    }

    #[test]
    fn restore_command_echoes_the_readback() {
        assert_eq!(
            register_restore(0x1C, &[0x1C, 0x47, 0x9A]),
            [0xBC, 0x47, 0x9A]
        );
    }

    #[test]
    fn crc_matches_the_datasheet_example() {
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
    }
}
