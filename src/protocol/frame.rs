//! Modbus RTU frame codec
//!
//! Wire format: `[slave_id:1][function_code:1][payload:N][crc16:2 LE]`.
//! The CRC covers everything before it and is transmitted least-significant
//! byte first.

use crate::error::{Result, ServoError};

/// Read Holding Registers
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
/// Write Single Register
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
/// Write Multiple Registers
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Function-code bit marking an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Minimum frame length: slave id + function code + CRC
pub const MIN_FRAME_LEN: usize = 4;

/// CRC16/Modbus: polynomial 0xA001 (reflected 0x8005), initial value 0xFFFF.
///
/// The CRC of empty input is the initial value 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// A Modbus RTU frame without its CRC trailer.
///
/// The CRC is computed on encode and verified on decode rather than stored,
/// so a constructed frame can never carry a stale checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusFrame {
    pub slave_id: u8,
    pub function_code: u8,
    pub payload: Vec<u8>,
}

impl ModbusFrame {
    pub fn new(slave_id: u8, function_code: u8, payload: Vec<u8>) -> Self {
        Self {
            slave_id,
            function_code,
            payload,
        }
    }

    /// Whether this frame carries the device's exception flag.
    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    /// Serialize to wire bytes with the CRC appended.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.payload.len() + 2);
        bytes.push(self.slave_id);
        bytes.push(self.function_code);
        bytes.extend_from_slice(&self.payload);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Parse wire bytes, verifying length and CRC.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(ServoError::communication(format!(
                "frame too short: {} bytes",
                bytes.len()
            )));
        }

        let (body, trailer) = bytes.split_at(bytes.len() - 2);
        let received = u16::from_le_bytes([trailer[0], trailer[1]]);
        let computed = crc16(body);
        if received != computed {
            return Err(ServoError::communication(format!(
                "CRC mismatch: computed {computed:04X}, received {received:04X}"
            )));
        }

        Ok(Self {
            slave_id: body[0],
            function_code: body[1],
            payload: body[2..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_empty_is_initial_value() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_crc16_known_vector() {
        // Canonical request: read 1 holding register at 0x0000 from slave 1.
        // Wire trailer is 84 0A, i.e. CRC value 0x0A84.
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
    }

    #[test]
    fn test_crc16_detects_single_byte_corruption() {
        let frame = [0x01, 0x03, 0x02, 0x00, 0x14];
        let original = crc16(&frame);
        for i in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame;
                corrupted[i] ^= 1 << bit;
                assert_ne!(
                    crc16(&corrupted),
                    original,
                    "flip of byte {i} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn test_encode_appends_crc_lsb_first() {
        let frame = ModbusFrame::new(0x01, 0x03, vec![0x00, 0x00, 0x00, 0x01]);
        assert_eq!(frame.encode(), vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn test_round_trip() {
        let frame = ModbusFrame::new(0x02, 0x10, vec![0x62, 0x00, 0x00, 0x08, 0x10, 0xAA]);
        let decoded = ModbusFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_round_trip_empty_payload() {
        let frame = ModbusFrame::new(0x01, 0x06, vec![]);
        let decoded = ModbusFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.slave_id, 0x01);
        assert_eq!(decoded.function_code, 0x06);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_too_short() {
        let err = ModbusFrame::decode(&[0x01, 0x03, 0x84]).unwrap_err();
        assert!(matches!(err, ServoError::Communication(_)));
    }

    #[test]
    fn test_decode_bad_crc() {
        let mut bytes = ModbusFrame::new(0x01, 0x03, vec![0x02, 0x00, 0x14]).encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = ModbusFrame::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[test]
    fn test_exception_flag() {
        assert!(ModbusFrame::new(1, 0x83, vec![0x02]).is_exception());
        assert!(!ModbusFrame::new(1, 0x03, vec![]).is_exception());
    }
}
