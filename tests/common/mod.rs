//! Byte-level servo drive simulator
//!
//! Implements the transport trait and answers Modbus RTU requests from an
//! in-memory register space, so driver tests exercise the full stack down
//! to wire bytes. Faults are injectable per address (exception responses)
//! or per request (swallowed requests that read back as timeouts).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use servolink::protocol::{crc16, ModbusFrame};
use servolink::registers::NO_ALARM_SENTINEL;
use servolink::{ByteTransport, Result, ServoError};

const FC_READ: u8 = 0x03;
const FC_WRITE_SINGLE: u8 = 0x06;
const FC_WRITE_MULTIPLE: u8 = 0x10;

#[derive(Default)]
struct SimState {
    registers: HashMap<u16, u16>,
    exceptions: HashMap<u16, u8>,
    swallow_requests: u32,
    requests: u32,
}

/// Inspection and fault-injection handle shared with the test body after
/// the driver takes ownership of the transport.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    pub fn set_register(&self, address: u16, value: u16) {
        self.state.lock().unwrap().registers.insert(address, value);
    }

    pub fn set_dword(&self, address: u16, value: i32) {
        let raw = value as u32;
        let mut state = self.state.lock().unwrap();
        state.registers.insert(address, raw as u16);
        state.registers.insert(address + 1, (raw >> 16) as u16);
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.state.lock().unwrap().registers.get(&address).copied()
    }

    /// Answer any request touching this address with an exception response.
    pub fn inject_exception(&self, address: u16, code: u8) {
        self.state.lock().unwrap().exceptions.insert(address, code);
    }

    /// Swallow the next `n` requests without answering.
    pub fn swallow_requests(&self, n: u32) {
        self.state.lock().unwrap().swallow_requests = n;
    }

    /// Total requests received, including swallowed ones.
    pub fn request_count(&self) -> u32 {
        self.state.lock().unwrap().requests
    }
}

pub struct ServoSimulator {
    state: Arc<Mutex<SimState>>,
    rx: Vec<u8>,
    connected: bool,
}

impl ServoSimulator {
    /// Simulator with the alarm register idling at the no-alarm sentinel,
    /// so connection verification succeeds.
    pub fn new() -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState::default()));
        state
            .lock()
            .unwrap()
            .registers
            .insert(0x0B1F, NO_ALARM_SENTINEL);
        let handle = SimHandle {
            state: state.clone(),
        };
        (
            Self {
                state,
                rx: Vec::new(),
                connected: false,
            },
            handle,
        )
    }

    fn respond(&mut self, request: &ModbusFrame) {
        let mut state = self.state.lock().unwrap();
        let payload = &request.payload;
        if payload.len() < 4 {
            return;
        }
        let address = u16::from_be_bytes([payload[0], payload[1]]);

        if let Some(&code) = state.exceptions.get(&address) {
            let frame = ModbusFrame::new(request.slave_id, request.function_code | 0x80, vec![code]);
            self.rx.extend(frame.encode());
            return;
        }

        let response = match request.function_code {
            FC_READ => {
                let count = u16::from_be_bytes([payload[2], payload[3]]);
                let mut data = vec![(count * 2) as u8];
                for offset in 0..count {
                    let value = state
                        .registers
                        .get(&(address + offset))
                        .copied()
                        .unwrap_or(0);
                    data.extend_from_slice(&value.to_be_bytes());
                }
                ModbusFrame::new(request.slave_id, FC_READ, data)
            }
            FC_WRITE_SINGLE => {
                let value = u16::from_be_bytes([payload[2], payload[3]]);
                state.registers.insert(address, value);
                ModbusFrame::new(request.slave_id, FC_WRITE_SINGLE, payload.clone())
            }
            FC_WRITE_MULTIPLE => {
                let count = u16::from_be_bytes([payload[2], payload[3]]);
                for offset in 0..count {
                    let at = 5 + offset as usize * 2;
                    if at + 1 < payload.len() {
                        let value = u16::from_be_bytes([payload[at], payload[at + 1]]);
                        state.registers.insert(address + offset, value);
                    }
                }
                ModbusFrame::new(request.slave_id, FC_WRITE_MULTIPLE, payload[..4].to_vec())
            }
            _ => ModbusFrame::new(request.slave_id, request.function_code | 0x80, vec![0x01]),
        };
        self.rx.extend(response.encode());
    }
}

impl ByteTransport for ServoSimulator {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        {
            let mut state = self.state.lock().unwrap();
            state.requests += 1;
            if state.swallow_requests > 0 {
                state.swallow_requests -= 1;
                return Ok(data.len());
            }
        }

        // A real drive ignores garbage frames rather than answering them
        if data.len() >= 4 {
            let body_len = data.len() - 2;
            let received = u16::from_le_bytes([data[body_len], data[body_len + 1]]);
            if received == crc16(&data[..body_len]) {
                let request = ModbusFrame::new(data[0], data[1], data[2..body_len].to_vec());
                self.respond(&request);
            }
        }
        Ok(data.len())
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.rx.len() < n {
            self.rx.clear();
            return Err(ServoError::timeout(format!("no response bytes ({n} wanted)")));
        }
        Ok(self.rx.drain(..n).collect())
    }

    fn reset_buffers(&mut self) {
        self.rx.clear();
    }
}
