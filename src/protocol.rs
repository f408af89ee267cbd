//! Modbus RTU protocol implementation
//!
//! Frame codec with CRC16 checking and the transaction engine that executes
//! request/response exchanges with bounded retries over a byte transport.

pub mod engine;
pub mod frame;

pub use engine::{ModbusEngine, RegisterTransactor, MAX_RETRIES, RETRY_DELAY};
pub use frame::{
    crc16, ModbusFrame, FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_REGISTER,
};
