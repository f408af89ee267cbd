//! Modbus transaction engine
//!
//! Executes one request/response exchange at a time over the byte transport,
//! with bounded retries for transient faults. The transport mutex is held
//! for the duration of a whole transaction, so the caller thread and the
//! monitor thread interleave complete transactions, never bytes.
//!
//! Retry policy: timeouts, CRC errors, and write failures are retried up to
//! [`MAX_RETRIES`] attempts with a fixed [`RETRY_DELAY`] between them.
//! A device exception response is a deterministic protocol-level rejection
//! and is surfaced after a single attempt. A byte-count mismatch in an
//! otherwise CRC-valid response indicates a framing desync, not noise, and
//! is likewise not retried.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{Result, ServoError};
use crate::protocol::frame::{
    ModbusFrame, EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_REGISTER,
};
use crate::transport::ByteTransport;

/// Attempts per transaction before giving up
pub const MAX_RETRIES: u32 = 3;

/// Fixed delay between transaction attempts
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Lifetime of a cached register value
const CACHE_TTL: Duration = Duration::from_millis(100);

/// Register-level operations the parameter and motion layers are built on.
///
/// Implemented by [`ModbusEngine`]; test code substitutes in-memory fakes.
pub trait RegisterTransactor: Send + Sync {
    /// Read `count` consecutive holding registers.
    fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>>;

    /// Read one register, optionally serving a recent cached value.
    fn read_register(&self, address: u16, use_cache: bool) -> Result<u16>;

    /// Write one register (echo-verified by the device).
    fn write_register(&self, address: u16, value: u16) -> Result<()>;

    /// Write consecutive registers starting at `address`.
    fn write_registers(&self, address: u16, values: &[u16]) -> Result<()>;

    /// Read a 32-bit value from two consecutive registers: low word at the
    /// low address, reinterpreted as signed two's-complement.
    fn read_u32(&self, address: u16) -> Result<i32> {
        let regs = self.read_registers(address, 2)?;
        Ok((((regs[1] as u32) << 16) | regs[0] as u32) as i32)
    }

    /// Write a 32-bit value to two consecutive registers, low word first.
    fn write_u32(&self, address: u16, value: i32) -> Result<()> {
        let raw = value as u32;
        self.write_registers(address, &[raw as u16, (raw >> 16) as u16])
    }
}

struct CacheEntry {
    value: u16,
    at: Instant,
}

/// Modbus RTU transaction engine with a short-lived register cache.
pub struct ModbusEngine {
    transport: Mutex<Box<dyn ByteTransport>>,
    slave_id: u8,
    cache: Mutex<HashMap<u16, CacheEntry>>,
}

impl ModbusEngine {
    pub fn new(transport: Box<dyn ByteTransport>, slave_id: u8) -> Self {
        Self {
            transport: Mutex::new(transport),
            slave_id,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Slave id this engine addresses.
    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    /// Open the underlying transport.
    pub fn connect_transport(&self) -> Result<()> {
        self.lock_transport()?.connect()
    }

    /// Close the underlying transport and drop any cached registers.
    pub fn disconnect_transport(&self) {
        if let Ok(mut transport) = self.transport.lock() {
            transport.disconnect();
        }
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// Whether the underlying transport is open.
    pub fn transport_connected(&self) -> bool {
        self.transport
            .lock()
            .map(|t| t.is_connected())
            .unwrap_or(false)
    }

    fn lock_transport(&self) -> Result<std::sync::MutexGuard<'_, Box<dyn ByteTransport>>> {
        self.transport
            .lock()
            .map_err(|_| ServoError::internal("transport lock poisoned"))
    }

    /// Read Holding Registers (0x03).
    pub fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&address.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        let request = ModbusFrame::new(self.slave_id, FC_READ_HOLDING_REGISTERS, payload);

        let response = self.execute(&request)?;

        let data = &response.payload;
        if data.is_empty() {
            return Err(ServoError::communication("empty read response payload"));
        }
        let byte_count = data[0] as usize;
        if byte_count != count as usize * 2 || data.len() != byte_count + 1 {
            // Framing desync rather than transient noise; already CRC-valid
            return Err(ServoError::communication(format!(
                "byte count mismatch: declared {byte_count}, expected {} for {count} registers",
                count * 2
            )));
        }

        let values = data[1..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok(values)
    }

    /// Write Single Register (0x06) with echo verification.
    pub fn write_single_register(&self, address: u16, value: u16) -> Result<()> {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&address.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
        let request = ModbusFrame::new(self.slave_id, FC_WRITE_SINGLE_REGISTER, payload);

        let response = self.execute(&request)?;

        let data = &response.payload;
        if data.len() != 4 {
            return Err(ServoError::communication(format!(
                "unexpected write echo length: {}",
                data.len()
            )));
        }
        let echo_addr = u16::from_be_bytes([data[0], data[1]]);
        let echo_value = u16::from_be_bytes([data[2], data[3]]);
        if echo_addr != address || echo_value != value {
            return Err(ServoError::communication(format!(
                "write verification failed: wrote {value:04X}@{address:04X}, \
                 device echoed {echo_value:04X}@{echo_addr:04X}"
            )));
        }
        Ok(())
    }

    /// Write Multiple Registers (0x10) with echo verification.
    pub fn write_multiple_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        if values.is_empty() {
            return Err(ServoError::communication("no registers to write"));
        }

        let count = values.len() as u16;
        let mut payload = Vec::with_capacity(5 + values.len() * 2);
        payload.extend_from_slice(&address.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        payload.push((values.len() * 2) as u8);
        for &value in values {
            payload.extend_from_slice(&value.to_be_bytes());
        }
        let request = ModbusFrame::new(self.slave_id, FC_WRITE_MULTIPLE_REGISTERS, payload);

        let response = self.execute(&request)?;

        let data = &response.payload;
        if data.len() != 4 {
            return Err(ServoError::communication(format!(
                "unexpected write echo length: {}",
                data.len()
            )));
        }
        let echo_addr = u16::from_be_bytes([data[0], data[1]]);
        let echo_count = u16::from_be_bytes([data[2], data[3]]);
        if echo_addr != address || echo_count != count {
            return Err(ServoError::communication(format!(
                "write verification failed: wrote {count} registers @{address:04X}, \
                 device echoed {echo_count} @{echo_addr:04X}"
            )));
        }
        Ok(())
    }

    /// Run a transaction to completion with bounded retries.
    fn execute(&self, request: &ModbusFrame) -> Result<ModbusFrame> {
        let mut transport = self.lock_transport()?;
        let tx = request.encode();

        let mut last_err = ServoError::communication("transaction not attempted");
        for attempt in 1..=MAX_RETRIES {
            trace!(
                "Transaction attempt {attempt}/{MAX_RETRIES}: fc=0x{:02X} @slave {}",
                request.function_code,
                request.slave_id
            );
            match Self::attempt(transport.as_mut(), request, &tx) {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    warn!("Transaction attempt {attempt}/{MAX_RETRIES} failed: {e}");
                    last_err = e;
                    if attempt < MAX_RETRIES {
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(ServoError::communication(format!(
            "transaction failed after {MAX_RETRIES} attempts: {last_err}"
        )))
    }

    /// One request/response exchange.
    fn attempt(
        transport: &mut dyn ByteTransport,
        request: &ModbusFrame,
        tx: &[u8],
    ) -> Result<ModbusFrame> {
        // Leftover bytes from an aborted exchange would shift this frame
        transport.reset_buffers();

        debug!("TX: {}", hex::encode_upper(tx));
        transport.write(tx)?;

        let header = transport.read(2)?;
        let (slave_id, function_code) = (header[0], header[1]);

        if function_code & EXCEPTION_FLAG != 0 {
            // Exception layout: code byte + CRC
            let rest = transport.read(3)?;
            let mut raw = header;
            raw.extend_from_slice(&rest);
            debug!("RX: {}", hex::encode_upper(&raw));
            let frame = ModbusFrame::decode(&raw)?;
            let code = frame.payload.first().copied().unwrap_or(0);
            return Err(ServoError::ModbusException { code });
        }

        if slave_id != request.slave_id {
            return Err(ServoError::communication(format!(
                "slave id mismatch: expected {}, got {slave_id}",
                request.slave_id
            )));
        }
        if function_code != request.function_code {
            return Err(ServoError::communication(format!(
                "function code mismatch: expected 0x{:02X}, got 0x{function_code:02X}",
                request.function_code
            )));
        }

        let rest = match function_code {
            FC_READ_HOLDING_REGISTERS => {
                let byte_count = transport.read(1)?;
                let tail = transport.read(byte_count[0] as usize + 2)?;
                let mut rest = byte_count;
                rest.extend_from_slice(&tail);
                rest
            }
            FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS => transport.read(6)?,
            other => {
                return Err(ServoError::communication(format!(
                    "unexpected function code in response: 0x{other:02X}"
                )))
            }
        };

        let mut raw = header;
        raw.extend_from_slice(&rest);
        debug!("RX: {}", hex::encode_upper(&raw));

        // decode verifies the CRC over the whole frame
        ModbusFrame::decode(&raw)
    }

    fn cached(&self, address: u16) -> Option<u16> {
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(&address)?;
        (entry.at.elapsed() < CACHE_TTL).then_some(entry.value)
    }

    fn store_cached(&self, address: u16, value: u16) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                address,
                CacheEntry {
                    value,
                    at: Instant::now(),
                },
            );
        }
    }

    fn invalidate(&self, address: u16, count: u16) {
        if let Ok(mut cache) = self.cache.lock() {
            for offset in 0..count {
                cache.remove(&(address + offset));
            }
        }
    }
}

impl RegisterTransactor for ModbusEngine {
    fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        self.read_holding_registers(address, count)
    }

    fn read_register(&self, address: u16, use_cache: bool) -> Result<u16> {
        if use_cache {
            if let Some(value) = self.cached(address) {
                trace!("Cache hit for register 0x{address:04X}: {value}");
                return Ok(value);
            }
        }
        let value = self.read_holding_registers(address, 1)?[0];
        self.store_cached(address, value);
        Ok(value)
    }

    fn write_register(&self, address: u16, value: u16) -> Result<()> {
        self.write_single_register(address, value)?;
        self.invalidate(address, 1);
        Ok(())
    }

    fn write_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        self.write_multiple_registers(address, values)?;
        self.invalidate(address, values.len() as u16);
        Ok(())
    }
}
