//! Shared test fixtures
//!
//! An in-memory register transactor backing the parameter, motion, and
//! monitor tests. Unset registers read as zero; individual addresses can be
//! made to fail to exercise error paths.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::{Result, ServoError};
use crate::protocol::RegisterTransactor;
use crate::registers::{RegisterWidth, PARAMETERS};

#[derive(Default)]
pub struct MockTransactor {
    registers: Mutex<HashMap<u16, u16>>,
    failing: Mutex<HashSet<u16>>,
    writes: Mutex<u32>,
}

impl MockTransactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a register value.
    pub fn set_register(&self, address: u16, value: u16) {
        self.registers.lock().unwrap().insert(address, value);
    }

    /// Current value of a register, if ever written or seeded.
    pub fn register(&self, address: u16) -> Option<u16> {
        self.registers.lock().unwrap().get(&address).copied()
    }

    /// Make any transaction touching this address fail.
    pub fn fail_address(&self, address: u16) {
        self.failing.lock().unwrap().insert(address);
    }

    /// Number of write transactions performed.
    pub fn write_count(&self) -> u32 {
        *self.writes.lock().unwrap()
    }

    /// Seed every mapped parameter address (both words of double-width
    /// parameters) with a value.
    pub fn fill_all_mapped(&self, value: u16) {
        let mut registers = self.registers.lock().unwrap();
        for param in PARAMETERS {
            registers.insert(param.address, value);
            if param.width == RegisterWidth::DoubleWord {
                registers.insert(param.address + 1, value);
            }
        }
    }

    fn check(&self, address: u16, count: u16) -> Result<()> {
        let failing = self.failing.lock().unwrap();
        for offset in 0..count {
            if failing.contains(&(address + offset)) {
                return Err(ServoError::timeout(format!(
                    "injected failure at 0x{:04X}",
                    address + offset
                )));
            }
        }
        Ok(())
    }
}

impl RegisterTransactor for MockTransactor {
    fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        self.check(address, count)?;
        let registers = self.registers.lock().unwrap();
        Ok((0..count)
            .map(|offset| registers.get(&(address + offset)).copied().unwrap_or(0))
            .collect())
    }

    fn read_register(&self, address: u16, _use_cache: bool) -> Result<u16> {
        Ok(self.read_registers(address, 1)?[0])
    }

    fn write_register(&self, address: u16, value: u16) -> Result<()> {
        self.check(address, 1)?;
        self.registers.lock().unwrap().insert(address, value);
        *self.writes.lock().unwrap() += 1;
        Ok(())
    }

    fn write_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        self.check(address, values.len() as u16)?;
        let mut registers = self.registers.lock().unwrap();
        for (offset, &value) in values.iter().enumerate() {
            registers.insert(address + offset as u16, value);
        }
        *self.writes.lock().unwrap() += 1;
        Ok(())
    }
}
