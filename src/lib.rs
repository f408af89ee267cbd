//! Modbus RTU communication and control stack for AC servo drives.
//!
//! The stack is layered bottom-up:
//!
//! - [`transport`]: blocking serial byte stream with read timeouts
//! - [`protocol`]: Modbus RTU framing, CRC16, and the retrying transaction
//!   engine
//! - [`registers`]: the symbolic register map and device constants
//! - [`params`]: name-based parameter access with 16/32-bit width routing
//! - [`motion`]: jog, homing, and PR path primitives
//! - [`monitor`]: background status polling with change callbacks
//! - [`driver`]: the facade composing all of the above
//!
//! # Example
//!
//! ```no_run
//! use servolink::{DriverConfig, ServoDriver};
//!
//! fn main() -> servolink::Result<()> {
//!     let driver = ServoDriver::new(DriverConfig::for_port("/dev/ttyUSB0"));
//!     driver.connect()?;
//!
//!     driver.set_rigidity(20)?;
//!     println!("position: {} pulses", driver.get_position()?);
//!
//!     driver.disconnect();
//!     Ok(())
//! }
//! ```

pub mod driver;
pub mod error;
pub mod monitor;
pub mod motion;
pub mod params;
pub mod protocol;
pub mod registers;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use driver::{DriverConfig, ServoDriver};
pub use error::{Result, ServoError};
pub use monitor::{AlarmCallback, StatusCallback, StatusMonitor, StatusSample};
pub use motion::{MotionController, PrPath};
pub use params::ParameterManager;
pub use protocol::{ModbusEngine, RegisterTransactor};
pub use registers::{ControlMode, HomingMode};
pub use transport::{ByteTransport, SerialConfig, SerialTransport};
