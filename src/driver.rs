//! Driver facade
//!
//! The single entry point composing transport, transaction engine,
//! parameter manager, motion controller, and status monitor. The facade
//! owns the connection state; every public operation asserts it before
//! touching the wire, and `connect` succeeds only once a live register
//! read proves the device actually answers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, ServoError};
use crate::monitor::{AlarmCallback, StatusCallback, StatusMonitor};
use crate::motion::{MotionController, PrPath};
use crate::params::ParameterManager;
use crate::protocol::{ModbusEngine, RegisterTransactor};
use crate::registers::{
    self, ControlMode, HomingMode, CONTROL_OPERATION, DEFAULT_SLAVE_ID, DO_SRDY,
    MAX_RIGIDITY_LEVEL,
};
use crate::transport::{ByteTransport, SerialConfig, SerialTransport};

/// Pause after an alarm reset before the drive accepts further commands
const ALARM_RESET_SETTLE: Duration = Duration::from_millis(50);

/// Aux-function code that clears the current alarm
const AUX_ALARM_RESET: u16 = 0x1111;

/// Full driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub serial: SerialConfig,
    pub slave_id: u8,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            slave_id: DEFAULT_SLAVE_ID,
        }
    }
}

impl DriverConfig {
    /// Config for a device path with default line settings and slave id.
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            serial: SerialConfig::for_port(port),
            ..Self::default()
        }
    }
}

/// High-level servo drive interface.
pub struct ServoDriver {
    engine: Arc<ModbusEngine>,
    params: Arc<ParameterManager>,
    motion: MotionController,
    monitor: StatusMonitor,
    connected: AtomicBool,
}

impl ServoDriver {
    /// Driver over a real serial port.
    pub fn new(config: DriverConfig) -> Self {
        let transport = SerialTransport::new(config.serial.clone());
        info!(
            "Servo driver initialized for {} (slave id {})",
            config.serial.port, config.slave_id
        );
        Self::with_transport(Box::new(transport), config.slave_id)
    }

    /// Driver over an arbitrary byte transport. This is the seam used by
    /// tests and by callers bringing their own link layer.
    pub fn with_transport(transport: Box<dyn ByteTransport>, slave_id: u8) -> Self {
        let engine = Arc::new(ModbusEngine::new(transport, slave_id));
        let transactor: Arc<dyn RegisterTransactor> = engine.clone();
        let params = Arc::new(ParameterManager::new(transactor.clone()));
        let motion = MotionController::new(transactor, params.clone());
        let monitor = StatusMonitor::new(params.clone());
        Self {
            engine,
            params,
            motion,
            monitor,
            connected: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Open the transport and verify the device answers.
    ///
    /// A port that opens but never answers is closed again and reported as
    /// a connection failure; mere port-open is not a connection.
    pub fn connect(&self) -> Result<()> {
        if self.is_connected() {
            debug!("Already connected");
            return Ok(());
        }

        self.engine.connect_transport()?;

        match self.params.read("alarm_code", false) {
            Ok(alarm) => {
                self.connected.store(true, Ordering::SeqCst);
                info!("Connected to servo drive (alarm: 0x{alarm:04X})");
                Ok(())
            }
            Err(e) => {
                self.engine.disconnect_transport();
                Err(ServoError::connection(format!(
                    "device did not answer verification read: {e}"
                )))
            }
        }
    }

    /// Stop monitoring and close the transport.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.monitor.stop();
        self.engine.disconnect_transport();
        info!("Disconnected from servo drive");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.engine.transport_connected()
    }

    fn check_connection(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ServoError::NotConnected)
        }
    }

    // ------------------------------------------------------------------
    // Servo control
    // ------------------------------------------------------------------

    /// Servo enable is wired through the SRV-ON digital input on this
    /// hardware generation and cannot be commanded over the protocol.
    /// Always fails with a descriptive error rather than silently no-oping.
    pub fn servo_on(&self) -> Result<()> {
        self.check_connection()?;

        let alarm = self.get_alarm()?;
        if !registers::is_benign_alarm(alarm) {
            return Err(ServoError::ServoNotReady(format!(
                "alarm 0x{alarm:04X} active: {}",
                registers::alarm_description(alarm)
            )));
        }

        Err(ServoError::ServoNotReady(
            "servo enable requires external I/O wiring (SRV-ON signal)".to_string(),
        ))
    }

    /// Same hardware limitation as [`servo_on`](Self::servo_on).
    pub fn servo_off(&self) -> Result<()> {
        self.check_connection()?;
        Err(ServoError::ServoNotReady(
            "servo disable requires external I/O wiring (SRV-ON signal)".to_string(),
        ))
    }

    /// Whether the drive reports the S-RDY output asserted.
    pub fn is_servo_on(&self) -> Result<bool> {
        self.check_connection()?;
        let do_status = self.params.read("do_status", false)? as u16;
        Ok(do_status & DO_SRDY != 0)
    }

    /// Halt motion immediately via the control-operation stop code.
    pub fn emergency_stop(&self) -> Result<()> {
        self.check_connection()?;
        warn!("Emergency stop triggered");
        self.motion.stop_pr_motion()
    }

    /// Clear the current alarm via the auxiliary function register.
    pub fn reset_alarm(&self) -> Result<()> {
        self.check_connection()?;
        info!("Resetting alarm");
        self.params
            .write("aux_function", i32::from(AUX_ALARM_RESET))?;
        // The drive needs a moment before it accepts further commands
        std::thread::sleep(ALARM_RESET_SETTLE);
        Ok(())
    }

    pub fn set_control_mode(&self, mode: ControlMode) -> Result<()> {
        self.check_connection()?;
        info!("Setting control mode to {mode:?}");
        self.params.write("control_mode", mode as i32)
    }

    // ------------------------------------------------------------------
    // Motion
    // ------------------------------------------------------------------

    pub fn get_position(&self) -> Result<i32> {
        self.check_connection()?;
        self.motion.position()
    }

    pub fn get_command_position(&self) -> Result<i32> {
        self.check_connection()?;
        self.motion.command_position()
    }

    pub fn get_position_error(&self) -> Result<i32> {
        self.check_connection()?;
        self.motion.position_error()
    }

    pub fn get_speed(&self) -> Result<i32> {
        self.check_connection()?;
        self.motion.speed()
    }

    pub fn get_torque(&self) -> Result<i32> {
        self.check_connection()?;
        self.motion.torque()
    }

    pub fn jog(&self, speed: u16, forward: bool) -> Result<()> {
        self.check_connection()?;
        self.motion.jog(speed, forward)
    }

    pub fn stop_jog(&self) -> Result<()> {
        self.check_connection()?;
        self.motion.stop_jog()
    }

    pub fn home(&self, mode: HomingMode, high_speed: u16, low_speed: u16) -> Result<()> {
        self.check_connection()?;
        self.motion.home(mode, high_speed, low_speed)
    }

    pub fn set_home_offset(&self, offset: i32) -> Result<()> {
        self.check_connection()?;
        self.motion.set_home_offset(offset)
    }

    pub fn is_homing_complete(&self) -> Result<bool> {
        self.check_connection()?;
        self.motion.is_homing_complete()
    }

    // ------------------------------------------------------------------
    // PR paths
    // ------------------------------------------------------------------

    pub fn set_pr_path(&self, path: &PrPath) -> Result<()> {
        self.check_connection()?;
        self.motion.set_pr_path(path)
    }

    pub fn trigger_pr(&self, path_id: u8) -> Result<()> {
        self.check_connection()?;
        self.motion.trigger_pr(path_id)
    }

    pub fn stop_pr_motion(&self) -> Result<()> {
        self.check_connection()?;
        self.motion.stop_pr_motion()
    }

    pub fn get_current_pr_path(&self) -> Result<u8> {
        self.check_connection()?;
        self.motion.get_current_pr_path()
    }

    pub fn get_pr_position(&self) -> Result<i32> {
        self.check_connection()?;
        self.motion.get_pr_position()
    }

    pub fn get_pr_configured_position(&self, path_id: u8) -> Result<i32> {
        self.check_connection()?;
        self.motion.get_pr_configured_position(path_id)
    }

    pub fn is_pr_complete(&self) -> Result<bool> {
        self.check_connection()?;
        self.motion.is_pr_complete()
    }

    /// Last value written to the control-operation register.
    pub fn get_control_operation(&self) -> Result<u16> {
        self.check_connection()?;
        self.engine.read_register(CONTROL_OPERATION, false)
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    pub fn read_parameter(&self, name: &str) -> Result<i32> {
        self.check_connection()?;
        self.params.read(name, false)
    }

    pub fn write_parameter(&self, name: &str, value: i32) -> Result<()> {
        self.check_connection()?;
        self.params.write(name, value)
    }

    pub fn save_parameters(&self) -> Result<()> {
        self.check_connection()?;
        self.params.save_to_eeprom()
    }

    pub fn restore_defaults(&self) -> Result<()> {
        self.check_connection()?;
        self.params.restore_defaults()
    }

    pub fn export_parameters(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        self.check_connection()?;
        self.params.export_to_file(path)
    }

    pub fn import_parameters(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        self.check_connection()?;
        self.params.import_from_file(path)
    }

    // ------------------------------------------------------------------
    // Gain adjustment
    // ------------------------------------------------------------------

    /// Rigidity tuning level, 0-31.
    pub fn set_rigidity(&self, level: u8) -> Result<()> {
        self.check_connection()?;
        if level > MAX_RIGIDITY_LEVEL {
            return Err(ServoError::ParameterOutOfRange {
                name: "rigidity_level".to_string(),
                value: i32::from(level),
                min: 0,
                max: i32::from(MAX_RIGIDITY_LEVEL),
            });
        }
        self.params.write("rigidity_level", i32::from(level))
    }

    /// Load inertia ratio in percent of rotor inertia.
    pub fn set_inertia_ratio(&self, ratio: u16) -> Result<()> {
        self.check_connection()?;
        self.params.write("inertia_ratio", i32::from(ratio))
    }

    /// Auto-tune mode: 0 disabled, 1 standard, 2 high inertia.
    pub fn auto_tune(&self, mode: u16) -> Result<()> {
        self.check_connection()?;
        self.params.write("auto_tune_mode", i32::from(mode))
    }

    // ------------------------------------------------------------------
    // Status and monitoring
    // ------------------------------------------------------------------

    /// Raw alarm register value; sentinel values denote benign states.
    pub fn get_alarm(&self) -> Result<u16> {
        self.check_connection()?;
        self.monitor.get_alarm()
    }

    pub fn get_alarm_description(&self) -> Result<&'static str> {
        Ok(registers::alarm_description(self.get_alarm()?))
    }

    pub fn is_ready(&self) -> Result<bool> {
        self.check_connection()?;
        self.monitor.is_servo_ready()
    }

    pub fn get_servo_status(&self) -> Result<u16> {
        self.check_connection()?;
        Ok(self.params.read("servo_status", false)? as u16)
    }

    pub fn get_servo_status_description(&self) -> Result<String> {
        Ok(registers::servo_status_description(self.get_servo_status()?))
    }

    pub fn get_digital_inputs(&self) -> Result<u16> {
        self.check_connection()?;
        self.monitor.get_di_status()
    }

    pub fn get_digital_outputs(&self) -> Result<u16> {
        self.check_connection()?;
        self.monitor.get_do_status()
    }

    /// DC bus voltage in volts.
    pub fn get_bus_voltage(&self) -> Result<f64> {
        self.check_connection()?;
        self.monitor.get_bus_voltage()
    }

    /// Driver temperature in degrees Celsius.
    pub fn get_temperature(&self) -> Result<f64> {
        self.check_connection()?;
        self.monitor.get_temperature()
    }

    /// Start background monitoring. Callbacks are owned by the monitor
    /// thread for its lifetime; starting while running is a warning no-op.
    pub fn start_monitoring(
        &self,
        interval: Duration,
        status_callback: Option<StatusCallback>,
        alarm_callback: Option<AlarmCallback>,
    ) -> Result<()> {
        self.check_connection()?;
        self.monitor.start(interval, status_callback, alarm_callback);
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        self.monitor.stop();
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_running()
    }
}

impl Drop for ServoDriver {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for ServoDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServoDriver")
            .field("slave_id", &self.engine.slave_id())
            .field("connected", &self.is_connected())
            .finish()
    }
}
