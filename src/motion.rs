//! Motion control primitives
//!
//! Jog, homing, and PR path operations composed from register reads and
//! writes. The controller holds no motion state of its own; the drive is the
//! single source of truth and every operation reads or writes it directly.
//!
//! Two trigger conventions coexist in the firmware. Jog and homing are
//! started by setting a bit in `pr_control` with a read-modify-write that
//! preserves unrelated bits. Path dispatch and stop go through the
//! control-operation register as direct value writes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, ServoError};
use crate::params::ParameterManager;
use crate::protocol::RegisterTransactor;
use crate::registers::{
    HomingMode, CONTROL_OPERATION, CTRL_OP_EMERGENCY_STOP, CTRL_OP_TRIGGER_BASE, MAX_ACCELERATION,
    MAX_SPEED_RPM, MAX_TORQUE_LIMIT, PR_CTRL_HOMING_TRIGGER, PR_CTRL_JOG_TRIGGER, PR_PATH_BASE,
    PR_PATH_COUNT, PR_PATH_SIZE, PR_STATUS_HOMING_DONE, PR_STATUS_PATH_DONE,
};

// ============================================================================
// PR path configuration
// ============================================================================

/// One PR path register block.
///
/// Validated before any wire traffic; an invalid path is rejected without
/// touching the drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrPath {
    /// Path slot, 0-15
    pub path_id: u8,
    /// Target position in pulses
    pub position: i32,
    /// Speed in rpm
    pub speed: u16,
    /// Acceleration time in ms/krpm
    pub acceleration: u16,
    /// Deceleration time in ms/krpm
    pub deceleration: u16,
    /// Post-motion delay in ms
    pub delay: u16,
    /// S-curve smoothing time in ms
    pub s_curve: u16,
}

impl PrPath {
    pub fn validate(&self) -> Result<()> {
        if self.path_id >= PR_PATH_COUNT {
            return Err(ServoError::InvalidPath(self.path_id));
        }
        if self.speed > MAX_SPEED_RPM {
            return Err(ServoError::ParameterOutOfRange {
                name: "speed".to_string(),
                value: i32::from(self.speed),
                min: 0,
                max: i32::from(MAX_SPEED_RPM),
            });
        }
        for (name, value) in [
            ("acceleration", self.acceleration),
            ("deceleration", self.deceleration),
        ] {
            if value > MAX_ACCELERATION {
                return Err(ServoError::ParameterOutOfRange {
                    name: name.to_string(),
                    value: i32::from(value),
                    min: 0,
                    max: i32::from(MAX_ACCELERATION),
                });
            }
        }
        Ok(())
    }

    /// Base address of this path's register block.
    pub fn base_address(&self) -> u16 {
        PR_PATH_BASE + u16::from(self.path_id) * PR_PATH_SIZE
    }
}

// ============================================================================
// Motion controller
// ============================================================================

pub struct MotionController {
    transactor: Arc<dyn RegisterTransactor>,
    params: Arc<ParameterManager>,
}

impl MotionController {
    pub fn new(transactor: Arc<dyn RegisterTransactor>, params: Arc<ParameterManager>) -> Self {
        Self { transactor, params }
    }

    // ------------------------------------------------------------------
    // Status projections
    // ------------------------------------------------------------------

    /// Current encoder position in pulses.
    pub fn position(&self) -> Result<i32> {
        self.params.read("encoder_position", false)
    }

    /// Commanded position in pulses.
    pub fn command_position(&self) -> Result<i32> {
        self.params.read("command_position", false)
    }

    /// Position error in pulses.
    pub fn position_error(&self) -> Result<i32> {
        self.params.read("position_error", false)
    }

    /// Current speed in rpm.
    pub fn speed(&self) -> Result<i32> {
        self.params.read("motor_speed", false)
    }

    /// Current torque output in percent of rated.
    pub fn torque(&self) -> Result<i32> {
        self.params.read("torque_feedback", false)
    }

    // ------------------------------------------------------------------
    // Speed and torque commands
    // ------------------------------------------------------------------

    pub fn set_speed_command(&self, speed: u16) -> Result<()> {
        if speed > MAX_SPEED_RPM {
            return Err(ServoError::ParameterOutOfRange {
                name: "speed_command_1".to_string(),
                value: i32::from(speed),
                min: 0,
                max: i32::from(MAX_SPEED_RPM),
            });
        }
        info!("Setting speed command: {speed} rpm");
        self.params.write("speed_command_1", i32::from(speed))
    }

    /// Torque limit in percent of rated torque, 0-300.
    pub fn set_torque_limit(&self, limit: u16) -> Result<()> {
        if limit > MAX_TORQUE_LIMIT {
            return Err(ServoError::ParameterOutOfRange {
                name: "torque_limit_1".to_string(),
                value: i32::from(limit),
                min: 0,
                max: i32::from(MAX_TORQUE_LIMIT),
            });
        }
        info!("Setting torque limit: {limit}%");
        self.params.write("torque_limit_1", i32::from(limit))
    }

    /// Acceleration and deceleration times in ms/krpm.
    pub fn set_acceleration(&self, acc_time: u16, dec_time: u16) -> Result<()> {
        for (name, value) in [("acceleration_time", acc_time), ("deceleration_time", dec_time)] {
            if value > MAX_ACCELERATION {
                return Err(ServoError::ParameterOutOfRange {
                    name: name.to_string(),
                    value: i32::from(value),
                    min: 0,
                    max: i32::from(MAX_ACCELERATION),
                });
            }
        }
        info!("Setting acceleration {acc_time}ms, deceleration {dec_time}ms");
        self.params.write("acceleration_time", i32::from(acc_time))?;
        self.params.write("deceleration_time", i32::from(dec_time))
    }

    // ------------------------------------------------------------------
    // Jog
    // ------------------------------------------------------------------

    /// Start jog motion. Negative jog speed on the wire encodes reverse.
    pub fn jog(&self, speed: u16, forward: bool) -> Result<()> {
        if speed > MAX_SPEED_RPM {
            return Err(ServoError::ParameterOutOfRange {
                name: "pr_jog_speed".to_string(),
                value: i32::from(speed),
                min: 0,
                max: i32::from(MAX_SPEED_RPM),
            });
        }

        info!(
            "Starting jog: {speed} rpm {}",
            if forward { "forward" } else { "reverse" }
        );

        let signed = if forward {
            i32::from(speed)
        } else {
            -i32::from(speed)
        };
        // The register is a raw 16-bit word; reverse is its two's complement
        let param = crate::registers::lookup("pr_jog_speed")
            .ok_or_else(|| ServoError::InvalidParameter("pr_jog_speed".to_string()))?;
        self.transactor
            .write_register(param.address, signed as i16 as u16)?;

        self.set_pr_control_bit(PR_CTRL_JOG_TRIGGER)
    }

    /// Stop jog by clearing only the jog trigger bit.
    pub fn stop_jog(&self) -> Result<()> {
        info!("Stopping jog");
        self.clear_pr_control_bit(PR_CTRL_JOG_TRIGGER)
    }

    // ------------------------------------------------------------------
    // Homing
    // ------------------------------------------------------------------

    /// Start the homing sequence. Non-blocking; poll
    /// [`is_homing_complete`](Self::is_homing_complete) for completion.
    pub fn home(&self, mode: HomingMode, high_speed: u16, low_speed: u16) -> Result<()> {
        info!("Starting homing: mode={mode:?}, high={high_speed}rpm, low={low_speed}rpm");

        self.params.write("pr_home_mode", mode as i32)?;
        self.params.write("pr_home_speed_high", i32::from(high_speed))?;
        self.params.write("pr_home_speed_low", i32::from(low_speed))?;

        self.set_pr_control_bit(PR_CTRL_HOMING_TRIGGER)
    }

    /// Home offset in pulses, applied at homing completion.
    pub fn set_home_offset(&self, offset: i32) -> Result<()> {
        info!("Setting home offset: {offset} pulses");
        self.params.write("pr_home_offset", offset)
    }

    /// Current homing-complete state; callers poll this.
    pub fn is_homing_complete(&self) -> Result<bool> {
        let status = self.params.read("pr_status", false)?;
        Ok(status as u16 & PR_STATUS_HOMING_DONE != 0)
    }

    // ------------------------------------------------------------------
    // PR paths
    // ------------------------------------------------------------------

    /// Write a path's 8-register block. Validation failures never reach
    /// the wire.
    pub fn set_pr_path(&self, path: &PrPath) -> Result<()> {
        path.validate()?;

        info!("Configuring PR path {}", path.path_id);

        let raw_position = path.position as u32;
        let block = [
            raw_position as u16,         // position low
            (raw_position >> 16) as u16, // position high
            path.speed,
            0, // reserved
            path.acceleration,
            path.deceleration,
            path.delay,
            path.s_curve,
        ];
        self.transactor.write_registers(path.base_address(), &block)
    }

    /// Target position configured for a path slot.
    pub fn get_pr_configured_position(&self, path_id: u8) -> Result<i32> {
        if path_id >= PR_PATH_COUNT {
            return Err(ServoError::InvalidPath(path_id));
        }
        self.transactor
            .read_u32(PR_PATH_BASE + u16::from(path_id) * PR_PATH_SIZE)
    }

    /// Dispatch a configured path immediately.
    pub fn trigger_pr(&self, path_id: u8) -> Result<()> {
        if path_id >= PR_PATH_COUNT {
            return Err(ServoError::InvalidPath(path_id));
        }
        info!("Triggering PR path {path_id}");
        self.transactor
            .write_register(CONTROL_OPERATION, CTRL_OP_TRIGGER_BASE | u16::from(path_id))
    }

    /// Halt PR motion with the dedicated stop code. This is an
    /// emergency-style halt, not a trigger-bit clear.
    pub fn stop_pr_motion(&self) -> Result<()> {
        info!("Stopping PR motion");
        self.transactor
            .write_register(CONTROL_OPERATION, CTRL_OP_EMERGENCY_STOP)
    }

    /// Path slot currently executing.
    pub fn get_current_pr_path(&self) -> Result<u8> {
        Ok(self.params.read("pr_current_path", false)? as u8)
    }

    /// Live PR position in pulses.
    pub fn get_pr_position(&self) -> Result<i32> {
        self.params.read("pr_current_position", false)
    }

    /// Whether the active path has completed.
    pub fn is_pr_complete(&self) -> Result<bool> {
        let status = self.params.read("pr_status", false)?;
        Ok(status as u16 & PR_STATUS_PATH_DONE != 0)
    }

    // ------------------------------------------------------------------
    // pr_control bit twiddling
    // ------------------------------------------------------------------

    fn set_pr_control_bit(&self, bit: u16) -> Result<()> {
        let control = self.params.read("pr_control", false)? as u16;
        self.params.write("pr_control", i32::from(control | bit))
    }

    fn clear_pr_control_bit(&self, bit: u16) -> Result<()> {
        let control = self.params.read("pr_control", false)? as u16;
        self.params.write("pr_control", i32::from(control & !bit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockTransactor;

    fn controller() -> (MotionController, Arc<MockTransactor>) {
        let mock = Arc::new(MockTransactor::new());
        let params = Arc::new(ParameterManager::new(mock.clone()));
        (MotionController::new(mock.clone(), params), mock)
    }

    #[test]
    fn test_path_validation_rejects_before_wire() {
        let (motion, mock) = controller();
        let path = PrPath {
            path_id: 16,
            position: 1000,
            speed: 100,
            acceleration: 100,
            deceleration: 100,
            delay: 0,
            s_curve: 0,
        };
        let err = motion.set_pr_path(&path).unwrap_err();
        assert!(matches!(err, ServoError::InvalidPath(16)));
        assert_eq!(mock.write_count(), 0);
    }

    #[test]
    fn test_path_speed_validation() {
        let (motion, mock) = controller();
        let path = PrPath {
            path_id: 0,
            position: 0,
            speed: MAX_SPEED_RPM + 1,
            acceleration: 100,
            deceleration: 100,
            delay: 0,
            s_curve: 0,
        };
        assert!(matches!(
            motion.set_pr_path(&path),
            Err(ServoError::ParameterOutOfRange { .. })
        ));
        assert_eq!(mock.write_count(), 0);
    }

    #[test]
    fn test_set_pr_path_register_block() {
        let (motion, mock) = controller();
        let path = PrPath {
            path_id: 3,
            position: -100_000,
            speed: 500,
            acceleration: 100,
            deceleration: 200,
            delay: 10,
            s_curve: 5,
        };
        motion.set_pr_path(&path).unwrap();

        // Block lands at 0x6200 + 3 * 0x10
        let base = 0x6230;
        let raw = (-100_000i32) as u32;
        assert_eq!(mock.register(base), Some(raw as u16));
        assert_eq!(mock.register(base + 1), Some((raw >> 16) as u16));
        assert_eq!(mock.register(base + 2), Some(500));
        assert_eq!(mock.register(base + 3), Some(0));
        assert_eq!(mock.register(base + 4), Some(100));
        assert_eq!(mock.register(base + 5), Some(200));
        assert_eq!(mock.register(base + 6), Some(10));
        assert_eq!(mock.register(base + 7), Some(5));

        assert_eq!(motion.get_pr_configured_position(3).unwrap(), -100_000);
    }

    #[test]
    fn test_trigger_pr_control_operation_write() {
        let (motion, mock) = controller();
        motion.trigger_pr(5).unwrap();
        assert_eq!(mock.register(CONTROL_OPERATION), Some(0x0015));

        motion.stop_pr_motion().unwrap();
        assert_eq!(mock.register(CONTROL_OPERATION), Some(CTRL_OP_EMERGENCY_STOP));
    }

    #[test]
    fn test_trigger_pr_invalid_path() {
        let (motion, mock) = controller();
        assert!(matches!(
            motion.trigger_pr(16),
            Err(ServoError::InvalidPath(16))
        ));
        assert_eq!(mock.write_count(), 0);
    }

    #[test]
    fn test_jog_preserves_unrelated_control_bits() {
        let (motion, mock) = controller();
        mock.set_register(0x0800, 0x0100);

        motion.jog(200, true).unwrap();
        assert_eq!(mock.register(0x6027), Some(200));
        assert_eq!(mock.register(0x0800), Some(0x0100 | PR_CTRL_JOG_TRIGGER));

        motion.stop_jog().unwrap();
        assert_eq!(mock.register(0x0800), Some(0x0100));
    }

    #[test]
    fn test_jog_reverse_is_twos_complement() {
        let (motion, mock) = controller();
        motion.jog(200, false).unwrap();
        assert_eq!(mock.register(0x6027), Some((-200i16) as u16));
    }

    #[test]
    fn test_jog_speed_limit() {
        let (motion, mock) = controller();
        assert!(matches!(
            motion.jog(MAX_SPEED_RPM + 1, true),
            Err(ServoError::ParameterOutOfRange { .. })
        ));
        assert_eq!(mock.write_count(), 0);
    }

    #[test]
    fn test_home_sequence_and_completion() {
        let (motion, mock) = controller();
        motion.home(HomingMode::OriginForward, 500, 50).unwrap();

        assert_eq!(mock.register(0x080B), Some(0));
        assert_eq!(mock.register(0x080F), Some(500));
        assert_eq!(mock.register(0x0810), Some(50));
        assert_eq!(mock.register(0x0800), Some(PR_CTRL_HOMING_TRIGGER));

        assert!(!motion.is_homing_complete().unwrap());
        mock.set_register(0x0801, PR_STATUS_HOMING_DONE);
        assert!(motion.is_homing_complete().unwrap());
    }

    #[test]
    fn test_status_projections() {
        let (motion, mock) = controller();
        mock.set_register(0x0B06, 1500);
        mock.set_register(0x0B07, 45);
        mock.set_register(0x0B1C, 0x5678);
        mock.set_register(0x0B1D, 0x1234);

        assert_eq!(motion.speed().unwrap(), 1500);
        assert_eq!(motion.torque().unwrap(), 45);
        assert_eq!(motion.position().unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_torque_limit_range() {
        let (motion, _mock) = controller();
        assert!(motion.set_torque_limit(300).is_ok());
        assert!(matches!(
            motion.set_torque_limit(301),
            Err(ServoError::ParameterOutOfRange { .. })
        ));
    }
}
