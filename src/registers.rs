//! Register map and device constants
//!
//! The symbolic parameter table, PR path geometry, alarm tables, and I/O bit
//! definitions for the servo drive firmware. This is configuration data, not
//! protocol logic: addresses are documented per firmware revision and the
//! same names are used throughout the parameter, motion, and monitor layers.

// ============================================================================
// Register widths and the parameter table
// ============================================================================

/// Declared width of a mapped register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWidth {
    /// Single 16-bit holding register
    Word,
    /// Two consecutive registers, low word at the low address
    DoubleWord,
}

/// One entry of the symbolic parameter map
#[derive(Debug, Clone, Copy)]
pub struct Parameter {
    pub name: &'static str,
    pub address: u16,
    pub width: RegisterWidth,
}

const fn word(name: &'static str, address: u16) -> Parameter {
    Parameter {
        name,
        address,
        width: RegisterWidth::Word,
    }
}

const fn dword(name: &'static str, address: u16) -> Parameter {
    Parameter {
        name,
        address,
        width: RegisterWidth::DoubleWord,
    }
}

/// Immutable parameter map, built once at compile time.
pub static PARAMETERS: &[Parameter] = &[
    // Basic settings (0x0000 - 0x00FF)
    word("control_mode", 0x0002),
    word("gear_ratio_numerator", 0x0006),
    word("gear_ratio_denominator", 0x0007),
    word("reverse_mode", 0x0008),
    word("position_error_limit", 0x000E),
    word("position_error_clear", 0x000F),
    word("mode_switch_selector", 0x002D),
    word("aux_function", 0x0033),
    // Gain adjustment (0x0100 - 0x01FF)
    word("rigidity_level", 0x0100),
    word("auto_tune_mode", 0x0101),
    word("position_loop_gain", 0x0102),
    word("speed_loop_gain", 0x0103),
    word("speed_loop_integral", 0x0104),
    word("inertia_ratio", 0x0105),
    word("torque_filter_time", 0x0108),
    word("gain_switch_mode", 0x010F),
    word("model_follow_enable", 0x0112),
    // Vibration suppression (0x0200 - 0x02FF)
    word("notch1_frequency", 0x0201),
    word("notch1_width", 0x0202),
    word("notch1_depth", 0x0203),
    word("notch2_frequency", 0x0204),
    word("notch2_width", 0x0205),
    word("notch2_depth", 0x0206),
    word("adaptive_filter", 0x020A),
    word("low_freq_suppress", 0x020C),
    // Speed/Torque control (0x0300 - 0x03FF)
    word("speed_command_1", 0x0301),
    word("speed_command_2", 0x0302),
    word("speed_command_3", 0x0303),
    word("torque_limit_1", 0x0315),
    word("torque_limit_2", 0x0316),
    word("acceleration_time", 0x0319),
    word("deceleration_time", 0x031A),
    word("s_curve_time", 0x031B),
    word("speed_reach_range", 0x0322),
    // I/O configuration (0x0400 - 0x04FF)
    word("di1_function", 0x0401),
    word("di2_function", 0x0402),
    word("di3_function", 0x0403),
    word("di4_function", 0x0404),
    word("di5_function", 0x0405),
    word("di6_function", 0x0406),
    word("di7_function", 0x0407),
    word("di8_function", 0x0408),
    word("di9_function", 0x0409),
    word("do1_function", 0x0411),
    word("do2_function", 0x0412),
    word("do3_function", 0x0413),
    word("do4_function", 0x0414),
    word("do5_function", 0x0415),
    word("do6_function", 0x0416),
    word("analog1_offset", 0x0428),
    word("analog1_gain", 0x0429),
    // Extended settings (0x0500 - 0x05FF)
    word("dynamic_brake_mode", 0x0515),
    word("motor_max_speed", 0x0520),
    word("position_range_limit", 0x0530),
    word("software_limit_positive", 0x0531),
    word("software_limit_negative", 0x0532),
    // Special settings (0x0600 - 0x06FF)
    word("gain3_ratio", 0x0606),
    word("friction_comp_forward", 0x0608),
    word("friction_comp_reverse", 0x0609),
    word("absolute_encoder_setup", 0x0660),
    word("multi_turn_limit", 0x067F),
    // PR control block (0x0800 - 0x08FF) and jog registers
    word("pr_control", 0x0800),
    word("pr_status", 0x0801),
    word("pr_error_code", 0x0802),
    word("pr_current_path", 0x0803),
    dword("pr_current_position", 0x0804),
    word("pr_home_mode", 0x080B),
    dword("pr_home_offset", 0x080C),
    word("pr_home_speed_high", 0x080F),
    word("pr_home_speed_low", 0x0810),
    word("pr_jog_speed", 0x6027),
    word("pr_jog_acc", 0x6028),
    word("pr_jog_dec", 0x6029),
    // Status information (0x0B00 - 0x0BFF)
    word("position_error", 0x0B04),
    word("servo_status", 0x0B05),
    word("motor_speed", 0x0B06),
    word("torque_feedback", 0x0B07),
    word("pulse_frequency", 0x0B08),
    word("dc_bus_voltage", 0x0B0A),
    word("driver_temperature", 0x0B0B),
    word("analog_input_1", 0x0B0C),
    word("analog_input_2", 0x0B0D),
    word("di_status", 0x0B11),
    word("do_status", 0x0B12),
    dword("command_position_cmd_unit", 0x0B14),
    dword("motor_position_cmd_unit", 0x0B16),
    dword("command_position", 0x0B1A),
    dword("encoder_position", 0x0B1C),
    word("alarm_code", 0x0B1F),
];

/// Look up a parameter by symbolic name.
pub fn lookup(name: &str) -> Option<&'static Parameter> {
    PARAMETERS.iter().find(|p| p.name == name)
}

// ============================================================================
// PR path geometry and control operations
// ============================================================================

/// Base address of the PR path register blocks
pub const PR_PATH_BASE: u16 = 0x6200;

/// Register stride between consecutive PR path blocks
pub const PR_PATH_SIZE: u16 = 0x10;

/// Number of PR paths the drive stores
pub const PR_PATH_COUNT: u8 = 16;

/// Control-operation register: direct writes dispatch PR paths and stops
pub const CONTROL_OPERATION: u16 = 0x6002;

/// Control-operation value base for immediate path dispatch (`0x0010 | path`)
pub const CTRL_OP_TRIGGER_BASE: u16 = 0x0010;

/// Control-operation value for an emergency-style motion halt
pub const CTRL_OP_EMERGENCY_STOP: u16 = 0x0040;

/// `pr_control` trigger bit for homing (read-modify-write)
pub const PR_CTRL_HOMING_TRIGGER: u16 = 0x0001;

/// `pr_control` trigger bit for jog (read-modify-write)
pub const PR_CTRL_JOG_TRIGGER: u16 = 0x0002;

/// `pr_status` bit set once homing has completed
pub const PR_STATUS_HOMING_DONE: u16 = 0x0001;

/// `pr_status` bit set once the active path has completed
pub const PR_STATUS_PATH_DONE: u16 = 0x0002;

// ============================================================================
// Communication defaults and physical limits
// ============================================================================

pub const DEFAULT_BAUD_RATE: u32 = 38400;
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_SLAVE_ID: u8 = 1;

/// Maximum motor speed in rpm
pub const MAX_SPEED_RPM: u16 = 6500;

/// Maximum acceleration/deceleration time in ms/krpm
pub const MAX_ACCELERATION: u16 = 10000;

/// Rigidity tuning level range
pub const MAX_RIGIDITY_LEVEL: u8 = 31;

/// Torque limit range in percent
pub const MAX_TORQUE_LIMIT: u16 = 300;

// ============================================================================
// Control and homing modes
// ============================================================================

/// Servo control modes (`control_mode` register)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlMode {
    Position = 0x00,
    Speed = 0x01,
    Torque = 0x02,
    PositionSpeed = 0x03,
    PositionTorque = 0x04,
    SpeedTorque = 0x05,
    /// PR path control mode
    Pr = 0x06,
}

/// PR homing modes (`pr_home_mode` register)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HomingMode {
    OriginForward = 0,
    OriginReverse = 1,
    LimitForward = 2,
    LimitReverse = 3,
    TorqueForward = 4,
    TorqueReverse = 5,
}

// ============================================================================
// Digital I/O signal bits
// ============================================================================

/// S-RDY: servo ready output
pub const DO_SRDY: u16 = 0x0001;
/// INP: in-position output
pub const DO_INP: u16 = 0x0002;
/// ALM: alarm output
pub const DO_ALM: u16 = 0x0004;
/// AT-LMT: torque limit reached output
pub const DO_AT_LIMIT: u16 = 0x0008;
/// AT-SPD: speed reached output
pub const DO_AT_SPEED: u16 = 0x0010;
/// BRK-OFF: brake release output
pub const DO_BRAKE_OFF: u16 = 0x0020;

// ============================================================================
// Servo status register bits (`servo_status`, 0x0B05)
// ============================================================================

pub const STATUS_READY: u16 = 0x0001;
pub const STATUS_RUNNING: u16 = 0x0002;
pub const STATUS_FAULT: u16 = 0x0004;
pub const STATUS_HOME_OK: u16 = 0x0008;
pub const STATUS_IN_POSITION: u16 = 0x0010;
pub const STATUS_AT_SPEED: u16 = 0x0020;

/// Render the servo status register as a readable bit summary.
pub fn servo_status_description(status: u16) -> String {
    let mut bits = Vec::new();
    if status & STATUS_READY != 0 {
        bits.push("ready (RDY)");
    }
    if status & STATUS_RUNNING != 0 {
        bits.push("running (RUN)");
    }
    if status & STATUS_FAULT != 0 {
        bits.push("fault (ERR)");
    }
    if status & STATUS_HOME_OK != 0 {
        bits.push("homing complete (HOME_OK)");
    }
    if status & STATUS_IN_POSITION != 0 {
        bits.push("in position (INP)");
    }
    if status & STATUS_AT_SPEED != 0 {
        bits.push("speed reached (AT-SPEED)");
    }

    if bits.is_empty() {
        format!("status 0x{status:04X}")
    } else {
        format!("status 0x{status:04X}: {}", bits.join(", "))
    }
}

// ============================================================================
// Alarm codes
// ============================================================================

/// Register value that the drive reports when no alarm is active.
///
/// Observed device behavior rather than documented: the alarm register idles
/// at 0xFFDC, not 0x0000.
pub const NO_ALARM_SENTINEL: u16 = 0xFFDC;

/// System-status pseudo-alarms: high values the drive reports during normal
/// operation or startup. Observed device behavior; validate against real
/// hardware before extending.
pub const SYSTEM_STATUS_CODES: &[u16] = &[0xFFE0, 0xFFF4, 0xFFFC, 0xFFEC, 0xD06C];

/// Whether an alarm register value denotes a benign state rather than a fault.
pub fn is_benign_alarm(code: u16) -> bool {
    code == 0x0000 || code == NO_ALARM_SENTINEL || SYSTEM_STATUS_CODES.contains(&code)
}

/// Human-readable alarm description.
pub fn alarm_description(code: u16) -> &'static str {
    match code {
        0x00 => "No alarm",
        0x10 => "Over current",
        0x20 => "DC bus over voltage",
        0x21 => "DC bus under voltage",
        0x30 => "Driver overheat",
        0x31 => "Motor overheat",
        0x40 => "Encoder error",
        0x41 => "Encoder communication error",
        0x42 => "Encoder data error",
        0x50 => "Position deviation too large",
        0x60 => "Over speed",
        0x70 => "Overload",
        0x80 => "Communication error",
        0x90 => "Emergency stop input",
        0xA0 => "Parameter error",
        0xB0 => "Motor model mismatch",
        0xC0 => "EEPROM error",
        NO_ALARM_SENTINEL => "No alarm",
        0xFFE0 | 0xFFF4 | 0xFFFC | 0xFFEC => "System status (normal operation)",
        0xD06C => "Initialization status (normal during startup)",
        _ => "Unknown alarm",
    }
}
