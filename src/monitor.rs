//! Background status monitoring
//!
//! A polling thread that samples the drive's status registers, detects
//! transitions, and invokes caller-supplied callbacks. The monitor issues
//! its transactions through the same engine as the caller, so the transport
//! mutex keeps whole transactions from interleaving.
//!
//! Monitor reads always bypass the parameter cache: the point of the thread
//! is fresh device state, and serving it stale values would hide exactly the
//! transitions it exists to detect.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::params::ParameterManager;
use crate::registers::{
    self, DO_AT_LIMIT, DO_AT_SPEED, DO_INP, DO_SRDY,
};

/// Wait after a failed sample before trying again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Bounded wait for the monitor thread to exit on stop
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One logical status sample, read as a group each monitor interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSample {
    pub alarm: u16,
    /// Encoder position in pulses
    pub position: i32,
    /// Motor speed in rpm
    pub speed: i32,
    /// Torque output in percent of rated
    pub torque: i32,
    pub di_status: u16,
    pub do_status: u16,
    /// DC bus voltage in 0.1V units
    pub bus_voltage: u16,
    /// Driver temperature in 0.1°C units
    pub temperature: u16,
}

/// Invoked with the full sample whenever position, speed, or torque changed.
pub type StatusCallback = Box<dyn Fn(&StatusSample) + Send + 'static>;

/// Invoked with the raw alarm register value on every alarm change,
/// including the transition back to the no-alarm sentinel.
pub type AlarmCallback = Box<dyn Fn(u16) + Send + 'static>;

struct MonitorState {
    handle: Option<JoinHandle<()>>,
    stop_tx: Option<Sender<()>>,
}

/// Background status monitor. At most one polling thread per instance.
pub struct StatusMonitor {
    params: Arc<ParameterManager>,
    state: Mutex<MonitorState>,
}

impl StatusMonitor {
    pub fn new(params: Arc<ParameterManager>) -> Self {
        Self {
            params,
            state: Mutex::new(MonitorState {
                handle: None,
                stop_tx: None,
            }),
        }
    }

    /// Start the polling thread.
    ///
    /// Calling while already running is a no-op with a warning. Callbacks
    /// are installed here and owned by the thread for its lifetime.
    pub fn start(
        &self,
        interval: Duration,
        status_callback: Option<StatusCallback>,
        alarm_callback: Option<AlarmCallback>,
    ) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };

        if state
            .handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            warn!("Status monitoring already running");
            return;
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let params = self.params.clone();
        let handle = std::thread::Builder::new()
            .name("servo-monitor".to_string())
            .spawn(move || monitor_loop(params, interval, stop_rx, status_callback, alarm_callback))
            .expect("failed to spawn monitor thread");

        state.handle = Some(handle);
        state.stop_tx = Some(stop_tx);
        info!("Status monitoring started (interval {interval:?})");
    }

    /// Signal the thread to stop and wait for it, bounded.
    ///
    /// A thread that does not exit within the bound is reported and
    /// detached; this is non-fatal.
    pub fn stop(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };

        // Dropping the sender also wakes the receiver
        state.stop_tx.take();

        if let Some(handle) = state.handle.take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
                info!("Status monitoring stopped");
            } else {
                warn!("Monitor thread did not exit within {JOIN_TIMEOUT:?}, detaching");
            }
        }
    }

    /// Whether the polling thread is currently alive.
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .map(|state| {
                state
                    .handle
                    .as_ref()
                    .is_some_and(|handle| !handle.is_finished())
            })
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Synchronous status queries
    // ------------------------------------------------------------------

    /// Raw alarm register value.
    pub fn get_alarm(&self) -> Result<u16> {
        Ok(self.params.read("alarm_code", false)? as u16)
    }

    /// Ready means no active fault alarm and the S-RDY output asserted.
    pub fn is_servo_ready(&self) -> Result<bool> {
        let alarm = self.get_alarm()?;
        if !registers::is_benign_alarm(alarm) {
            return Ok(false);
        }
        let do_status = self.params.read("do_status", false)? as u16;
        Ok(do_status & DO_SRDY != 0)
    }

    pub fn is_in_position(&self) -> Result<bool> {
        let do_status = self.params.read("do_status", false)? as u16;
        Ok(do_status & DO_INP != 0)
    }

    pub fn is_at_speed(&self) -> Result<bool> {
        let do_status = self.params.read("do_status", false)? as u16;
        Ok(do_status & DO_AT_SPEED != 0)
    }

    pub fn is_torque_limited(&self) -> Result<bool> {
        let do_status = self.params.read("do_status", false)? as u16;
        Ok(do_status & DO_AT_LIMIT != 0)
    }

    pub fn get_di_status(&self) -> Result<u16> {
        Ok(self.params.read("di_status", false)? as u16)
    }

    pub fn get_do_status(&self) -> Result<u16> {
        Ok(self.params.read("do_status", false)? as u16)
    }

    /// DC bus voltage in volts.
    pub fn get_bus_voltage(&self) -> Result<f64> {
        Ok(f64::from(self.params.read("dc_bus_voltage", false)?) / 10.0)
    }

    /// Driver temperature in degrees Celsius.
    pub fn get_temperature(&self) -> Result<f64> {
        Ok(f64::from(self.params.read("driver_temperature", false)?) / 10.0)
    }
}

impl Drop for StatusMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Polling loop
// ============================================================================

fn monitor_loop(
    params: Arc<ParameterManager>,
    interval: Duration,
    stop_rx: Receiver<()>,
    status_callback: Option<StatusCallback>,
    alarm_callback: Option<AlarmCallback>,
) {
    let mut last_alarm: Option<u16> = None;
    let mut last_motion: Option<(i32, i32, i32)> = None;

    loop {
        let wait = match read_sample(&params) {
            Ok(sample) => {
                if last_alarm != Some(sample.alarm) {
                    last_alarm = Some(sample.alarm);
                    if !registers::is_benign_alarm(sample.alarm) {
                        warn!(
                            "Alarm active: 0x{:04X} ({})",
                            sample.alarm,
                            registers::alarm_description(sample.alarm)
                        );
                    }
                    if let Some(callback) = &alarm_callback {
                        invoke_guarded("alarm", || callback(sample.alarm));
                    }
                }

                let motion = (sample.position, sample.speed, sample.torque);
                if last_motion != Some(motion) {
                    last_motion = Some(motion);
                    if let Some(callback) = &status_callback {
                        invoke_guarded("status", || callback(&sample));
                    }
                }

                interval
            }
            Err(e) => {
                error!("Monitor sample failed: {e}");
                ERROR_BACKOFF
            }
        };

        // The wait doubles as the stop check; a sender drop or explicit
        // send both end the loop
        match stop_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

/// Read all sample registers as one logical group, bypassing the cache.
fn read_sample(params: &ParameterManager) -> Result<StatusSample> {
    Ok(StatusSample {
        alarm: params.read("alarm_code", false)? as u16,
        position: params.read("encoder_position", false)?,
        speed: params.read("motor_speed", false)?,
        torque: params.read("torque_feedback", false)?,
        di_status: params.read("di_status", false)? as u16,
        do_status: params.read("do_status", false)? as u16,
        bus_voltage: params.read("dc_bus_voltage", false)? as u16,
        temperature: params.read("driver_temperature", false)? as u16,
    })
}

/// Run a callback, logging a panic instead of letting it kill the loop.
fn invoke_guarded(kind: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("{kind} callback panicked");
    }
}
