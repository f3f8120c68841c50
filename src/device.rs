//! Narrow seam to the robot's device API.
//!
//! The presentation only ever talks to [`DeviceApi`]; the robot SDK binding
//! lives behind it. [`TracingDevice`] is the headless stand-in used when no
//! robot is attached: every verb is logged and succeeds.

use crate::config::RobotConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{call} failed: {reason}")]
    Call { call: &'static str, reason: String },
    #[error("device session is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pose {
    /// Relative walk: metres forward/left, radians turned.
    Walk { x: f32, y: f32, theta: f32 },
    /// Absolute head angles in radians, interpolated at `speed` (fraction of max).
    Head { yaw: f32, pitch: f32, speed: f32 },
}

impl Pose {
    pub const fn walk(x: f32, y: f32, theta: f32) -> Self {
        Pose::Walk { x, y, theta }
    }

    pub const fn turn(theta: f32) -> Self {
        Pose::Walk { x: 0.0, y: 0.0, theta }
    }

    /// Neutral head position used as the reset gesture.
    pub const HEAD_UP: Pose = Pose::Head {
        yaw: 0.0,
        pitch: -0.3,
        speed: 0.3,
    };
}

/// Verbs the presentation needs from the robot. Implementations must be
/// callable from the act thread and the inbound listener at the same time.
///
/// Calls are made directly on async runtime workers. They must return
/// promptly; a binding whose SDK blocks (speech, motion) has to hand the work
/// to its own thread and only wait for acceptance.
pub trait DeviceApi: Send + Sync {
    /// Language, collision protection, walk arms, wake up.
    fn prepare(&self, language: &str) -> Result<(), DeviceError>;

    fn move_to(&self, pose: Pose) -> Result<(), DeviceError>;

    fn say(&self, line: &str) -> Result<(), DeviceError>;

    fn run_animation(&self, path: &str) -> Result<(), DeviceError>;

    fn run_behavior(&self, name: &str) -> Result<(), DeviceError>;

    fn raise_event(&self, name: &str, subject: &str) -> Result<(), DeviceError>;

    fn insert_value(&self, key: &str, value: &str) -> Result<(), DeviceError>;

    fn rest(&self) -> Result<(), DeviceError>;

    /// Ends the device session.
    fn stop(&self);
}

pub struct TracingDevice {
    endpoint: String,
    stopped: AtomicBool,
}

impl TracingDevice {
    pub fn new(robot: &RobotConfig) -> Self {
        let endpoint = format!("tcp://{}:{}", robot.url, robot.port);
        info!("Device session opened at {}", endpoint);
        Self {
            endpoint,
            stopped: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<(), DeviceError> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(DeviceError::Closed)
        } else {
            Ok(())
        }
    }
}

impl DeviceApi for TracingDevice {
    fn prepare(&self, language: &str) -> Result<(), DeviceError> {
        self.check()?;
        info!(language, "device: prepare");
        Ok(())
    }

    fn move_to(&self, pose: Pose) -> Result<(), DeviceError> {
        self.check()?;
        info!(?pose, "device: move");
        Ok(())
    }

    fn say(&self, line: &str) -> Result<(), DeviceError> {
        self.check()?;
        info!(line, "device: say");
        Ok(())
    }

    fn run_animation(&self, path: &str) -> Result<(), DeviceError> {
        self.check()?;
        info!(path, "device: animation");
        Ok(())
    }

    fn run_behavior(&self, name: &str) -> Result<(), DeviceError> {
        self.check()?;
        info!(name, "device: behavior");
        Ok(())
    }

    fn raise_event(&self, name: &str, subject: &str) -> Result<(), DeviceError> {
        self.check()?;
        info!(name, subject, "device: raise event");
        Ok(())
    }

    fn insert_value(&self, key: &str, value: &str) -> Result<(), DeviceError> {
        self.check()?;
        info!(key, value, "device: insert value");
        Ok(())
    }

    fn rest(&self) -> Result<(), DeviceError> {
        self.check()?;
        info!("device: rest");
        Ok(())
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("Device session at {} stopped", self.endpoint);
        }
    }
}

/// In-memory device that records every call, for tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum DeviceCall {
        Prepare(String),
        Move(Pose),
        Say(String),
        Animation(String),
        Behavior(String),
        RaiseEvent(String, String),
        InsertValue(String, String),
        Rest,
        Stop,
    }

    #[derive(Default)]
    pub struct RecordingDevice {
        calls: Mutex<Vec<DeviceCall>>,
        /// Calls to `say` with this line fail.
        pub failing_line: Option<String>,
    }

    impl RecordingDevice {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_on(line: &str) -> Self {
            Self {
                failing_line: Some(line.to_string()),
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<DeviceCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn spoken(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    DeviceCall::Say(line) => Some(line),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: DeviceCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl DeviceApi for RecordingDevice {
        fn prepare(&self, language: &str) -> Result<(), DeviceError> {
            self.record(DeviceCall::Prepare(language.into()));
            Ok(())
        }

        fn move_to(&self, pose: Pose) -> Result<(), DeviceError> {
            self.record(DeviceCall::Move(pose));
            Ok(())
        }

        fn say(&self, line: &str) -> Result<(), DeviceError> {
            if self.failing_line.as_deref() == Some(line) {
                return Err(DeviceError::Call {
                    call: "say",
                    reason: "speech engine busy".into(),
                });
            }
            self.record(DeviceCall::Say(line.into()));
            Ok(())
        }

        fn run_animation(&self, path: &str) -> Result<(), DeviceError> {
            self.record(DeviceCall::Animation(path.into()));
            Ok(())
        }

        fn run_behavior(&self, name: &str) -> Result<(), DeviceError> {
            self.record(DeviceCall::Behavior(name.into()));
            Ok(())
        }

        fn raise_event(&self, name: &str, subject: &str) -> Result<(), DeviceError> {
            self.record(DeviceCall::RaiseEvent(name.into(), subject.into()));
            Ok(())
        }

        fn insert_value(&self, key: &str, value: &str) -> Result<(), DeviceError> {
            self.record(DeviceCall::InsertValue(key.into(), value.into()));
            Ok(())
        }

        fn rest(&self) -> Result<(), DeviceError> {
            self.record(DeviceCall::Rest);
            Ok(())
        }

        fn stop(&self) {
            self.record(DeviceCall::Stop);
        }
    }
}
