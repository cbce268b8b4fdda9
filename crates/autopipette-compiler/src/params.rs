use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CompilerError, Result};

/// Validated machine parameters the compiler reads while emitting G-code.
///
/// Speeds are in the firmware's units (mm/min for axes, mm/s for the
/// plunger stepper), waits in milliseconds, volumes in microliters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipetteParams {
    pub name_stepper: String,
    pub name_servo: String,

    pub speed_xy: f64,
    pub speed_z: f64,
    pub speed_pipette_down: f64,
    pub speed_pipette_up: f64,
    pub speed_pipette_up_slow: f64,
    /// Percent, 1 to 200.
    pub speed_factor: f64,
    pub velocity_max: f64,
    pub accel_max: f64,

    pub servo_angle_retract: f64,
    pub servo_angle_ready: f64,

    pub wait_movement: f64,
    pub wait_aspirate: f64,
    pub wait_eject: f64,

    /// Largest volume drawn by a single aspirate.
    pub max_vol: f64,
    /// Air cushion drawn before the tip touches liquid.
    pub pre_air: f64,
    /// Trailing air gap drawn after leaving the liquid.
    pub post_air: f64,

    /// Auxiliary output channels: logical name to firmware pin.
    #[serde(default)]
    pub triggers: BTreeMap<String, String>,
}

impl Default for PipetteParams {
    fn default() -> Self {
        Self {
            name_stepper: "lock_stepper".to_string(),
            name_servo: "my_servo".to_string(),
            speed_xy: 10_000.0,
            speed_z: 5_000.0,
            speed_pipette_down: 30.0,
            speed_pipette_up: 30.0,
            speed_pipette_up_slow: 5.0,
            speed_factor: 100.0,
            velocity_max: 4_000.0,
            accel_max: 4_000.0,
            servo_angle_retract: 150.0,
            servo_angle_ready: 80.0,
            wait_movement: 250.0,
            wait_aspirate: 1_000.0,
            wait_eject: 1_000.0,
            max_vol: 100.0,
            pre_air: 0.0,
            post_air: 0.0,
            triggers: BTreeMap::new(),
        }
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(CompilerError::InvalidParams(format!(
            "{name} must be greater than zero, got {value}"
        )))
    }
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(CompilerError::InvalidParams(format!(
            "{name} must not be negative, got {value}"
        )))
    }
}

impl PipetteParams {
    pub fn validate(&self) -> Result<()> {
        if self.name_stepper.trim().is_empty() || self.name_servo.trim().is_empty() {
            return Err(CompilerError::InvalidParams(
                "stepper and servo names must not be empty".to_string(),
            ));
        }
        positive("speed_xy", self.speed_xy)?;
        positive("speed_z", self.speed_z)?;
        positive("speed_pipette_down", self.speed_pipette_down)?;
        positive("speed_pipette_up", self.speed_pipette_up)?;
        positive("speed_pipette_up_slow", self.speed_pipette_up_slow)?;
        if !(1.0..=200.0).contains(&self.speed_factor) {
            return Err(CompilerError::InvalidParams(format!(
                "speed_factor must be between 1 and 200, got {}",
                self.speed_factor
            )));
        }
        positive("velocity_max", self.velocity_max)?;
        positive("accel_max", self.accel_max)?;
        non_negative("servo_angle_ready", self.servo_angle_ready)?;
        non_negative("servo_angle_retract", self.servo_angle_retract)?;
        if self.servo_angle_ready >= self.servo_angle_retract {
            return Err(CompilerError::InvalidParams(format!(
                "servo_angle_ready ({}) must be below servo_angle_retract ({})",
                self.servo_angle_ready, self.servo_angle_retract
            )));
        }
        non_negative("wait_movement", self.wait_movement)?;
        non_negative("wait_aspirate", self.wait_aspirate)?;
        non_negative("wait_eject", self.wait_eject)?;
        positive("max_vol", self.max_vol)?;
        non_negative("pre_air", self.pre_air)?;
        non_negative("post_air", self.post_air)?;
        for (channel, pin) in &self.triggers {
            if pin.trim().is_empty() {
                return Err(CompilerError::InvalidParams(format!(
                    "trigger '{channel}' has no pin"
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, setting: Setting) -> f64 {
        match setting {
            Setting::SpeedXy => self.speed_xy,
            Setting::SpeedZ => self.speed_z,
            Setting::SpeedPipetteDown => self.speed_pipette_down,
            Setting::SpeedPipetteUp => self.speed_pipette_up,
            Setting::SpeedPipetteUpSlow => self.speed_pipette_up_slow,
            Setting::SpeedFactor => self.speed_factor,
            Setting::VelocityMax => self.velocity_max,
            Setting::AccelMax => self.accel_max,
            Setting::ServoAngleRetract => self.servo_angle_retract,
            Setting::ServoAngleReady => self.servo_angle_ready,
            Setting::WaitMovement => self.wait_movement,
            Setting::WaitAspirate => self.wait_aspirate,
            Setting::WaitEject => self.wait_eject,
            Setting::MaxVol => self.max_vol,
            Setting::PreAir => self.pre_air,
            Setting::PostAir => self.post_air,
        }
    }

    /// Return a copy with one setting changed, re-validated.
    pub fn with(&self, setting: Setting, value: f64) -> Result<Self> {
        let mut next = self.clone();
        let slot = match setting {
            Setting::SpeedXy => &mut next.speed_xy,
            Setting::SpeedZ => &mut next.speed_z,
            Setting::SpeedPipetteDown => &mut next.speed_pipette_down,
            Setting::SpeedPipetteUp => &mut next.speed_pipette_up,
            Setting::SpeedPipetteUpSlow => &mut next.speed_pipette_up_slow,
            Setting::SpeedFactor => &mut next.speed_factor,
            Setting::VelocityMax => &mut next.velocity_max,
            Setting::AccelMax => &mut next.accel_max,
            Setting::ServoAngleRetract => &mut next.servo_angle_retract,
            Setting::ServoAngleReady => &mut next.servo_angle_ready,
            Setting::WaitMovement => &mut next.wait_movement,
            Setting::WaitAspirate => &mut next.wait_aspirate,
            Setting::WaitEject => &mut next.wait_eject,
            Setting::MaxVol => &mut next.max_vol,
            Setting::PreAir => &mut next.pre_air,
            Setting::PostAir => &mut next.post_air,
        };
        *slot = value;
        next.validate()?;
        Ok(next)
    }

    /// `name: value` lines describing every parameter, for file headers.
    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![
            format!("name_stepper: {}", self.name_stepper),
            format!("name_servo: {}", self.name_servo),
        ];
        lines.extend(
            Setting::ALL
                .iter()
                .map(|s| format!("{}: {}", s.as_str(), self.get(*s))),
        );
        lines.extend(
            self.triggers
                .iter()
                .map(|(channel, pin)| format!("trigger {channel}: {pin}")),
        );
        lines
    }
}

/// The parameters that may be changed at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    SpeedXy,
    SpeedZ,
    SpeedPipetteDown,
    SpeedPipetteUp,
    SpeedPipetteUpSlow,
    SpeedFactor,
    VelocityMax,
    AccelMax,
    ServoAngleRetract,
    ServoAngleReady,
    WaitMovement,
    WaitAspirate,
    WaitEject,
    MaxVol,
    PreAir,
    PostAir,
}

impl Setting {
    pub const ALL: [Setting; 16] = [
        Self::SpeedXy,
        Self::SpeedZ,
        Self::SpeedPipetteDown,
        Self::SpeedPipetteUp,
        Self::SpeedPipetteUpSlow,
        Self::SpeedFactor,
        Self::VelocityMax,
        Self::AccelMax,
        Self::ServoAngleRetract,
        Self::ServoAngleReady,
        Self::WaitMovement,
        Self::WaitAspirate,
        Self::WaitEject,
        Self::MaxVol,
        Self::PreAir,
        Self::PostAir,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpeedXy => "speed_xy",
            Self::SpeedZ => "speed_z",
            Self::SpeedPipetteDown => "speed_pipette_down",
            Self::SpeedPipetteUp => "speed_pipette_up",
            Self::SpeedPipetteUpSlow => "speed_pipette_up_slow",
            Self::SpeedFactor => "speed_factor",
            Self::VelocityMax => "velocity_max",
            Self::AccelMax => "accel_max",
            Self::ServoAngleRetract => "servo_angle_retract",
            Self::ServoAngleReady => "servo_angle_ready",
            Self::WaitMovement => "wait_movement",
            Self::WaitAspirate => "wait_aspirate",
            Self::WaitEject => "wait_eject",
            Self::MaxVol => "max_vol",
            Self::PreAir => "pre_air",
            Self::PostAir => "post_air",
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Setting {
    type Err = CompilerError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|setting| setting.as_str() == wanted)
            .ok_or_else(|| {
                CompilerError::Validation(format!(
                    "unknown setting '{s}' (expected one of: {})",
                    Self::ALL.map(|s| s.as_str()).join(", ")
                ))
            })
    }
}
