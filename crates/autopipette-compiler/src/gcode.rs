//! Single-line G-code builders for the Klipper-style firmware dialect.
//!
//! Builders only format text; they never consult machine state.

use autopipette_labware::Coordinate;

/// Format a number without trailing zeros and without `-0`.
pub fn num(value: f64) -> String {
    let text = format!("{value:.3}");
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "-0" | "" => "0".to_string(),
        other => other.to_string(),
    }
}

pub fn absolute() -> String {
    "G90".to_string()
}

pub fn relative() -> String {
    "G91".to_string()
}

pub fn home_z() -> String {
    "G28 Z".to_string()
}

pub fn home_xy() -> String {
    "G28 X Y".to_string()
}

pub fn home_x() -> String {
    "G28 X".to_string()
}

pub fn home_y() -> String {
    "G28 Y".to_string()
}

pub fn move_xy(at: Coordinate, speed: f64) -> String {
    format!("G1 X{} Y{} F{}", num(at.x), num(at.y), num(speed))
}

pub fn move_z(z: f64, speed: f64) -> String {
    format!("G1 Z{} F{}", num(z), num(speed))
}

pub fn move_xyz(x: f64, y: f64, z: f64, speed: f64) -> String {
    format!("G1 X{} Y{} Z{} F{}", num(x), num(y), num(z), num(speed))
}

pub fn dwell(ms: f64) -> String {
    format!("G4 P{}", num(ms))
}

pub fn speed_factor(percent: f64) -> String {
    format!("M220 S{}", num(percent))
}

pub fn velocity_limit(velocity: f64) -> String {
    format!("SET_VELOCITY_LIMIT VELOCITY={}", num(velocity))
}

pub fn accel_limit(accel: f64) -> String {
    format!("SET_VELOCITY_LIMIT ACCEL={}", num(accel))
}

pub fn servo(name: &str, angle: f64) -> String {
    format!("SET_SERVO SERVO={name} ANGLE={}", num(angle))
}

/// Drive the plunger to `position` steps below its home.
pub fn plunger_to(stepper: &str, speed: f64, position: f64) -> String {
    format!(
        "MANUAL_STEPPER STEPPER={stepper} SPEED={} MOVE={} ACCEL=900",
        num(speed),
        num(-position)
    )
}

/// Seek the plunger endstop and zero the stepper there.
pub fn plunger_home(stepper: &str, speed: f64) -> [String; 2] {
    [
        format!(
            "MANUAL_STEPPER STEPPER={stepper} SPEED={} MOVE=50 STOP_ON_ENDSTOP=1 SET_POSITION=0 ACCEL=1000",
            num(speed)
        ),
        format!("MANUAL_STEPPER STEPPER={stepper} SET_POSITION=0"),
    ]
}

pub fn message(text: &str) -> String {
    format!("M117 {text}")
}

pub fn set_pin(pin: &str, on: bool) -> String {
    format!("SET_PIN PIN={pin} VALUE={}", u8::from(on))
}

pub fn comment(text: &str) -> String {
    format!("; {text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_trimmed() {
        assert_eq!(num(100.0), "100");
        assert_eq!(num(9.5), "9.5");
        assert_eq!(num(1.23456), "1.235");
        assert_eq!(num(-0.0001), "0");
        assert_eq!(num(-2.5), "-2.5");
    }

    #[test]
    fn moves_format_axes() {
        let at = Coordinate::new(10.0, 20.5, 3.0);
        assert_eq!(move_xy(at, 3000.0), "G1 X10 Y20.5 F3000");
        assert_eq!(move_z(42.0, 500.0), "G1 Z42 F500");
        assert_eq!(move_xyz(1.0, 0.0, -1.0, 100.0), "G1 X1 Y0 Z-1 F100");
    }

    #[test]
    fn plunger_moves_are_negative() {
        assert_eq!(
            plunger_to("lock_stepper", 30.0, 12.5),
            "MANUAL_STEPPER STEPPER=lock_stepper SPEED=30 MOVE=-12.5 ACCEL=900"
        );
        assert_eq!(
            plunger_to("lock_stepper", 30.0, 0.0),
            "MANUAL_STEPPER STEPPER=lock_stepper SPEED=30 MOVE=0 ACCEL=900"
        );
        let [seek, zero] = plunger_home("lock_stepper", 5.0);
        assert!(seek.contains("STOP_ON_ENDSTOP=1"));
        assert_eq!(zero, "MANUAL_STEPPER STEPPER=lock_stepper SET_POSITION=0");
    }

    #[test]
    fn misc_commands() {
        assert_eq!(set_pin("PA1", true), "SET_PIN PIN=PA1 VALUE=1");
        assert_eq!(set_pin("PA1", false), "SET_PIN PIN=PA1 VALUE=0");
        assert_eq!(dwell(250.0), "G4 P250");
        assert_eq!(servo("my_servo", 80.0), "SET_SERVO SERVO=my_servo ANGLE=80");
        assert_eq!(message("done"), "M117 done");
        assert_eq!(speed_factor(100.0), "M220 S100");
    }
}
