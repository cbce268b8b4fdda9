use std::collections::BTreeMap;

use autopipette_labware::{Coordinate, Plate, PlateKind, TipPool, VolumeConverter, Well};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CompilerError, Result};
use crate::gcode::{self, num};
use crate::params::{PipetteParams, Setting};
use crate::split::{LeftoverPolicy, Split};

/// Volumes closer than this are treated as equal.
pub const VOLUME_EPSILON: f64 = 1e-6;

/// Maximum number of prewet cycles per aspirate.
pub const MAX_PREWET: u8 = 3;

const WIGGLE_MM: f64 = 0.5;
const WIGGLE_CYCLES: usize = 2;
const TOUCH_MM: f64 = 1.0;

/// A named place on the deck.
#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    Point(Coordinate),
    Plate(Plate),
}

/// Physical state tracked alongside the emitted instructions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MachineState {
    pub has_tip: bool,
    pub has_liquid: bool,
    pub homed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AspirateOptions {
    pub row: Option<usize>,
    pub col: Option<usize>,
    /// Wetting cycles before the measured draw, at most [`MAX_PREWET`].
    pub prewet: u8,
    /// Air cushion drawn before touching liquid; defaults to `pre_air`.
    pub extra_air: Option<f64>,
    /// Trailing air gap drawn after leaving the liquid; defaults to `post_air`.
    pub after_air: Option<f64>,
    /// Release the plunger at the slow speed for viscous samples.
    pub serum: bool,
    /// Tip box to pick from when no tip is attached.
    pub tipbox: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DispenseOptions {
    pub row: Option<usize>,
    pub col: Option<usize>,
    /// Cumulative volume that should have left the tip after this dispense.
    pub absolute_target: Option<f64>,
    pub wiggle: bool,
    pub touch: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PipetteOptions {
    pub src_row: Option<usize>,
    pub src_col: Option<usize>,
    pub dest_row: Option<usize>,
    pub dest_col: Option<usize>,
    pub keep_tip: bool,
    pub prewet: u8,
    pub extra_air: Option<f64>,
    pub after_air: Option<f64>,
    pub serum: bool,
    pub wiggle: bool,
    pub touch: bool,
    pub tipbox: Option<String>,
    /// Dispense only this much at the destination.
    pub dispense_volume: Option<f64>,
    /// Distribute one aspirate over several destinations.
    pub splits: Vec<Split>,
    pub leftover: LeftoverPolicy,
}

/// Liquid and air currently held in the tip.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Charge {
    volume: f64,
    pre_air: f64,
    post_air: f64,
    dispensed: f64,
}

/// A resolved location: where to go and which plate well, if any, models it.
#[derive(Debug, Clone)]
struct Target {
    name: String,
    coordinate: Coordinate,
    well: Option<usize>,
}

struct Snapshot {
    params: PipetteParams,
    locations: BTreeMap<String, Location>,
    tips: TipPool,
    waste: Option<String>,
    state: MachineState,
    charge: Option<Charge>,
    plunger: f64,
    buffered: usize,
}

/// Compiles pipetting operations into G-code for one machine.
///
/// Operations append to an instruction buffer and never transmit. Each public
/// operation is atomic: if it fails, locations, tips, state and the buffer
/// are exactly as they were before the call. The compiler is not internally
/// synchronized; callers serialize access.
#[derive(Debug, Clone)]
pub struct AutoPipette {
    params: PipetteParams,
    converter: VolumeConverter,
    source: String,
    locations: BTreeMap<String, Location>,
    tips: TipPool,
    waste: Option<String>,
    state: MachineState,
    charge: Option<Charge>,
    /// Plunger position in steps below home.
    plunger: f64,
    instructions: Vec<String>,
    header: Vec<String>,
}

impl AutoPipette {
    /// Build a compiler from validated parameters and a calibration.
    ///
    /// `source` names where the parameters came from, for the file header.
    pub fn new(
        params: PipetteParams,
        converter: VolumeConverter,
        source: impl Into<String>,
    ) -> Result<Self> {
        params.validate()?;
        let mut pipette = Self {
            params,
            converter,
            source: source.into(),
            locations: BTreeMap::new(),
            tips: TipPool::new(),
            waste: None,
            state: MachineState::default(),
            charge: None,
            plunger: 0.0,
            instructions: Vec::new(),
            header: Vec::new(),
        };
        pipette.header = pipette.build_header();
        Ok(pipette)
    }

    /// Swap in a new configuration, clearing the deck, state and buffers.
    pub fn reload(
        &mut self,
        params: PipetteParams,
        converter: VolumeConverter,
        source: impl Into<String>,
    ) -> Result<()> {
        *self = Self::new(params, converter, source)?;
        info!(source = %self.source, "configuration reloaded");
        Ok(())
    }

    pub fn params(&self) -> &PipetteParams {
        &self.params
    }

    pub fn converter(&self) -> &VolumeConverter {
        &self.converter
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Volume still held in the tip, if any.
    pub fn held_volume(&self) -> Option<f64> {
        self.charge.map(|c| c.volume - c.dispensed)
    }

    // ----- buffers -----

    pub fn instructions(&self) -> &[String] {
        &self.instructions
    }

    /// Drain the instruction buffer.
    pub fn take_instructions(&mut self) -> Vec<String> {
        std::mem::take(&mut self.instructions)
    }

    /// Drain the header buffer; later calls return nothing until a reload.
    pub fn take_header(&mut self) -> Vec<String> {
        std::mem::take(&mut self.header)
    }

    /// The configuration summary and init sequence, regenerated on demand.
    pub fn header(&self) -> Vec<String> {
        self.build_header()
    }

    fn build_header(&self) -> Vec<String> {
        let mut lines = vec![gcode::comment(&format!(
            "AutoPipette settings loaded from {}",
            self.source
        ))];
        lines.extend(self.params.summary().iter().map(|l| gcode::comment(l)));
        lines.push(gcode::absolute());
        lines.push(gcode::speed_factor(self.params.speed_factor));
        lines.push(gcode::velocity_limit(self.params.velocity_max));
        lines.push(gcode::accel_limit(self.params.accel_max));
        lines.push(gcode::home_z());
        lines.push(gcode::home_xy());
        lines.push(gcode::servo(
            &self.params.name_servo,
            self.params.servo_angle_retract,
        ));
        lines.extend(gcode::plunger_home(
            &self.params.name_stepper,
            self.params.speed_pipette_up_slow,
        ));
        lines
    }

    fn emit(&mut self, line: String) {
        self.instructions.push(line);
    }

    // ----- atomicity -----

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            params: self.params.clone(),
            locations: self.locations.clone(),
            tips: self.tips.clone(),
            waste: self.waste.clone(),
            state: self.state,
            charge: self.charge,
            plunger: self.plunger,
            buffered: self.instructions.len(),
        }
    }

    fn restore(&mut self, snap: Snapshot) {
        self.params = snap.params;
        self.locations = snap.locations;
        self.tips = snap.tips;
        self.waste = snap.waste;
        self.state = snap.state;
        self.charge = snap.charge;
        self.plunger = snap.plunger;
        self.instructions.truncate(snap.buffered);
    }

    fn atomic<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let snap = self.snapshot();
        let result = op(self);
        if let Err(err) = &result {
            debug!(error = %err, "operation rejected, state restored");
            self.restore(snap);
        }
        result
    }

    // ----- deck -----

    /// Register a bare coordinate, replacing any location with that name.
    pub fn add_location(&mut self, name: &str, coordinate: Coordinate) -> Result<()> {
        self.atomic(|p| {
            check_name(name)?;
            if !coordinate.is_finite() {
                return Err(CompilerError::Validation(format!(
                    "coordinate {coordinate} is not finite"
                )));
            }
            p.forget(name)?;
            p.locations
                .insert(name.to_string(), Location::Point(coordinate));
            debug!(name, %coordinate, "location added");
            Ok(())
        })
    }

    /// Register a plate. Tip boxes join the tip pool and a waste container
    /// becomes the disposal target.
    pub fn add_plate(&mut self, name: &str, plate: Plate) -> Result<()> {
        self.atomic(|p| {
            check_name(name)?;
            p.forget(name)?;
            match plate.kind() {
                PlateKind::TipBox => p.tips.register(name, &plate)?,
                PlateKind::WasteContainer => p.waste = Some(name.to_string()),
                PlateKind::Array | PlateKind::Singleton => {}
            }
            debug!(name, kind = %plate.kind(), wells = plate.len(), "plate added");
            p.locations.insert(name.to_string(), Location::Plate(plate));
            Ok(())
        })
    }

    fn forget(&mut self, name: &str) -> Result<()> {
        if self.locations.remove(name).is_some() {
            self.tips.unregister(name)?;
            if self.waste.as_deref() == Some(name) {
                self.waste = None;
            }
        }
        Ok(())
    }

    pub fn location(&self, name: &str) -> Option<&Location> {
        self.locations.get(name)
    }

    pub fn locations(&self) -> impl Iterator<Item = (&str, &Location)> {
        self.locations.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn plate_names(&self) -> impl Iterator<Item = &str> {
        self.locations.iter().filter_map(|(k, v)| match v {
            Location::Plate(_) => Some(k.as_str()),
            Location::Point(_) => None,
        })
    }

    pub fn has_tip_source(&self) -> bool {
        self.tips.active().is_some() || self.tips.pooled().is_some()
    }

    pub fn has_waste(&self) -> bool {
        self.waste.is_some()
    }

    /// Pin a tip box as the default tip source, or return to the pool.
    pub fn set_active_tipbox(&mut self, name: Option<&str>) -> Result<()> {
        if let Some(name) = name {
            match self.locations.get(name) {
                None => return Err(CompilerError::NotALocation(name.to_string())),
                Some(Location::Plate(plate)) if plate.kind() == PlateKind::TipBox => {}
                Some(_) => return Err(CompilerError::NotATipBox(name.to_string())),
            }
        }
        self.tips.pin(name.map(str::to_string));
        info!(active = ?name, "tip source selected");
        Ok(())
    }

    pub fn active_tipbox(&self) -> Option<&str> {
        self.tips.active()
    }

    /// Rewind a plate's cursor and restore its wells' dip depths.
    ///
    /// The pooled tip view keeps its own cursor; only
    /// [`AutoPipette::reset_all_plates`] rewinds it.
    pub fn reset_plate(&mut self, name: &str) -> Result<()> {
        self.atomic(|p| {
            let plate = match p.locations.get_mut(name) {
                None => return Err(CompilerError::NotALocation(name.to_string())),
                Some(Location::Point(_)) => {
                    return Err(CompilerError::Validation(format!(
                        "'{name}' is a coordinate, not a plate"
                    )))
                }
                Some(Location::Plate(plate)) => plate,
            };
            plate.reset();
            Ok(())
        })
    }

    pub fn reset_all_plates(&mut self) {
        for location in self.locations.values_mut() {
            if let Location::Plate(plate) = location {
                plate.reset();
            }
        }
        self.tips.refill();
    }

    /// Forget the tracked tip, liquid and homing state.
    pub fn reset_state(&mut self) {
        self.state = MachineState::default();
        self.charge = None;
        self.plunger = 0.0;
        info!("machine state reset");
    }

    // ----- conversions and settings -----

    /// Plunger steps for `volume` per the fitted calibration.
    pub fn vol_to_steps(&self, volume: f64) -> Result<f64> {
        check_volume(volume)?;
        Ok(self.converter.vol_to_steps(volume))
    }

    pub fn steps_to_vol(&self, steps: f64) -> Result<f64> {
        Ok(self.converter.steps_to_vol(steps)?)
    }

    /// Plunger travel from home for `volume`, anchored so zero volume is home.
    fn travel(&self, volume: f64) -> f64 {
        (self.converter.vol_to_steps(volume) - self.converter.vol_to_steps(0.0)).max(0.0)
    }

    /// Change one parameter. Speed factor and velocity/accel ceilings are
    /// also pushed to the firmware.
    pub fn set(&mut self, setting: Setting, value: f64) -> Result<()> {
        self.atomic(|p| {
            p.params = p.params.with(setting, value)?;
            match setting {
                Setting::SpeedFactor => p.emit(gcode::speed_factor(value)),
                Setting::VelocityMax => p.emit(gcode::velocity_limit(value)),
                Setting::AccelMax => p.emit(gcode::accel_limit(value)),
                _ => {}
            }
            info!(setting = %setting, value, "setting changed");
            Ok(())
        })
    }

    // ----- motion -----

    /// Home Z first, then X and Y, then the pipette motors.
    pub fn home_all(&mut self) {
        self.emit(gcode::home_z());
        self.emit(gcode::home_xy());
        self.home_pipette();
        self.state.homed = true;
    }

    pub fn home_x(&mut self) {
        self.emit(gcode::home_x());
    }

    pub fn home_y(&mut self) {
        self.emit(gcode::home_y());
    }

    pub fn home_z(&mut self) {
        self.emit(gcode::home_z());
    }

    /// Retract the ejector servo and seek the plunger endstop.
    pub fn home_pipette(&mut self) {
        self.home_servo();
        self.home_plunger(self.params.speed_pipette_up_slow);
    }

    pub fn home_servo(&mut self) {
        let line = gcode::servo(&self.params.name_servo, self.params.servo_angle_retract);
        self.emit(line);
    }

    fn home_plunger(&mut self, speed: f64) {
        let lines = gcode::plunger_home(&self.params.name_stepper, speed);
        self.instructions.extend(lines);
        self.plunger = 0.0;
    }

    fn plunger_to(&mut self, position: f64, speed: f64) {
        let line = gcode::plunger_to(&self.params.name_stepper, speed, position);
        self.emit(line);
        self.plunger = position;
    }

    fn wait(&mut self, ms: f64) {
        if ms > 0.0 {
            self.emit(gcode::dwell(ms));
        }
    }

    /// XY move at the XY speed, then a separate Z move at the Z speed.
    pub fn move_to(&mut self, at: Coordinate) -> Result<()> {
        if !at.is_finite() {
            return Err(CompilerError::Validation(format!(
                "coordinate {at} is not finite"
            )));
        }
        self.emit(gcode::move_xy(at, self.params.speed_xy));
        self.emit(gcode::move_z(at.z, self.params.speed_z));
        Ok(())
    }

    pub fn move_relative(&mut self, dx: f64, dy: f64, dz: f64) -> Result<()> {
        if !(dx.is_finite() && dy.is_finite() && dz.is_finite()) {
            return Err(CompilerError::Validation(
                "relative move must be finite".to_string(),
            ));
        }
        self.emit(gcode::relative());
        self.emit(gcode::move_xyz(dx, dy, dz, self.params.speed_xy));
        self.emit(gcode::absolute());
        Ok(())
    }

    /// Move to a named location; plates advance their cursor unless a well
    /// is addressed.
    pub fn move_to_location(
        &mut self,
        name: &str,
        row: Option<usize>,
        col: Option<usize>,
    ) -> Result<()> {
        self.atomic(|p| {
            let target = p.resolve(name, row, col)?;
            p.move_to(target.coordinate)
        })
    }

    fn dip_down(&mut self, depth: f64) {
        self.emit(gcode::move_z(depth, self.params.speed_z));
        self.wait(self.params.wait_movement);
    }

    fn dip_return(&mut self, at: Coordinate) {
        self.emit(gcode::move_z(at.z, self.params.speed_z));
        self.wait(self.params.wait_movement);
    }

    // ----- resolution -----

    fn resolve(&mut self, name: &str, row: Option<usize>, col: Option<usize>) -> Result<Target> {
        let location = self
            .locations
            .get_mut(name)
            .ok_or_else(|| CompilerError::NotALocation(name.to_string()))?;
        match location {
            Location::Point(coordinate) => {
                if row.is_some() || col.is_some() {
                    return Err(CompilerError::Validation(format!(
                        "'{name}' is a coordinate; row and column do not apply"
                    )));
                }
                Ok(Target {
                    name: name.to_string(),
                    coordinate: *coordinate,
                    well: None,
                })
            }
            Location::Plate(plate) => {
                let idx = match (row, col) {
                    (Some(r), Some(c)) => plate.index_of(r, c)?,
                    (None, None) => plate.next_index(),
                    _ => {
                        return Err(CompilerError::Validation(
                            "row and column must be given together".to_string(),
                        ))
                    }
                };
                let coordinate = plate
                    .well(idx)
                    .map(Well::coordinate)
                    .ok_or_else(|| CompilerError::Validation(format!("'{name}' has no well {idx}")))?;
                Ok(Target {
                    name: name.to_string(),
                    coordinate,
                    well: Some(idx),
                })
            }
        }
    }

    fn well_mut(&mut self, target: &Target) -> Option<&mut Well> {
        match self.locations.get_mut(&target.name) {
            Some(Location::Plate(plate)) => target.well.and_then(|i| plate.well_mut(i)),
            _ => None,
        }
    }

    fn tip_target(&mut self, box_name: Option<&str>) -> Result<(Coordinate, f64)> {
        let name = box_name.map(str::to_string).or_else(|| self.tips.active().map(str::to_string));
        let plate = match name {
            Some(name) => match self.locations.get_mut(&name) {
                None => return Err(CompilerError::NotALocation(name)),
                Some(Location::Plate(plate)) if plate.kind() == PlateKind::TipBox => plate,
                Some(_) => return Err(CompilerError::NotATipBox(name)),
            },
            None => self.tips.pooled_mut().ok_or(CompilerError::NoTipbox)?,
        };
        let idx = plate.next_index();
        let well = plate
            .well(idx)
            .ok_or_else(|| CompilerError::Validation("tip box is empty".to_string()))?;
        Ok((well.coordinate(), well.dip_top()))
    }

    fn waste_target(&mut self) -> Result<Target> {
        let name = self.waste.clone().ok_or(CompilerError::NoWasteContainer)?;
        self.resolve(&name, None, None)
    }

    // ----- tips -----

    /// Pick up the next tip from `box_name`, the pinned box, or the pool.
    pub fn next_tip(&mut self, box_name: Option<&str>) -> Result<()> {
        self.atomic(|p| p.pick_tip(box_name))
    }

    fn pick_tip(&mut self, box_name: Option<&str>) -> Result<()> {
        if self.state.has_tip {
            return Err(CompilerError::TipAlreadyOn);
        }
        let (at, depth) = self.tip_target(box_name)?;
        self.emit(gcode::comment("pick up tip"));
        self.move_to(at)?;
        self.dip_down(depth);
        self.dip_return(at);
        self.state.has_tip = true;
        debug!(%at, "tip attached");
        Ok(())
    }

    /// Cycle the ejector servo. Whatever was in the tip leaves with it.
    pub fn eject_tip(&mut self) {
        let servo = self.params.name_servo.clone();
        self.emit(gcode::comment("eject tip"));
        self.emit(gcode::servo(&servo, self.params.servo_angle_retract));
        self.emit(gcode::servo(&servo, self.params.servo_angle_ready));
        self.wait(self.params.wait_eject);
        self.emit(gcode::servo(&servo, self.params.servo_angle_retract));
        self.wait(self.params.wait_movement);
        self.state.has_tip = false;
        self.state.has_liquid = false;
        self.charge = None;
    }

    /// Eject the tip over the waste container.
    pub fn dispose_tip(&mut self) -> Result<()> {
        self.atomic(|p| p.dispose())
    }

    fn dispose(&mut self) -> Result<()> {
        let target = self.waste_target()?;
        let depth = self.well_mut(&target).map(|w| w.dip_top());
        self.move_to(target.coordinate)?;
        if let Some(depth) = depth {
            self.dip_down(depth);
        }
        self.eject_tip();
        self.dip_return(target.coordinate);
        if self.plunger > 0.0 {
            self.home_plunger(self.params.speed_pipette_up);
        }
        Ok(())
    }

    // ----- liquid handling -----

    /// Draw `volume` from `source` into the tip.
    pub fn aspirate(&mut self, volume: f64, source: &str, opts: &AspirateOptions) -> Result<()> {
        self.atomic(|p| {
            p.check_aspirate(volume, opts)?;
            let target = p.resolve(source, opts.row, opts.col)?;
            p.aspirate_at(volume, &target, opts)
        })
    }

    fn check_aspirate(&self, volume: f64, opts: &AspirateOptions) -> Result<()> {
        check_volume(volume)?;
        if let Some(air) = opts.extra_air {
            check_volume(air)?;
        }
        if let Some(air) = opts.after_air {
            check_volume(air)?;
        }
        if opts.prewet > MAX_PREWET {
            return Err(CompilerError::Validation(format!(
                "at most {MAX_PREWET} prewet cycles are allowed, got {}",
                opts.prewet
            )));
        }
        if volume > self.params.max_vol + VOLUME_EPSILON {
            return Err(CompilerError::Validation(format!(
                "cannot aspirate {} uL in one draw (max_vol is {})",
                num(volume),
                num(self.params.max_vol)
            )));
        }
        if self.state.has_liquid {
            return Err(CompilerError::LiquidInTip);
        }
        Ok(())
    }

    fn aspirate_at(&mut self, volume: f64, target: &Target, opts: &AspirateOptions) -> Result<()> {
        if !self.state.has_tip {
            self.pick_tip(opts.tipbox.as_deref())?;
        }
        let pre_air = opts.extra_air.unwrap_or(self.params.pre_air);
        let post_air = opts.after_air.unwrap_or(self.params.post_air);
        let down = self.params.speed_pipette_down;
        let up = self.params.speed_pipette_up;
        let release = if opts.serum {
            self.params.speed_pipette_up_slow
        } else {
            up
        };

        self.emit(gcode::comment(&format!(
            "aspirate {} uL from {}",
            num(volume),
            target.name
        )));
        self.move_to(target.coordinate)?;

        // Empty the tip above the liquid, then draw the cushion in air.
        let loaded = self.travel(pre_air + volume + post_air);
        self.plunger_to(loaded, down);
        if pre_air > 0.0 {
            let cushioned = self.travel(volume + post_air);
            self.plunger_to(cushioned, up);
        }

        let depth = self
            .well_mut(target)
            .map(|well| well.get_dip_distance(volume));
        if let Some(depth) = depth {
            self.dip_down(depth);
        }

        let drawn = self.travel(post_air);
        let full = self.travel(volume + post_air);
        for _ in 0..opts.prewet {
            self.plunger_to(drawn, release);
            self.wait(self.params.wait_aspirate);
            self.plunger_to(full, down);
            self.wait(self.params.wait_aspirate);
        }

        self.plunger_to(drawn, release);
        self.wait(self.params.wait_aspirate);
        self.dip_return(target.coordinate);
        if post_air > 0.0 {
            self.plunger_to(0.0, up);
        }

        self.state.has_liquid = true;
        self.charge = Some(Charge {
            volume,
            pre_air,
            post_air,
            dispensed: 0.0,
        });
        debug!(volume, source = %target.name, pre_air, post_air, "aspirated");
        Ok(())
    }

    /// Expel liquid at `dest`.
    ///
    /// Without an absolute target the whole charge is expelled. With one,
    /// the plunger is driven to the position where that cumulative volume
    /// has left the tip, so several dispenses can share one aspirate.
    pub fn dispense(&mut self, volume: f64, dest: &str, opts: &DispenseOptions) -> Result<()> {
        self.atomic(|p| {
            check_volume(volume)?;
            p.check_dispense(volume, opts.absolute_target)?;
            let target = p.resolve(dest, opts.row, opts.col)?;
            p.dispense_at(&target, opts)
        })
    }

    fn check_dispense(&self, volume: f64, absolute_target: Option<f64>) -> Result<()> {
        if !self.state.has_tip {
            return Err(CompilerError::NoTip);
        }
        let charge = match self.charge {
            Some(charge) if self.state.has_liquid => charge,
            _ => return Err(CompilerError::NoLiquid),
        };
        let remaining = charge.volume - charge.dispensed;
        match absolute_target {
            Some(goal) => {
                check_volume(goal)?;
                if goal > charge.volume + VOLUME_EPSILON {
                    return Err(CompilerError::Validation(format!(
                        "absolute target {} uL exceeds the aspirated {} uL",
                        num(goal),
                        num(charge.volume)
                    )));
                }
            }
            None if volume > remaining + VOLUME_EPSILON => {
                return Err(CompilerError::Validation(format!(
                    "cannot dispense {} uL, the tip holds {} uL",
                    num(volume),
                    num(remaining)
                )));
            }
            None if volume < remaining - VOLUME_EPSILON => {
                warn!(
                    requested = volume,
                    held = remaining,
                    "dispense without an absolute target expels the whole charge"
                );
            }
            None => {}
        }
        Ok(())
    }

    /// Drive the plunger for one dispense and report what actually left the tip.
    fn dispense_at(&mut self, target: &Target, opts: &DispenseOptions) -> Result<()> {
        let charge = self.charge.ok_or(CompilerError::NoLiquid)?;
        let full = self.travel(charge.pre_air + charge.volume + charge.post_air);

        // The plunger only ever moves down while dispensing from one charge.
        let (position, delivered) = match opts.absolute_target {
            Some(goal) => {
                let goal_position = if (goal - charge.volume).abs() <= VOLUME_EPSILON {
                    full
                } else {
                    self.travel(charge.post_air + goal)
                };
                let position = goal_position.clamp(self.plunger, full.max(self.plunger));
                (position, goal.max(charge.dispensed))
            }
            None => (full, charge.volume),
        };
        let emptied = (delivered - charge.volume).abs() <= VOLUME_EPSILON;
        let moved = delivered - charge.dispensed;

        self.emit(gcode::comment(&format!(
            "dispense {} uL to {}",
            num(moved),
            target.name
        )));
        self.move_to(target.coordinate)?;
        let depth = self
            .well_mut(target)
            .map(|well| well.dispense_dip_distance(moved));
        if let Some(depth) = depth {
            self.dip_down(depth);
        }
        let working = depth.unwrap_or(target.coordinate.z);

        self.plunger_to(position, self.params.speed_pipette_down);
        self.wait(self.params.wait_aspirate);
        if opts.wiggle {
            self.wiggle(working);
        }
        if opts.touch {
            self.touch(working, target.coordinate.z);
        }
        self.dip_return(target.coordinate);

        if emptied {
            self.home_plunger(self.params.speed_pipette_up);
            self.state.has_liquid = false;
            self.charge = None;
        } else {
            self.charge = Some(Charge {
                dispensed: delivered,
                ..charge
            });
        }
        debug!(volume = moved, dest = %target.name, emptied, "dispensed");
        Ok(())
    }

    /// Small Z oscillation around the working depth.
    fn wiggle(&mut self, depth: f64) {
        let speed = self.params.speed_z;
        for _ in 0..WIGGLE_CYCLES {
            self.emit(gcode::move_z(depth + WIGGLE_MM, speed));
            self.emit(gcode::move_z((depth - WIGGLE_MM).max(0.0), speed));
        }
        self.emit(gcode::move_z(depth, speed));
    }

    /// Back off 1 mm toward travel height and hold to shed a hanging drop.
    fn touch(&mut self, depth: f64, travel: f64) {
        let raised = if travel < depth {
            depth - TOUCH_MM
        } else {
            depth + TOUCH_MM
        };
        self.emit(gcode::move_z(raised.max(0.0), self.params.speed_z));
        self.wait(self.params.wait_movement);
    }

    /// Transfer `volume` from `source` to `dest`.
    ///
    /// Volumes above `max_vol` are moved in full-capacity chunks plus a
    /// remainder. With splits (or `dispense_volume`, a one-leg split) one
    /// aspirate feeds every leg and the leftover follows `opts.leftover`.
    pub fn pipette(
        &mut self,
        volume: f64,
        source: &str,
        dest: &str,
        opts: &PipetteOptions,
    ) -> Result<()> {
        self.atomic(|p| {
            check_volume(volume)?;
            let legs = p.plan_legs(volume, dest, opts)?;
            if volume <= 0.0 {
                debug!(source, dest, "nothing to transfer");
                return Ok(());
            }
            let keep_tip = opts.keep_tip
                || matches!(&legs, Some(legs) if opts.leftover == LeftoverPolicy::Keep
                    && legs.iter().map(|s| s.volume).sum::<f64>() < volume - VOLUME_EPSILON);
            if !keep_tip && p.waste.is_none() {
                return Err(CompilerError::NoWasteContainer);
            }
            if p.state.has_liquid {
                return Err(CompilerError::LiquidInTip);
            }

            let asp = AspirateOptions {
                row: opts.src_row,
                col: opts.src_col,
                prewet: opts.prewet,
                extra_air: opts.extra_air,
                after_air: opts.after_air,
                serum: opts.serum,
                tipbox: opts.tipbox.clone(),
            };
            let src = p.resolve(source, opts.src_row, opts.src_col)?;

            match legs {
                Some(legs) => p.transfer_split(volume, &src, &legs, opts, &asp)?,
                None => {
                    let dst = p.resolve(dest, opts.dest_row, opts.dest_col)?;
                    let disp = DispenseOptions {
                        wiggle: opts.wiggle,
                        touch: opts.touch,
                        ..DispenseOptions::default()
                    };
                    for chunk in chunk_volumes(volume, p.params.max_vol)? {
                        p.check_aspirate(chunk, &asp)?;
                        p.aspirate_at(chunk, &src, &asp)?;
                        p.dispense_at(&dst, &disp)?;
                    }
                }
            }

            if !keep_tip {
                p.dispose()?;
            }
            info!(volume, source, dest, keep_tip, "transfer compiled");
            Ok(())
        })
    }

    /// Validate split legs before anything moves.
    fn plan_legs(&self, volume: f64, dest: &str, opts: &PipetteOptions) -> Result<Option<Vec<Split>>> {
        let legs = match (opts.splits.is_empty(), opts.dispense_volume) {
            (true, None) => return Ok(None),
            (false, Some(_)) => {
                return Err(CompilerError::Validation(
                    "use either splits or dispense_volume, not both".to_string(),
                ))
            }
            (false, None) => opts.splits.clone(),
            (true, Some(partial)) => vec![Split {
                destination: dest.to_string(),
                volume: partial,
                row: opts.dest_row,
                col: opts.dest_col,
            }],
        };
        let mut total = 0.0;
        for leg in &legs {
            check_volume(leg.volume)?;
            if !self.locations.contains_key(&leg.destination) {
                return Err(CompilerError::NotALocation(leg.destination.clone()));
            }
            total += leg.volume;
        }
        if total - volume > VOLUME_EPSILON {
            return Err(CompilerError::Validation(format!(
                "splits total {} uL but only {} uL is aspirated",
                num(total),
                num(volume)
            )));
        }
        if volume > self.params.max_vol + VOLUME_EPSILON {
            return Err(CompilerError::Validation(format!(
                "split transfers draw once; {} uL exceeds max_vol {}",
                num(volume),
                num(self.params.max_vol)
            )));
        }
        Ok(Some(legs))
    }

    fn transfer_split(
        &mut self,
        volume: f64,
        src: &Target,
        legs: &[Split],
        opts: &PipetteOptions,
        asp: &AspirateOptions,
    ) -> Result<()> {
        self.check_aspirate(volume, asp)?;
        self.aspirate_at(volume, src, asp)?;

        let mut cumulative = 0.0;
        for leg in legs {
            cumulative += leg.volume;
            let dst = self.resolve(&leg.destination, leg.row, leg.col)?;
            let disp = DispenseOptions {
                row: leg.row,
                col: leg.col,
                absolute_target: Some(cumulative.min(volume)),
                wiggle: opts.wiggle,
                touch: opts.touch,
            };
            self.dispense_at(&dst, &disp)?;
        }

        let leftover = volume - cumulative;
        if leftover > VOLUME_EPSILON {
            let back = DispenseOptions {
                absolute_target: Some(volume),
                ..DispenseOptions::default()
            };
            match opts.leftover {
                LeftoverPolicy::Keep => {
                    debug!(leftover, "leftover kept in tip");
                }
                LeftoverPolicy::Waste => {
                    let waste = self.waste_target()?;
                    self.dispense_at(&waste, &back)?;
                }
                LeftoverPolicy::Source => {
                    self.dispense_at(src, &back)?;
                }
            }
        }
        Ok(())
    }

    // ----- auxiliary -----

    /// Switch an auxiliary output channel.
    pub fn set_trigger(&mut self, channel: &str, on: bool) -> Result<()> {
        let pin = self.params.triggers.get(channel).cloned().ok_or_else(|| {
            CompilerError::Validation(format!("unknown trigger channel '{channel}'"))
        })?;
        self.emit(gcode::set_pin(&pin, on));
        Ok(())
    }

    /// Show a message on the machine display.
    pub fn print_message(&mut self, message: &str) -> Result<()> {
        if message.contains(['\n', '\r']) {
            return Err(CompilerError::Validation(
                "message must fit on one line".to_string(),
            ));
        }
        self.emit(gcode::message(message));
        Ok(())
    }
}

fn check_volume(volume: f64) -> Result<()> {
    if volume.is_finite() && volume >= 0.0 {
        Ok(())
    } else {
        Err(CompilerError::InvalidVolume(volume))
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(CompilerError::Validation(format!(
            "location name '{name}' must be a single non-empty word"
        )));
    }
    Ok(())
}

/// Most aspirate/dispense cycles a single transfer may compile to.
pub const MAX_TRANSFER_CHUNKS: usize = 10_000;

/// Split `volume` into `max`-sized chunks plus a remainder.
///
/// Fails when the transfer would need more than [`MAX_TRANSFER_CHUNKS`]
/// cycles.
pub fn chunk_volumes(volume: f64, max: f64) -> Result<Vec<f64>> {
    if volume <= VOLUME_EPSILON || max <= 0.0 {
        return Ok(Vec::new());
    }
    let count = ((volume - VOLUME_EPSILON) / max).ceil();
    if !count.is_finite() || count > MAX_TRANSFER_CHUNKS as f64 {
        return Err(CompilerError::Validation(format!(
            "transferring {} uL with a {} uL pipette needs more than {MAX_TRANSFER_CHUNKS} cycles",
            num(volume),
            num(max)
        )));
    }
    let count = count as usize;
    Ok((0..count)
        .map(|i| max.min(volume - i as f64 * max))
        .collect())
}

/// Join instructions into newline-terminated G-code text.
pub fn to_gcode<S: AsRef<str>>(lines: &[S]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopipette_labware::{PlateSpec, DipStrategy};

    fn pipette() -> AutoPipette {
        let mut p = AutoPipette::new(
            PipetteParams::default(),
            VolumeConverter::default(),
            "unit-test",
        )
        .expect("default params are valid");
        let tips = PlateSpec {
            kind: PlateKind::TipBox,
            rows: 2,
            cols: 2,
            spacing_row: 9.0,
            spacing_col: 9.0,
            dip_top: 40.0,
            dip_btm: None,
            diameter: None,
            strategy: DipStrategy::Simple,
        };
        let waste = PlateSpec {
            kind: PlateKind::WasteContainer,
            dip_top: 10.0,
            ..tips.clone()
        };
        p.add_plate("tips", tips.build(Coordinate::new(200.0, 10.0, 0.0)).expect("tips"))
            .expect("add tips");
        p.add_plate("waste", waste.build(Coordinate::new(300.0, 10.0, 0.0)).expect("waste"))
            .expect("add waste");
        p.add_location("a", Coordinate::new(10.0, 10.0, 5.0)).expect("add a");
        p.add_location("b", Coordinate::new(20.0, 10.0, 5.0)).expect("add b");
        p
    }

    #[test]
    fn header_starts_with_source_and_homes() {
        let mut p = pipette();
        let header = p.take_header();
        assert_eq!(header[0], "; AutoPipette settings loaded from unit-test");
        assert!(header.contains(&"G90".to_string()));
        let z = header.iter().position(|l| l == "G28 Z").expect("z homed");
        let xy = header.iter().position(|l| l == "G28 X Y").expect("xy homed");
        assert!(z < xy);
        assert!(p.take_header().is_empty());
    }

    #[test]
    fn home_all_sets_homed_and_orders_axes() {
        let mut p = pipette();
        p.home_x();
        assert!(!p.state().homed);
        p.home_all();
        assert!(p.state().homed);
        let lines = p.take_instructions();
        assert_eq!(lines[0], "G28 X");
        assert_eq!(lines[1], "G28 Z");
        assert_eq!(lines[2], "G28 X Y");
        assert!(p.instructions().is_empty());
    }

    #[test]
    fn move_to_splits_xy_and_z() {
        let mut p = pipette();
        p.move_to(Coordinate::new(1.0, 2.0, 3.0)).expect("finite move");
        assert_eq!(
            p.instructions(),
            ["G1 X1 Y2 F10000".to_string(), "G1 Z3 F5000".to_string()]
        );
    }

    #[test]
    fn move_relative_wraps_in_relative_mode() {
        let mut p = pipette();
        p.move_relative(1.0, 0.0, -2.0).expect("finite move");
        assert_eq!(p.instructions()[0], "G91");
        assert_eq!(p.instructions()[2], "G90");
    }

    #[test]
    fn second_tip_pickup_fails_fast() {
        let mut p = pipette();
        p.next_tip(None).expect("first tip");
        let before = p.instructions().len();
        assert_eq!(p.next_tip(None), Err(CompilerError::TipAlreadyOn));
        assert_eq!(p.instructions().len(), before);
        assert!(p.state().has_tip);
    }

    #[test]
    fn next_tip_without_source_fails() {
        let mut p = AutoPipette::new(PipetteParams::default(), VolumeConverter::default(), "x")
            .expect("valid");
        assert_eq!(p.next_tip(None), Err(CompilerError::NoTipbox));
        assert_eq!(
            p.next_tip(Some("nope")),
            Err(CompilerError::NotALocation("nope".into()))
        );
    }

    #[test]
    fn pinned_box_is_used_and_validated() {
        let mut p = pipette();
        assert_eq!(
            p.set_active_tipbox(Some("waste")),
            Err(CompilerError::NotATipBox("waste".into()))
        );
        p.set_active_tipbox(Some("tips")).expect("tips is a tip box");
        p.next_tip(None).expect("pinned tip");
        match p.location("tips") {
            Some(Location::Plate(plate)) => assert_eq!(plate.cursor(), 1),
            other => panic!("unexpected location {other:?}"),
        }
    }

    #[test]
    fn failed_pipette_leaves_no_trace() {
        let mut p = pipette();
        let splits = vec![Split::new("b", 30.0), Split::new("a", 30.0)];
        let opts = PipetteOptions {
            splits,
            ..PipetteOptions::default()
        };
        let err = p.pipette(50.0, "a", "b", &opts).expect_err("splits exceed volume");
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert!(p.instructions().is_empty());
        assert_eq!(p.state(), MachineState::default());
    }

    #[test]
    fn rollback_restores_plate_cursor() {
        let mut p = pipette();
        let before = match p.location("tips") {
            Some(Location::Plate(plate)) => plate.clone(),
            _ => panic!("tips missing"),
        };
        // The unknown destination is only found after the source advanced.
        let err = p.pipette(10.0, "tips", "missing", &PipetteOptions::default());
        assert_eq!(err, Err(CompilerError::NotALocation("missing".into())));
        assert_eq!(p.location("tips"), Some(&Location::Plate(before)));
    }

    #[test]
    fn negative_volume_is_rejected() {
        let mut p = pipette();
        assert_eq!(
            p.aspirate(-1.0, "a", &AspirateOptions::default()),
            Err(CompilerError::InvalidVolume(-1.0))
        );
        assert!(p.instructions().is_empty());
    }

    #[test]
    fn prewet_is_bounded() {
        let mut p = pipette();
        let opts = AspirateOptions {
            prewet: 4,
            ..AspirateOptions::default()
        };
        assert!(matches!(
            p.aspirate(10.0, "a", &opts),
            Err(CompilerError::Validation(_))
        ));
    }

    #[test]
    fn dispense_needs_liquid() {
        let mut p = pipette();
        assert_eq!(
            p.dispense(5.0, "b", &DispenseOptions::default()),
            Err(CompilerError::NoTip)
        );
        p.next_tip(None).expect("tip");
        assert_eq!(
            p.dispense(5.0, "b", &DispenseOptions::default()),
            Err(CompilerError::NoLiquid)
        );
    }

    #[test]
    fn absolute_target_beyond_charge_is_rejected() {
        let mut p = pipette();
        p.aspirate(20.0, "a", &AspirateOptions::default()).expect("aspirate");
        let opts = DispenseOptions {
            absolute_target: Some(25.0),
            ..DispenseOptions::default()
        };
        assert!(matches!(
            p.dispense(25.0, "b", &opts),
            Err(CompilerError::Validation(_))
        ));
        assert!(p.state().has_liquid);
    }

    #[test]
    fn trigger_and_message() {
        let mut params = PipetteParams::default();
        params.triggers.insert("light".into(), "PB5".into());
        let mut p = AutoPipette::new(params, VolumeConverter::default(), "x").expect("valid");
        p.set_trigger("light", true).expect("known channel");
        assert!(p.set_trigger("pump", true).is_err());
        p.print_message("hello").expect("one line");
        assert!(p.print_message("a\nb").is_err());
        assert_eq!(p.instructions(), ["SET_PIN PIN=PB5 VALUE=1".to_string(), "M117 hello".to_string()]);
    }

    #[test]
    fn set_pushes_firmware_limits() {
        let mut p = pipette();
        p.set(Setting::SpeedFactor, 150.0).expect("in range");
        p.set(Setting::MaxVol, 200.0).expect("positive");
        assert_eq!(p.instructions(), ["M220 S150".to_string()]);
        assert_eq!(p.params().max_vol, 200.0);
        assert!(p.set(Setting::SpeedFactor, 500.0).is_err());
        assert_eq!(p.params().speed_factor, 150.0);
    }

    #[test]
    fn replacing_a_tipbox_name_updates_pool() {
        let mut p = pipette();
        p.add_location("tips", Coordinate::new(0.0, 0.0, 0.0)).expect("overwrite");
        assert!(!p.has_tip_source());
        p.add_location("waste", Coordinate::new(0.0, 0.0, 0.0)).expect("overwrite");
        assert!(!p.has_waste());
    }

    #[test]
    fn reset_state_clears_flags() {
        let mut p = pipette();
        p.home_all();
        p.aspirate(10.0, "a", &AspirateOptions::default()).expect("aspirate");
        p.reset_state();
        assert_eq!(p.state(), MachineState::default());
        assert_eq!(p.held_volume(), None);
    }

    #[test]
    fn chunking_covers_volume() {
        let chunks = |v: f64| chunk_volumes(v, 50.0).expect("chunks");
        assert_eq!(chunks(120.0), vec![50.0, 50.0, 20.0]);
        assert_eq!(chunks(100.0), vec![50.0, 50.0]);
        assert_eq!(chunks(10.0), vec![10.0]);
        assert!(chunks(0.0).is_empty());
        assert_eq!(chunk_volumes(0.3, 0.1).expect("chunks").len(), 3);
    }

    #[test]
    fn huge_transfers_are_rejected_before_chunking() {
        for volume in [1e20, 1e30, 50.0 * (MAX_TRANSFER_CHUNKS as f64 + 1.0)] {
            assert!(matches!(
                chunk_volumes(volume, 50.0),
                Err(CompilerError::Validation(_))
            ));
        }
        let most = chunk_volumes(50.0 * MAX_TRANSFER_CHUNKS as f64, 50.0).expect("at the limit");
        assert_eq!(most.len(), MAX_TRANSFER_CHUNKS);
    }

    #[test]
    fn gcode_text_is_newline_terminated() {
        assert_eq!(to_gcode(&["G90", "G28 Z"]), "G90\nG28 Z\n");
    }
}
