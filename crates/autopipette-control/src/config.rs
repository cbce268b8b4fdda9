//! Machine configuration file.
//!
//! One TOML document describes the bridge endpoint, the pipette parameters,
//! the plunger calibration and the deck. Loading validates everything up
//! front so a compiler is only ever built from a consistent description.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use autopipette_compiler::{AutoPipette, PipetteParams};
use autopipette_labware::{Coordinate, PlateSpec, VolumeConverter};
use autopipette_transport::ClientConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Default JSON-RPC port of the bridge.
pub const DEFAULT_PORT: u16 = 7125;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// Overrides `http://<host>/server/files/upload`.
    pub upload_url: Option<String>,
    pub request_timeout_ms: u64,
    pub upload_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            upload_url: None,
            request_timeout_ms: 10_000,
            upload_timeout_ms: 30_000,
        }
    }
}

/// Firmware object names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NamesConfig {
    pub stepper: String,
    pub servo: String,
}

impl Default for NamesConfig {
    fn default() -> Self {
        let p = PipetteParams::default();
        Self {
            stepper: p.name_stepper,
            servo: p.name_servo,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpeedConfig {
    pub xy: f64,
    pub z: f64,
    pub pipette_down: f64,
    pub pipette_up: f64,
    pub pipette_up_slow: f64,
    pub factor: f64,
    pub velocity_max: f64,
    pub accel_max: f64,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        let p = PipetteParams::default();
        Self {
            xy: p.speed_xy,
            z: p.speed_z,
            pipette_down: p.speed_pipette_down,
            pipette_up: p.speed_pipette_up,
            pipette_up_slow: p.speed_pipette_up_slow,
            factor: p.speed_factor,
            velocity_max: p.velocity_max,
            accel_max: p.accel_max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServoConfig {
    pub angle_retract: f64,
    pub angle_ready: f64,
}

impl Default for ServoConfig {
    fn default() -> Self {
        let p = PipetteParams::default();
        Self {
            angle_retract: p.servo_angle_retract,
            angle_ready: p.servo_angle_ready,
        }
    }
}

/// Dwell times in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaitConfig {
    pub movement: f64,
    pub aspirate: f64,
    pub eject: f64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        let p = PipetteParams::default();
        Self {
            movement: p.wait_movement,
            aspirate: p.wait_aspirate,
            eject: p.wait_eject,
        }
    }
}

/// Tip capacity, air gaps and plunger calibration.
///
/// Empty `volumes`/`steps` select the built-in calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VolumeConfig {
    pub max_vol: f64,
    pub pre_air: f64,
    pub post_air: f64,
    pub volumes: Vec<f64>,
    pub steps: Vec<f64>,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        let p = PipetteParams::default();
        Self {
            max_vol: p.max_vol,
            pre_air: p.pre_air,
            post_air: p.post_air,
            volumes: Vec::new(),
            steps: Vec::new(),
        }
    }
}

/// A named deck position, optionally carrying a plate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationConfig {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub plate: Option<PlateSpec>,
}

impl LocationConfig {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
    pub network: NetworkConfig,
    pub names: NamesConfig,
    pub speed: SpeedConfig,
    pub servo: ServoConfig,
    pub wait: WaitConfig,
    pub volume: VolumeConfig,
    /// Trigger channel name to firmware output pin.
    pub triggers: BTreeMap<String, String>,
    #[serde(rename = "location")]
    pub locations: Vec<LocationConfig>,
    /// Profile name to configuration path, relative to this file.
    pub profiles: BTreeMap<String, PathBuf>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl MachineConfig {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&text, &path.display().to_string())?;
        config.path = Some(path.to_path_buf());
        info!(path = %path.display(), locations = config.locations.len(), "configuration loaded");
        Ok(config)
    }

    /// Parse and validate configuration text; `origin` labels errors.
    pub fn parse(text: &str, origin: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            origin: origin.to_string(),
            source: Box::new(source),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// File this configuration was loaded from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Label used in the G-code header.
    pub fn source(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => "defaults".to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.params()?;
        self.converter()?;
        let mut seen = BTreeSet::new();
        for location in &self.locations {
            if !seen.insert(location.name.as_str()) {
                return Err(ConfigError::DuplicateLocation(location.name.clone()));
            }
            let coordinate = location.coordinate();
            if !coordinate.is_finite() {
                return Err(ConfigError::Location {
                    name: location.name.clone(),
                    reason: format!("coordinate {coordinate} is not finite"),
                });
            }
            if let Some(spec) = &location.plate {
                spec.build(coordinate).map_err(|err| ConfigError::Location {
                    name: location.name.clone(),
                    reason: err.to_string(),
                })?;
            }
        }
        Ok(())
    }

    pub fn params(&self) -> Result<PipetteParams> {
        let params = PipetteParams {
            name_stepper: self.names.stepper.clone(),
            name_servo: self.names.servo.clone(),
            speed_xy: self.speed.xy,
            speed_z: self.speed.z,
            speed_pipette_down: self.speed.pipette_down,
            speed_pipette_up: self.speed.pipette_up,
            speed_pipette_up_slow: self.speed.pipette_up_slow,
            speed_factor: self.speed.factor,
            velocity_max: self.speed.velocity_max,
            accel_max: self.speed.accel_max,
            servo_angle_retract: self.servo.angle_retract,
            servo_angle_ready: self.servo.angle_ready,
            wait_movement: self.wait.movement,
            wait_aspirate: self.wait.aspirate,
            wait_eject: self.wait.eject,
            max_vol: self.volume.max_vol,
            pre_air: self.volume.pre_air,
            post_air: self.volume.post_air,
            triggers: self.triggers.clone(),
        };
        params.validate().map_err(ConfigError::Params)?;
        Ok(params)
    }

    pub fn converter(&self) -> Result<VolumeConverter> {
        if self.volume.volumes.is_empty() && self.volume.steps.is_empty() {
            return Ok(VolumeConverter::default());
        }
        VolumeConverter::new(&self.volume.volumes, &self.volume.steps)
            .map_err(ConfigError::Calibration)
    }

    /// Build a compiler with every configured location registered.
    pub fn build_compiler(&self) -> Result<AutoPipette> {
        let mut pipette = AutoPipette::new(self.params()?, self.converter()?, self.source())
            .map_err(ConfigError::Params)?;
        for location in &self.locations {
            let coordinate = location.coordinate();
            let added = match &location.plate {
                None => pipette.add_location(&location.name, coordinate),
                Some(spec) => {
                    let plate = spec.build(coordinate).map_err(|err| ConfigError::Location {
                        name: location.name.clone(),
                        reason: err.to_string(),
                    })?;
                    pipette.add_plate(&location.name, plate)
                }
            };
            added.map_err(|err| ConfigError::Location {
                name: location.name.clone(),
                reason: err.to_string(),
            })?;
            debug!(name = %location.name, "location registered");
        }
        Ok(pipette)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.network.request_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.network.upload_timeout_ms)
    }

    /// Bridge client settings for this machine.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(&self.network.host, self.network.port);
        if let Some(url) = &self.network.upload_url {
            config.upload_url = url.clone();
        }
        config.upload_timeout = self.upload_timeout();
        config
    }

    /// Resolve a profile name to its configuration file.
    pub fn profile_path(&self, name: &str) -> Result<PathBuf> {
        let relative = self
            .profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))?;
        let base = self
            .path
            .as_deref()
            .and_then(Path::parent)
            .unwrap_or_else(|| Path::new("."));
        Ok(base.join(relative))
    }
}
