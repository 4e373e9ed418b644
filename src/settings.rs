use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::KnitError;

// ── Machine identity ────────────────────────────────────────────

/// Accepted machine specifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MachineType {
    #[default]
    SWG091N2,
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineType::SWG091N2 => f.write_str("SWG091N2"),
        }
    }
}

/// Where the knitted piece sits on the bed when handed to the back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MachinePosition {
    Left,
    #[default]
    Right,
    Center,
    Keep,
}

impl MachinePosition {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Left" => Some(MachinePosition::Left),
            "Right" => Some(MachinePosition::Right),
            "Center" => Some(MachinePosition::Center),
            "Keep" => Some(MachinePosition::Keep),
            _ => None,
        }
    }
}

impl fmt::Display for MachinePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachinePosition::Left => "Left",
            MachinePosition::Right => "Right",
            MachinePosition::Center => "Center",
            MachinePosition::Keep => "Keep",
        };
        f.write_str(s)
    }
}

// ── Machine behaviour ───────────────────────────────────────────

/// What an xfer does when the target needle already holds loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum XferPolicy {
    /// Stack the moved loops on top of the held ones.
    #[default]
    Stack,
    /// Leave both needles untouched.
    Skip,
    /// Raise a knitting error.
    Error,
}

/// Yarn loaded on a carrier, reported in the knitout header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YarnSpec {
    pub carrier: u32,
    #[serde(default = "default_yarn_size")]
    pub size: u32,
    #[serde(default = "default_yarn_plies")]
    pub plies: u32,
    #[serde(default = "default_yarn_color")]
    pub color: String,
}

fn default_yarn_size() -> u32 {
    30
}

fn default_yarn_plies() -> u32 {
    2
}

fn default_yarn_color() -> String {
    "white".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSpec {
    pub machine: MachineType,
    pub width: i32,
    pub carrier_count: u32,
    pub max_rack: f64,
    /// Needles per inch written to the `;;Gauge:` header.
    pub header_gauge: u32,
    pub position: MachinePosition,
    pub hook_size: u32,
    pub max_float: u32,
    pub yarns: Vec<YarnSpec>,
    pub xfer_policy: XferPolicy,
}

impl Default for MachineSpec {
    fn default() -> Self {
        Self {
            machine: MachineType::SWG091N2,
            width: 540,
            carrier_count: 10,
            max_rack: 4.25,
            header_gauge: 15,
            position: MachinePosition::Right,
            hook_size: 5,
            max_float: 20,
            yarns: Vec::new(),
            xfer_policy: XferPolicy::Stack,
        }
    }
}

// ── Interpreter settings ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterSettings {
    pub machine: MachineSpec,
    /// Directories searched for `import`ed `.ks` modules.
    pub import_paths: Vec<PathBuf>,
    /// File written with the partial knitout when a run fails.
    pub error_file: String,
}

impl Default for InterpreterSettings {
    fn default() -> Self {
        Self {
            machine: MachineSpec::default(),
            import_paths: Vec::new(),
            error_file: crate::paths::ERROR_FILE.to_string(),
        }
    }
}

/// Load settings from a JSON file. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<InterpreterSettings, KnitError> {
    if !path.exists() {
        return Ok(InterpreterSettings::default());
    }
    let data = std::fs::read_to_string(path)?;
    let settings = serde_json::from_str(&data)?;
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &InterpreterSettings) -> Result<(), KnitError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json)?;
    Ok(())
}
