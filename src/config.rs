use std::fmt;
use std::path::PathBuf;

use crate::grid::{parse_hhmm, GridError, GridShape};
use crate::limits::{MAX_LAB_ID_LEN, MAX_WEEKS};
use crate::model::WeekId;

/// Server settings, read from `SLOTGRID_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    /// `None` keeps every week in memory only.
    pub data_dir: Option<PathBuf>,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub lab_id: String,
    pub weeks: u32,
    pub grid: GridShape,
    pub max_attempts: u32,
    pub catalog_path: Option<PathBuf>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// `lookup` maps a full variable name (`SLOTGRID_PORT`) to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |suffix: &'static str| lookup(&format!("SLOTGRID_{suffix}")).filter(|v| !v.is_empty());

        let day_start = time_var(var("DAY_START"), "DAY_START", "07:30")?;
        let day_end = time_var(var("DAY_END"), "DAY_END", "17:30")?;
        let slot_minutes = parsed(var("SLOT_MINUTES"), "SLOT_MINUTES")?.unwrap_or(60);
        let grid = GridShape::new(day_start, day_end, slot_minutes).map_err(ConfigError::Grid)?;

        let lab_id = var("LAB_ID").unwrap_or_else(|| "lab".into());
        if lab_id.len() > MAX_LAB_ID_LEN || !lab_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ConfigError::Invalid { name: "LAB_ID", value: lab_id });
        }

        let weeks = parsed(var("WEEKS"), "WEEKS")?.unwrap_or(18);
        if weeks == 0 || weeks > MAX_WEEKS {
            return Err(ConfigError::Invalid { name: "WEEKS", value: weeks.to_string() });
        }

        let tls_cert = var("TLS_CERT");
        let tls_key = var("TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }

        Ok(Self {
            port: parsed(var("PORT"), "PORT")?.unwrap_or(5433),
            bind: var("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: var("DATA_DIR").map(PathBuf::from),
            password: var("PASSWORD").unwrap_or_else(|| "slotgrid".into()),
            max_connections: parsed(var("MAX_CONNECTIONS"), "MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(var("COMPACT_THRESHOLD"), "COMPACT_THRESHOLD")?.unwrap_or(1000),
            lab_id,
            weeks,
            grid,
            max_attempts: parsed(var("MAX_ATTEMPTS"), "MAX_ATTEMPTS")?.unwrap_or(crate::engine::DEFAULT_MAX_ATTEMPTS),
            catalog_path: var("CATALOG").map(PathBuf::from),
            tls_cert,
            tls_key,
            metrics_port: parsed(var("METRICS_PORT"), "METRICS_PORT")?,
        })
    }

    /// Document id for 1-based week `n`, if the term has it.
    pub fn week_id(&self, n: i64) -> Option<WeekId> {
        let n = u32::try_from(n).ok()?;
        (1..=self.weeks).contains(&n).then(|| WeekId::new(&self.lab_id, n))
    }

    pub fn wal_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(format!("{}.wal", self.lab_id)))
    }
}

fn parsed<T: std::str::FromStr>(value: Option<String>, name: &'static str) -> Result<Option<T>, ConfigError> {
    value
        .map(|v| v.trim().parse().map_err(|_| ConfigError::Invalid { name, value: v }))
        .transpose()
}

fn time_var(value: Option<String>, name: &'static str, default: &str) -> Result<u32, ConfigError> {
    let raw = value.unwrap_or_else(|| default.to_string());
    parse_hhmm(&raw).map_err(|_| ConfigError::Invalid { name, value: raw.clone() })
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { name: &'static str, value: String },
    Grid(GridError),
    TlsPair,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { name, value } => write!(f, "invalid SLOTGRID_{name}: {value:?}"),
            ConfigError::Grid(e) => write!(f, "invalid grid: {e}"),
            ConfigError::TlsPair => {
                write!(f, "both SLOTGRID_TLS_CERT and SLOTGRID_TLS_KEY must be set, or neither")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
