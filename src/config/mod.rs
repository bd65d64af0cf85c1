// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration of an imaging session.
//!
//! A [`GridderConfig`] can be written by hand in TOML, JSON or YAML; the file
//! extension says which. Everything except the `grid` section has defaults.

mod error;

pub use error::ConfigError;

use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::{
    cf::{AntennaType, FreqResolution, StoreConfig},
    constants::*,
    grid::{GridGeometry, GridShape},
    prepare::{Aperture, ApertureKind, ApertureTable, PrepareConfig},
    resample::{FluxInterp, FluxScaleTable, ResampleDevice},
};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum_macros::Display,
    strum_macros::EnumIter,
    strum_macros::EnumString,
)]
pub enum ConfigFileType {
    #[strum(serialize = "toml")]
    Toml,
    #[strum(serialize = "json")]
    Json,
    #[strum(to_string = "yaml", serialize = "yml")]
    Yaml,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridderConfig {
    pub grid: GridConfig,

    #[serde(default)]
    pub cf: CfConfig,

    #[serde(default)]
    pub apertures: Vec<ApertureConfig>,

    #[serde(default)]
    pub resample: ResampleConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flux_scale: Option<FluxScaleConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridConfig {
    pub nx: usize,
    pub ny: usize,
    /// The image pixel size \[arcseconds\].
    pub cell_size_arcsec: f64,
    #[serde(default = "one")]
    pub n_chan: usize,
    #[serde(default = "one")]
    pub n_pol: usize,
}

fn one() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CfConfig {
    pub support: u32,
    pub sampling: u32,
    pub n_w_planes: usize,
    /// \[wavelengths\]
    pub w_max: f64,
    /// How close a requested PA must be to a PA bin \[degrees\].
    pub pa_tolerance_deg: f64,
    /// \[degrees\]
    pub pa_bins_deg: Vec<f64>,
    /// Make CFs at every channel rather than only at each window's reference
    /// frequency.
    pub wideband: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for CfConfig {
    fn default() -> Self {
        CfConfig {
            support: DEFAULT_SUPPORT,
            sampling: DEFAULT_SAMPLING,
            n_w_planes: DEFAULT_NUM_W_PLANES,
            w_max: 0.0,
            pa_tolerance_deg: DEFAULT_PA_TOLERANCE_DEG,
            pa_bins_deg: vec![0.0],
            wideband: false,
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApertureConfig {
    pub antenna_type: AntennaType,
    /// \[metres\]
    pub diameter_m: f64,
    #[serde(default)]
    pub kind: ApertureKind,
    /// (l, m) \[arcseconds\]
    #[serde(default)]
    pub pointing_offset_arcsec: [f64; 2],
}

impl ApertureConfig {
    pub fn to_aperture(&self) -> Aperture {
        let [l, m] = self.pointing_offset_arcsec;
        Aperture {
            antenna_type: self.antenna_type,
            diameter: self.diameter_m,
            kind: self.kind,
            pointing_offset: [arcsec_to_rad(l), arcsec_to_rad(m)],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResampleConfig {
    /// Resample on the CPU, even if a GPU is available.
    pub cpu: bool,

    /// The number of CPU resampling threads. If not given, the number of
    /// available cores is used, up to a small cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_threads: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FluxScaleConfig {
    #[serde(default)]
    pub interp: FluxInterp,
    /// `[freq [Hz], scale]` pairs, in any order.
    pub entries: Vec<(f64, f64)>,
}

fn arcsec_to_rad(a: f64) -> f64 {
    (a / 3600.0).to_radians()
}

impl GridderConfig {
    /// Read a config file. Its extension determines how it's parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<GridderConfig, ConfigError> {
        let path = path.as_ref();
        debug!("Attempting to parse config file {}", path.display());
        let file_type = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .and_then(|e| ConfigFileType::from_str(&e).ok())
            .ok_or_else(|| ConfigError::UnrecognisedFileType {
                path: path.to_path_buf(),
                valid: ConfigFileType::iter().join(", "),
            })?;
        let contents = std::fs::read_to_string(path)?;
        let config = GridderConfig::parse(&contents, file_type)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config text without validating it.
    pub fn parse(contents: &str, file_type: ConfigFileType) -> Result<GridderConfig, ConfigError> {
        debug!("Parsing {file_type} config");
        Ok(match file_type {
            ConfigFileType::Toml => toml::from_str(contents)?,
            ConfigFileType::Json => serde_json::from_str(contents)?,
            ConfigFileType::Yaml => serde_yaml::from_str(contents)?,
        })
    }

    /// A config with default settings for a grid of this shape. No apertures
    /// are set.
    pub fn new(nx: usize, ny: usize, cell_size_arcsec: f64) -> GridderConfig {
        GridderConfig {
            grid: GridConfig {
                nx,
                ny,
                cell_size_arcsec,
                n_chan: 1,
                n_pol: 1,
            },
            cf: CfConfig::default(),
            apertures: vec![],
            resample: ResampleConfig::default(),
            flux_scale: None,
        }
    }

    /// Check the settings, returning the first problem found. Aperture
    /// diameters aren't checked here; a bad aperture only stops CFs being
    /// made for the windows that use it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.grid;
        if g.nx == 0 || g.ny == 0 || g.n_chan == 0 {
            return Err(ConfigError::EmptyGrid {
                nx: g.nx,
                ny: g.ny,
                n_chan: g.n_chan,
            });
        }
        if !matches!(g.n_pol, 1 | 2 | 4) {
            return Err(ConfigError::UnsupportedPols(g.n_pol));
        }
        if !(g.cell_size_arcsec.is_finite() && g.cell_size_arcsec > 0.0) {
            return Err(ConfigError::BadCellSize(g.cell_size_arcsec));
        }

        let cf = &self.cf;
        if cf.sampling == 0 {
            return Err(ConfigError::ZeroSampling);
        }
        if cf.n_w_planes == 0 {
            return Err(ConfigError::ZeroWPlanes);
        }
        if !(cf.w_max.is_finite() && cf.w_max >= 0.0) {
            return Err(ConfigError::BadWMax(cf.w_max));
        }
        if !(cf.pa_tolerance_deg.is_finite() && cf.pa_tolerance_deg > 0.0) {
            return Err(ConfigError::BadPaTolerance(cf.pa_tolerance_deg));
        }
        if let Some(pa) = cf.pa_bins_deg.iter().find(|pa| !pa.is_finite()) {
            return Err(ConfigError::BadPaBin(*pa));
        }

        if let Some(dup) = self
            .apertures
            .iter()
            .map(|a| a.antenna_type)
            .duplicates()
            .next()
        {
            return Err(ConfigError::DuplicateAperture(dup));
        }

        if self.resample.num_threads == Some(0) {
            return Err(ConfigError::ZeroThreads);
        }

        self.flux_table()?;
        Ok(())
    }

    pub fn geometry(&self) -> GridGeometry {
        GridGeometry {
            nx: self.grid.nx,
            ny: self.grid.ny,
            cell_size: arcsec_to_rad(self.grid.cell_size_arcsec),
        }
    }

    pub fn shape(&self) -> GridShape {
        GridShape {
            n_pol: self.grid.n_pol,
            n_chan: self.grid.n_chan,
            ny: self.grid.ny,
            nx: self.grid.nx,
        }
    }

    pub fn prepare_config(&self) -> PrepareConfig {
        let mut pa_bins: Vec<f64> = self
            .cf
            .pa_bins_deg
            .iter()
            .map(|pa| pa.to_radians())
            .collect();
        if pa_bins.is_empty() {
            pa_bins.push(0.0);
        }
        PrepareConfig {
            support: self.cf.support,
            sampling: self.cf.sampling,
            n_w_planes: self.cf.n_w_planes,
            w_max: self.cf.w_max,
            pa_bins,
            wideband: self.cf.wideband,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            pa_tolerance: self.cf.pa_tolerance_deg.to_radians(),
            freq_resolution: if self.cf.wideband {
                FreqResolution::per_channel()
            } else {
                FreqResolution::Nearest
            },
        }
    }

    pub fn aperture_table(&self) -> ApertureTable {
        ApertureTable::new(self.apertures.iter().map(ApertureConfig::to_aperture))
    }

    pub fn flux_table(&self) -> Result<Option<FluxScaleTable>, ConfigError> {
        self.flux_scale
            .as_ref()
            .map(|f| FluxScaleTable::new(f.entries.clone(), f.interp))
            .transpose()
            .map_err(ConfigError::from)
    }

    /// The number of CPU resampling threads to use.
    pub fn num_threads(&self) -> usize {
        self.resample
            .num_threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
                    .min(DEFAULT_MAX_NUM_THREADS)
            })
            .min(MAX_NUM_THREADS)
    }

    /// The device resampling should run on.
    pub fn resample_device(&self) -> ResampleDevice {
        cfg_if::cfg_if! {
            if #[cfg(any(feature = "cuda", feature = "hip"))] {
                if self.resample.cpu {
                    ResampleDevice::Cpu
                } else {
                    ResampleDevice::Gpu
                }
            } else {
                ResampleDevice::Cpu
            }
        }
    }
}
