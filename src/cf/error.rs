// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with convolution functions.

use std::path::PathBuf;

use thiserror::Error;

use super::{BaselineClass, CellKey};

/// The axis of the CF store that failed to match a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum CfAxis {
    #[strum(serialize = "baseline class")]
    BaselineClass,

    #[strum(serialize = "parallactic angle")]
    ParallacticAngle,

    #[strum(serialize = "w")]
    W,

    #[strum(serialize = "frequency")]
    Frequency,

    #[strum(serialize = "polarisation")]
    Polarisation,

    /// All axes matched, but that combination was never populated.
    #[strum(serialize = "group")]
    Group,
}

#[derive(Error, Debug, Clone)]
pub enum CfError {
    #[error("No convolution function for baseline class {class} on the {axis} axis (requested {requested})")]
    Missing {
        class: BaselineClass,
        axis: CfAxis,
        requested: f64,
    },

    #[error("A convolution function already exists for {0}")]
    Duplicate(CellKey),

    #[error("Invalid convolution function: {0}")]
    InvalidCell(String),
}

#[derive(Error, Debug)]
pub enum CfCacheError {
    #[error("CF cache file {file} doesn't start with the expected magic bytes")]
    BadMagic { file: PathBuf },

    #[error("CF cache file {file} has version {got}, but only version {expected} is supported")]
    Version {
        file: PathBuf,
        got: u32,
        expected: u32,
    },

    #[error("CF cache file {file} is truncated")]
    Truncated { file: PathBuf },

    #[error("CF cache file {file} is malformed: {msg}")]
    Malformed { file: PathBuf, msg: String },

    #[error(transparent)]
    Cell(#[from] CfError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
