// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Visibilities, as seen by the gridder.
//!
//! Reading measurement sets is someone else's job; anything that implements
//! [`VisBuffer`] can be gridded. [`MemVisBuffer`] holds everything in
//! `ndarray`s.

pub mod mapper;
#[cfg(test)]
mod tests;

use marlu::{c32, UVW};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    cf::{AntennaType, CFIndex},
    constants::MAX_NUM_POLS,
};

/// A spectral window, as needed to prepare CFs.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralWindow {
    pub id: usize,
    /// \[Hz\]
    pub chan_freqs: Vec<f64>,
    /// \[Hz\]
    pub ref_freq: f64,
    /// The antenna types present in this window's data.
    pub antenna_types: Vec<AntennaType>,
}

/// What gets gridded.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ImagingMode {
    /// The (residual) visibilities themselves.
    #[default]
    Residual,

    /// Unit visibilities, giving the point-spread function.
    Psf,

    /// Unit visibilities at the uv origin, giving the gridded weights.
    Weight,
}

/// A source of visibilities for one spectral window.
pub trait VisBuffer {
    fn spw(&self) -> usize;

    fn num_rows(&self) -> usize;

    fn num_chans(&self) -> usize;

    fn num_pols(&self) -> usize;

    /// \[Hz\]
    fn chan_freqs(&self) -> &[f64];

    fn antenna1(&self, row: usize) -> usize;

    fn antenna2(&self, row: usize) -> usize;

    fn antenna_type(&self, antenna: usize) -> AntennaType;

    /// \[metres\]
    fn uvw(&self, row: usize) -> UVW;

    fn time(&self, row: usize) -> f64;

    /// \[radians\]
    fn parallactic_angle(&self) -> f64;

    fn row_flag(&self, row: usize) -> bool;

    fn flag(&self, row: usize, chan: usize, pol: usize) -> bool;

    fn imaging_weight(&self, row: usize, chan: usize) -> f32;

    fn vis(&self, row: usize, chan: usize, pol: usize) -> c32;

    /// The residual geometric delay of a row \[metres\]. Visibilities are
    /// phase-rotated by this before gridding.
    fn delay(&self, row: usize) -> f64;

    /// The offset of the antenna pointing from the phase centre (l, m)
    /// \[radians\], if any.
    fn pointing_offset(&self, row: usize) -> Option<[f64; 2]>;
}

/// A [`VisBuffer`] that can receive predicted (degridded) visibilities.
pub trait VisBufferMut: VisBuffer {
    fn set_model_vis(&mut self, row: usize, chan: usize, pol: usize, value: c32);
}

#[derive(Error, Debug)]
pub enum VisError {
    #[error("Expected {what} to have shape {expected:?}, but it has shape {got:?}")]
    BadShape {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Visibility buffers can have at most {MAX_NUM_POLS} polarisations, but got {0}")]
    TooManyPols(usize),

    #[error("Row {row} refers to antenna {antenna}, but only {num_antennas} antenna types were given")]
    UnknownAntenna {
        row: usize,
        antenna: usize,
        num_antennas: usize,
    },
}

/// Visibilities held in memory.
#[derive(Debug, Clone)]
pub struct MemVisBuffer {
    spw: usize,
    chan_freqs: Vec<f64>,
    /// `[row][chan][pol]`
    vis: Array3<c32>,
    /// `[row][chan][pol]`
    model_vis: Array3<c32>,
    /// `[row][chan][pol]`
    flags: Array3<bool>,
    /// `[row][chan]`
    weights: Array2<f32>,
    row_flags: Vec<bool>,
    uvws: Vec<UVW>,
    times: Vec<f64>,
    antenna1: Vec<usize>,
    antenna2: Vec<usize>,
    antenna_types: Vec<AntennaType>,
    delays: Vec<f64>,
    pointing_offsets: Option<Vec<[f64; 2]>>,
    parallactic_angle: f64,
}

fn check_shape(what: &'static str, expected: &[usize], got: &[usize]) -> Result<(), VisError> {
    if expected == got {
        Ok(())
    } else {
        Err(VisError::BadShape {
            what,
            expected: expected.to_vec(),
            got: got.to_vec(),
        })
    }
}

impl MemVisBuffer {
    /// Make a buffer from visibilities shaped `[row][chan][pol]` and a UVW per
    /// row. Every row starts unflagged with unit weights, as a baseline
    /// between antennas 0 and 1 of type 0.
    pub fn new(
        spw: usize,
        chan_freqs: Vec<f64>,
        vis: Array3<c32>,
        uvws: Vec<UVW>,
    ) -> Result<MemVisBuffer, VisError> {
        let (num_rows, num_chans, num_pols) = vis.dim();
        if num_pols > MAX_NUM_POLS {
            return Err(VisError::TooManyPols(num_pols));
        }
        check_shape("channel frequencies", &[num_chans], &[chan_freqs.len()])?;
        check_shape("UVWs", &[num_rows], &[uvws.len()])?;

        Ok(MemVisBuffer {
            spw,
            chan_freqs,
            model_vis: Array3::zeros(vis.dim()),
            flags: Array3::from_elem(vis.dim(), false),
            weights: Array2::ones((num_rows, num_chans)),
            row_flags: vec![false; num_rows],
            times: vec![0.0; num_rows],
            antenna1: vec![0; num_rows],
            antenna2: vec![1; num_rows],
            antenna_types: vec![AntennaType(0); 2],
            delays: vec![0.0; num_rows],
            pointing_offsets: None,
            parallactic_angle: 0.0,
            vis,
            uvws,
        })
    }

    pub fn with_weights(mut self, weights: Array2<f32>) -> Result<Self, VisError> {
        check_shape("weights", self.weights.shape(), weights.shape())?;
        self.weights = weights;
        Ok(self)
    }

    pub fn with_flags(mut self, flags: Array3<bool>) -> Result<Self, VisError> {
        check_shape("flags", self.flags.shape(), flags.shape())?;
        self.flags = flags;
        Ok(self)
    }

    pub fn with_row_flags(mut self, row_flags: Vec<bool>) -> Result<Self, VisError> {
        check_shape("row flags", &[self.row_flags.len()], &[row_flags.len()])?;
        self.row_flags = row_flags;
        Ok(self)
    }

    pub fn with_times(mut self, times: Vec<f64>) -> Result<Self, VisError> {
        check_shape("times", &[self.times.len()], &[times.len()])?;
        self.times = times;
        Ok(self)
    }

    /// Set the antennas of each row, and the type of each antenna.
    pub fn with_antennas(
        mut self,
        antenna1: Vec<usize>,
        antenna2: Vec<usize>,
        antenna_types: Vec<AntennaType>,
    ) -> Result<Self, VisError> {
        let num_rows = self.row_flags.len();
        check_shape("antenna1", &[num_rows], &[antenna1.len()])?;
        check_shape("antenna2", &[num_rows], &[antenna2.len()])?;
        for (row, (&a1, &a2)) in antenna1.iter().zip(antenna2.iter()).enumerate() {
            if let Some(antenna) = [a1, a2].into_iter().find(|&a| a >= antenna_types.len()) {
                return Err(VisError::UnknownAntenna {
                    row,
                    antenna,
                    num_antennas: antenna_types.len(),
                });
            }
        }
        self.antenna1 = antenna1;
        self.antenna2 = antenna2;
        self.antenna_types = antenna_types;
        Ok(self)
    }

    /// \[metres\]
    pub fn with_delays(mut self, delays: Vec<f64>) -> Result<Self, VisError> {
        check_shape("delays", &[self.delays.len()], &[delays.len()])?;
        self.delays = delays;
        Ok(self)
    }

    /// \[radians\]
    pub fn with_pointing_offsets(mut self, offsets: Vec<[f64; 2]>) -> Result<Self, VisError> {
        check_shape("pointing offsets", &[self.row_flags.len()], &[offsets.len()])?;
        self.pointing_offsets = Some(offsets);
        Ok(self)
    }

    /// \[radians\]
    pub fn with_parallactic_angle(mut self, pa: f64) -> Self {
        self.parallactic_angle = pa;
        self
    }

    /// The distinct antenna types used by unflagged rows.
    pub fn used_antenna_types(&self) -> Vec<AntennaType> {
        let mut types: Vec<AntennaType> = (0..self.num_rows())
            .filter(|&row| !self.row_flags[row])
            .flat_map(|row| {
                [
                    self.antenna_types[self.antenna1[row]],
                    self.antenna_types[self.antenna2[row]],
                ]
            })
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    /// Predicted visibilities, `[row][chan][pol]`.
    pub fn model_vis(&self) -> ArrayView3<c32> {
        self.model_vis.view()
    }
}

impl VisBuffer for MemVisBuffer {
    fn spw(&self) -> usize {
        self.spw
    }

    fn num_rows(&self) -> usize {
        self.vis.len_of(Axis(0))
    }

    fn num_chans(&self) -> usize {
        self.vis.len_of(Axis(1))
    }

    fn num_pols(&self) -> usize {
        self.vis.len_of(Axis(2))
    }

    fn chan_freqs(&self) -> &[f64] {
        &self.chan_freqs
    }

    fn antenna1(&self, row: usize) -> usize {
        self.antenna1[row]
    }

    fn antenna2(&self, row: usize) -> usize {
        self.antenna2[row]
    }

    fn antenna_type(&self, antenna: usize) -> AntennaType {
        self.antenna_types[antenna]
    }

    fn uvw(&self, row: usize) -> UVW {
        self.uvws[row]
    }

    fn time(&self, row: usize) -> f64 {
        self.times[row]
    }

    fn parallactic_angle(&self) -> f64 {
        self.parallactic_angle
    }

    fn row_flag(&self, row: usize) -> bool {
        self.row_flags[row]
    }

    fn flag(&self, row: usize, chan: usize, pol: usize) -> bool {
        self.flags[(row, chan, pol)]
    }

    fn imaging_weight(&self, row: usize, chan: usize) -> f32 {
        self.weights[(row, chan)]
    }

    fn vis(&self, row: usize, chan: usize, pol: usize) -> c32 {
        self.vis[(row, chan, pol)]
    }

    fn delay(&self, row: usize) -> f64 {
        self.delays[row]
    }

    fn pointing_offset(&self, row: usize) -> Option<[f64; 2]> {
        self.pointing_offsets.as_ref().map(|o| o[row])
    }
}

impl VisBufferMut for MemVisBuffer {
    fn set_model_vis(&mut self, row: usize, chan: usize, pol: usize, value: c32) {
        self.model_vis[(row, chan, pol)] = value;
    }
}

/// Maps input indices (channels or polarisations) to grid indices. A target
/// of -1 drops the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotMap(Vec<i32>);

/// Data polarisation to grid polarisation.
pub type PolMap = SlotMap;

/// Data channel to grid channel.
pub type ChanMap = SlotMap;

#[derive(Error, Debug)]
#[error("Map targets must be -1 (drop) or non-negative, but index {index} maps to {target}")]
pub struct SlotMapError {
    pub index: usize,
    pub target: i32,
}

impl SlotMap {
    pub fn identity(n: usize) -> SlotMap {
        SlotMap((0..n as i32).collect())
    }

    /// Map every input to the same target.
    pub fn constant(n: usize, target: usize) -> SlotMap {
        SlotMap(vec![target as i32; n])
    }

    pub fn from_vec(v: Vec<i32>) -> Result<SlotMap, SlotMapError> {
        match v.iter().enumerate().find(|&(_, &t)| t < -1) {
            Some((index, &target)) => Err(SlotMapError { index, target }),
            None => Ok(SlotMap(v)),
        }
    }

    /// The target of input `i`, if it isn't dropped. Inputs beyond the end of
    /// the map are dropped.
    #[inline]
    pub fn target(&self, i: usize) -> Option<usize> {
        match self.0.get(i) {
            Some(&t) if t >= 0 => Some(t as usize),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One visibility sample, ready for the resampling kernel. Polarisation
/// slots are grid polarisations; unused slots have zero weight.
#[derive(Debug, Clone, Copy)]
pub struct VisRecord {
    pub vis: [c32; MAX_NUM_POLS],
    pub weights: [f32; MAX_NUM_POLS],
    /// \[Hz\]
    pub freq: f64,
    /// Phase rotation applied before gridding \[radians\]
    pub dephase: f64,
    /// \[metres\]
    pub uvw: UVW,
    /// The grid channel.
    pub grid_cube: usize,
    pub cf_index: CFIndex,
    /// Phase slope across the CF \[radians per grid pixel\] along u and v.
    pub phase_gradient: [f64; 2],

    pub spw: usize,
    pub row: usize,
    pub chan: usize,
}
