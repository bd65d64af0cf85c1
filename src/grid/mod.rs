// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The uv grid and its sum of weights.


use marlu::c64;
use ndarray::{prelude::*, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The dimensions of a [`GridAccumulator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    pub n_pol: usize,
    pub n_chan: usize,
    pub ny: usize,
    pub nx: usize,
}

impl GridShape {
    pub fn dim(self) -> (usize, usize, usize, usize) {
        (self.n_pol, self.n_chan, self.ny, self.nx)
    }

    /// The number of grid elements, or `None` if that overflows.
    fn num_elements(self) -> Option<usize> {
        self.n_pol
            .checked_mul(self.n_chan)?
            .checked_mul(self.ny)?
            .checked_mul(self.nx)
    }
}

/// The image-plane geometry that the uv grid corresponds to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridGeometry {
    pub nx: usize,
    pub ny: usize,
    /// The image pixel size \[radians\]
    pub cell_size: f64,
}

impl GridGeometry {
    /// Grid pixels per wavelength along u and v. This is also the image field
    /// of view \[radians\].
    pub fn uv_scale(&self) -> [f64; 2] {
        [
            self.nx as f64 * self.cell_size,
            self.ny as f64 * self.cell_size,
        ]
    }

    /// The grid pixel of the uv origin.
    pub fn uv_offset(&self) -> [f64; 2] {
        [(self.nx / 2) as f64, (self.ny / 2) as f64]
    }
}

#[derive(Error, Debug)]
pub enum GridError {
    #[error("A grid of shape {0:?} is too large to allocate")]
    TooLarge(GridShape),

    #[error("Tried to accumulate a partial grid of shape {got:?} into a grid of shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize, usize, usize),
        got: (usize, usize, usize, usize),
    },

    #[error("There is no plane for pol {pol}, chan {chan}; the grid has {n_pol} pols and {n_chan} channels")]
    NoSuchPlane {
        pol: usize,
        chan: usize,
        n_pol: usize,
        n_chan: usize,
    },

    #[error("Sum of weights for pol {pol}, chan {chan} would become negative ({value})")]
    NegativeWeight { pol: usize, chan: usize, value: f64 },
}

/// The complex uv grid, shaped `(n_pol, n_chan, ny, nx)`, and the
/// per-`(pol, chan)` sum of weights. Weights are never negative.
#[derive(Debug, Clone)]
pub struct GridAccumulator {
    grid: Array4<c64>,
    sum_weights: Array2<f64>,
}

/// Read-only views of a [`GridAccumulator`].
#[derive(Debug, Clone)]
pub struct GridSnapshot<'a> {
    pub grid: ArrayView4<'a, c64>,
    pub sum_weights: ArrayView2<'a, f64>,
}

impl GridAccumulator {
    pub fn new(shape: GridShape) -> Result<GridAccumulator, GridError> {
        // Don't let ndarray panic on absurd shapes.
        let num_bytes = shape
            .num_elements()
            .and_then(|n| n.checked_mul(std::mem::size_of::<c64>()))
            .ok_or(GridError::TooLarge(shape))?;
        if num_bytes > isize::MAX as usize {
            return Err(GridError::TooLarge(shape));
        }

        Ok(GridAccumulator {
            grid: Array4::zeros(shape.dim()),
            sum_weights: Array2::zeros((shape.n_pol, shape.n_chan)),
        })
    }

    /// Zero everything, reallocating if the shape changes.
    pub fn reset(&mut self, shape: GridShape) -> Result<(), GridError> {
        if shape == self.shape() {
            self.grid.fill(c64::default());
            self.sum_weights.fill(0.0);
        } else {
            *self = GridAccumulator::new(shape)?;
        }
        Ok(())
    }

    pub fn shape(&self) -> GridShape {
        let (n_pol, n_chan, ny, nx) = self.grid.dim();
        GridShape {
            n_pol,
            n_chan,
            ny,
            nx,
        }
    }

    /// Add a partial grid and its weights. Nothing is changed if this returns
    /// an error.
    pub fn accumulate(
        &mut self,
        grid: ArrayView4<c64>,
        sum_weights: ArrayView2<f64>,
    ) -> Result<(), GridError> {
        if grid.dim() != self.grid.dim() {
            return Err(GridError::ShapeMismatch {
                expected: self.grid.dim(),
                got: grid.dim(),
            });
        }
        if sum_weights.dim() != self.sum_weights.dim() {
            let (p, c) = sum_weights.dim();
            return Err(GridError::ShapeMismatch {
                expected: self.grid.dim(),
                got: (p, c, self.grid.len_of(Axis(2)), self.grid.len_of(Axis(3))),
            });
        }
        for (((pol, chan), &a), &b) in self.sum_weights.indexed_iter().zip(sum_weights.iter()) {
            if a + b < 0.0 {
                return Err(GridError::NegativeWeight {
                    pol,
                    chan,
                    value: a + b,
                });
            }
        }

        Zip::from(&mut self.grid)
            .and(&grid)
            .par_for_each(|a, &b| *a += b);
        self.sum_weights += &sum_weights;
        Ok(())
    }

    pub fn add_weight(&mut self, pol: usize, chan: usize, weight: f64) -> Result<(), GridError> {
        let (n_pol, n_chan) = self.sum_weights.dim();
        let w = self
            .sum_weights
            .get_mut((pol, chan))
            .ok_or(GridError::NoSuchPlane {
                pol,
                chan,
                n_pol,
                n_chan,
            })?;
        if *w + weight < 0.0 {
            return Err(GridError::NegativeWeight {
                pol,
                chan,
                value: *w + weight,
            });
        }
        *w += weight;
        Ok(())
    }

    pub fn grid(&self) -> ArrayView4<c64> {
        self.grid.view()
    }

    /// Mutable access to the grid, e.g. to load a model for degridding.
    pub fn grid_mut(&mut self) -> ArrayViewMut4<c64> {
        self.grid.view_mut()
    }

    pub fn sum_weights(&self) -> ArrayView2<f64> {
        self.sum_weights.view()
    }

    pub fn snapshot(&self) -> GridSnapshot {
        GridSnapshot {
            grid: self.grid.view(),
            sum_weights: self.sum_weights.view(),
        }
    }

    /// The sum of weights for a plane. A zero sum means the plane is
    /// undefined, so `None` is returned.
    pub fn sum_weight(&self, pol: usize, chan: usize) -> Option<f64> {
        match self.sum_weights.get((pol, chan)) {
            Some(&w) if w > 0.0 => Some(w),
            _ => None,
        }
    }

    /// A grid plane divided by its sum of weights.
    pub fn normalised_plane(&self, pol: usize, chan: usize) -> Option<Array2<c64>> {
        let w = self.sum_weight(pol, chan)?;
        Some(self.grid.slice(s![pol, chan, .., ..]).mapv(|v| v / w))
    }
}
