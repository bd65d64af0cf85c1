// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gridding visibilities onto the uv grid, and degridding them back off it.

mod cpu;
mod error;
mod flux_scale;
#[cfg(any(feature = "cuda", feature = "hip"))]
mod gpu;
#[cfg(test)]
mod tests;

pub use cpu::ResamplerCpu;
pub use error::ResampleError;
pub use flux_scale::{FluxInterp, FluxScaleError, FluxScaleTable};
#[cfg(any(feature = "cuda", feature = "hip"))]
pub use gpu::ResamplerGpu;

use log::{info, warn};
use marlu::{c32, c64, UVW};

use crate::{
    cf::{CFCell, CFStore},
    constants::{MAX_NUM_POLS, VEL_C},
    grid::{GridAccumulator, GridGeometry},
    vis::{PolMap, VisBufferMut, VisRecord},
    RESAMPLE_DEVICE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleDevice {
    /// Grid with a pool of CPU threads, in double precision.
    Cpu,

    /// Grid on a CUDA- or HIP-capable device.
    #[cfg(any(feature = "cuda", feature = "hip"))]
    Gpu,
}

impl ResampleDevice {
    /// Get a formatted string with information on the device used for
    /// resampling.
    pub fn get_device_info(self) -> Result<String, DeviceError> {
        match self {
            ResampleDevice::Cpu => Ok(get_cpu_info()),

            #[cfg(any(feature = "cuda", feature = "hip"))]
            ResampleDevice::Gpu => {
                let (device_info, driver_info) = crate::gpu::get_device_info()?;
                #[cfg(feature = "cuda")]
                let device_type = "CUDA";
                #[cfg(feature = "hip")]
                let device_type = "HIP";
                Ok(format!(
                    "{} (capability {}, {} MiB), {device_type} driver {}, runtime {}",
                    device_info.name,
                    device_info.capability,
                    device_info.total_global_mem,
                    driver_info.driver_version,
                    driver_info.runtime_version
                ))
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[cfg(any(feature = "cuda", feature = "hip"))]
    #[error(transparent)]
    Gpu(#[from] crate::gpu::GpuError),
}

pub(crate) fn get_cpu_info() -> String {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        let avx2 = std::arch::is_x86_feature_detected!("avx2");
        let fma = std::arch::is_x86_feature_detected!("fma");
        format!(
            "{} CPU (AVX2 {}, FMA {})",
            std::env::consts::ARCH,
            if avx2 { "available" } else { "unavailable" },
            if fma { "available" } else { "unavailable" },
        )
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    format!("{} CPU", std::env::consts::ARCH)
}

/// The number of grid polarisations a kernel is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumPols {
    One,
    Two,
    Four,
}

impl NumPols {
    pub fn new(n: usize) -> Result<NumPols, ResampleError> {
        match n {
            1 => Ok(NumPols::One),
            2 => Ok(NumPols::Two),
            4 => Ok(NumPols::Four),
            _ => Err(ResampleError::UnsupportedPols(n)),
        }
    }

    pub fn get(self) -> usize {
        match self {
            NumPols::One => 1,
            NumPols::Two => 2,
            NumPols::Four => 4,
        }
    }
}

/// Counts from a gridding call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GridStats {
    pub gridded: usize,
    /// Records whose CF footprint didn't fit on the grid.
    pub off_grid: usize,
}

impl std::ops::AddAssign for GridStats {
    fn add_assign(&mut self, rhs: Self) {
        self.gridded += rhs.gridded;
        self.off_grid += rhs.off_grid;
    }
}

/// Something that grids and degrids [`VisRecord`]s.
pub trait Resampler: Send + Sync {
    fn device(&self) -> ResampleDevice;

    /// Grid `records` into `acc`, using the CFs in `store`. Each record's
    /// `cf_index` must point at a cell in `store`.
    ///
    /// # Errors
    ///
    /// [`ResampleError::InternalInconsistency`] if a record's CF or grid
    /// channel doesn't exist. Nothing is added to `acc` in that case.
    fn grid(
        &self,
        records: &[VisRecord],
        store: &CFStore,
        geometry: &GridGeometry,
        acc: &mut GridAccumulator,
    ) -> Result<GridStats, ResampleError>;

    /// Predict a visibility for each of `records` from the grid in `acc`. The
    /// predictions are in grid polarisation order; slots beyond the number of
    /// grid polarisations are zero. Off-grid records predict zero.
    fn degrid(
        &self,
        records: &[VisRecord],
        store: &CFStore,
        geometry: &GridGeometry,
        acc: &GridAccumulator,
        flux: Option<&FluxScaleTable>,
    ) -> Result<Vec<[c32; MAX_NUM_POLS]>, ResampleError>;
}

/// Create a [`Resampler`] trait object that runs on the CPU or a GPU,
/// depending on the value of [`RESAMPLE_DEVICE`]. If a GPU resampler can't be
/// made, the CPU is used instead.
pub fn new_resampler(num_threads: usize) -> Result<Box<dyn Resampler>, ResampleError> {
    let device = RESAMPLE_DEVICE.load();
    match device {
        ResampleDevice::Cpu => {}

        #[cfg(any(feature = "cuda", feature = "hip"))]
        ResampleDevice::Gpu => match ResamplerGpu::new() {
            Ok(r) => {
                match device.get_device_info() {
                    Ok(info) => info!("Resampling on {info}"),
                    Err(e) => warn!("Couldn't get GPU info: {e}"),
                }
                return Ok(Box::new(r));
            }
            Err(e) => warn!("Couldn't set up GPU resampling ({e}); falling back to the CPU"),
        },
    }

    let r = ResamplerCpu::new(num_threads)?;
    match ResampleDevice::Cpu.get_device_info() {
        Ok(info) => info!("Resampling on {info} with {num_threads} threads"),
        Err(e) => warn!("{e}"),
    }
    Ok(Box::new(r))
}

/// Where a record lands on the grid: the nearest grid pixel `(x, y)` and the
/// sub-pixel CF offset.
#[inline]
pub(crate) fn grid_position(
    uvw: UVW,
    freq: f64,
    geometry: &GridGeometry,
    sampling: u32,
) -> ([i64; 2], [i64; 2]) {
    let [su, sv] = geometry.uv_scale();
    let [ou, ov] = geometry.uv_offset();
    let scale = freq / VEL_C;
    let pos = [su * uvw.u * scale + ou, sv * uvw.v * scale + ov];
    let s = f64::from(sampling);
    let loc = [pos[0].round_ties_even(), pos[1].round_ties_even()];
    let off = [
        ((loc[0] - pos[0]) * s).round_ties_even(),
        ((loc[1] - pos[1]) * s).round_ties_even(),
    ];
    (
        [loc[0] as i64, loc[1] as i64],
        [off[0] as i64, off[1] as i64],
    )
}

/// Does the footprint of `cell` centred on `loc` fit on an `nx` by `ny` grid?
#[inline]
pub(crate) fn footprint_fits(loc: [i64; 2], cell: &CFCell, nx: usize, ny: usize) -> bool {
    let s = i64::from(cell.support());
    loc[0] - s >= 0 && loc[1] - s >= 0 && loc[0] + s < nx as i64 && loc[1] + s < ny as i64
}

/// The CF value and phase-gradient factor for gridding a record at tap
/// `(dx, dy)`. `None` if the tap is outside the CF. Degridding uses the
/// conjugates of both.
///
/// Gridding uses the conjugate of the CF; records with negative w use the CF
/// itself, as CFs are only made for positive w.
#[inline]
pub(crate) fn gridding_tap(
    cell: &CFCell,
    dx: i64,
    dy: i64,
    off: [i64; 2],
    negative_w: bool,
    phase_gradient: [f64; 2],
) -> Option<(c64, c64)> {
    let t = cell.tap(dx, dy, off)?;
    let t = c64::new(f64::from(t.re), f64::from(t.im));
    let t = if negative_w { t } else { t.conj() };
    if phase_gradient == [0.0, 0.0] {
        return Some((t, c64::new(1.0, 0.0)));
    }
    let s = i64::from(cell.sampling());
    let kx = (dx * s + off[0]) as f64;
    let ky = (dy * s + off[1]) as f64;
    let phase = (kx * phase_gradient[0] + ky * phase_gradient[1]) / s as f64;
    Some((t, c64::cis(phase)))
}

/// Write predictions from [`Resampler::degrid`] into `vb` through `pol_map`.
/// Polarisations with no weight in their record (flagged or unmapped) are
/// left alone. Returns the number of values written.
pub fn degrid_into<B: VisBufferMut + ?Sized>(
    records: &[VisRecord],
    predictions: &[[c32; MAX_NUM_POLS]],
    pol_map: &PolMap,
    vb: &mut B,
) -> usize {
    let mut n = 0;
    for (record, prediction) in records.iter().zip(predictions) {
        for pol in 0..vb.num_pols() {
            let Some(slot) = pol_map.target(pol).filter(|&s| s < MAX_NUM_POLS) else {
                continue;
            };
            if record.weights[slot] > 0.0 {
                vb.set_model_vis(record.row, record.chan, pol, prediction[slot]);
                n += 1;
            }
        }
    }
    n
}
