// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Convolution-function gridding and degridding for radio-interferometric
imaging.

Visibilities are resampled onto a regular uv grid with per-sample
convolution functions (CFs) that carry the A- and W-terms. CFs are prepared
on a worker thread while the main thread grids, and the resampling kernel
runs on the CPU or on a CUDA/HIP GPU.
 */

pub mod cf;
pub mod config;
pub mod constants;
pub mod coordination;
#[cfg(any(feature = "cuda", feature = "hip"))]
mod gpu;
pub mod grid;
pub mod imaging;
pub mod prepare;
pub mod resample;
pub mod vis;

use crossbeam_utils::atomic::AtomicCell;

// Re-exports.
pub use cf::{AntennaType, BaselineClass, CFCell, CFIndex, CFIndexer, CFStore, CfError};
pub use config::GridderConfig;
pub use coordination::CoordinationChannel;
pub use grid::{GridAccumulator, GridGeometry, GridShape};
pub use imaging::{CycleReport, ImagingError, ImagingSession};
pub use marlu::{c32, c64, UVW};
pub use prepare::CFPreparer;
pub use resample::{new_resampler, FluxScaleTable, ResampleDevice, Resampler};
pub use vis::{
    mapper::VisToDeviceMapper, ChanMap, ImagingMode, MemVisBuffer, PolMap, SpectralWindow,
    VisBuffer, VisBufferMut, VisRecord,
};

cfg_if::cfg_if! {
    if #[cfg(any(feature = "cuda", feature = "hip"))] {
        /// The device that resampling kernels run on. GPU builds grid on the
        /// GPU unless told otherwise.
        pub static RESAMPLE_DEVICE: AtomicCell<ResampleDevice> = AtomicCell::new(ResampleDevice::Gpu);
    } else {
        /// The device that resampling kernels run on.
        pub static RESAMPLE_DEVICE: AtomicCell<ResampleDevice> = AtomicCell::new(ResampleDevice::Cpu);
    }
}

/// Should progress bars be drawn?
pub static PROGRESS_BARS: AtomicCell<bool> = AtomicCell::new(false);
