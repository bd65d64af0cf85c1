// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! GPU code used for gridding and degridding.

#![allow(non_snake_case)]
#![allow(clippy::upper_case_acronyms)]

#[cfg(test)]
mod tests;
mod utils;

use std::{
    ffi::{c_char, c_int, c_void, CStr},
    panic::Location,
    ptr::null_mut,
};

use thiserror::Error;

pub(crate) use utils::get_device_info;

// Import CUDA/HIP functions into the same names.
#[cfg(feature = "cuda")]
use cuda_runtime_sys::{
    cudaDeviceSynchronize as gpuDeviceSynchronize, cudaError::cudaSuccess as gpuSuccess, cudaError_t as gpuError_t,
    cudaFree as gpuFree, cudaGetErrorString as gpuGetErrorString,
    cudaGetLastError as gpuGetLastError, cudaMalloc as gpuMalloc, cudaMemcpy as gpuMemcpy,
    cudaMemcpyKind::cudaMemcpyDeviceToHost as gpuMemcpyDeviceToHost,
    cudaMemcpyKind::cudaMemcpyHostToDevice as gpuMemcpyHostToDevice,
};
#[cfg(feature = "hip")]
use hip_sys::hiprt::{
    hipDeviceSynchronize as gpuDeviceSynchronize, hipError_t as gpuError_t, hipError_t::hipSuccess as gpuSuccess,
    hipFree as gpuFree, hipGetErrorString as gpuGetErrorString, hipGetLastError as gpuGetLastError,
    hipMalloc as gpuMalloc, hipMemcpy as gpuMemcpy,
    hipMemcpyKind::hipMemcpyDeviceToHost as gpuMemcpyDeviceToHost,
    hipMemcpyKind::hipMemcpyHostToDevice as gpuMemcpyHostToDevice,
};

/// Where one CF lives in the flattened pixel buffer on the device. Must match
/// `GpuCfCell` in grid.h.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct GpuCfCell {
    /// The index of the cell's first pixel.
    pub(crate) offset: u64,
    pub(crate) nx: i32,
    pub(crate) ny: i32,
    pub(crate) sampling: i32,
    pub(crate) support: i32,
}

/// A visibility record with its grid position already worked out. Must match
/// `GpuVisRecord` in grid.h.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct GpuVisRecord {
    /// Real and imaginary parts, for each polarisation.
    pub(crate) vis: [f32; 8],
    pub(crate) weights: [f32; 4],
    pub(crate) dephase: f64,
    pub(crate) phase_gradient: [f64; 2],
    /// The nearest grid pixel.
    pub(crate) loc: [i32; 2],
    /// The sub-pixel CF offset.
    pub(crate) off: [i32; 2],
    /// Index into the [`GpuCfCell`] table.
    pub(crate) cell: i32,
    pub(crate) grid_cube: i32,
    pub(crate) negative_w: i32,
    _pad: i32,
}

impl GpuVisRecord {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        vis: [f32; 8],
        weights: [f32; 4],
        dephase: f64,
        phase_gradient: [f64; 2],
        loc: [i32; 2],
        off: [i32; 2],
        cell: i32,
        grid_cube: i32,
        negative_w: bool,
    ) -> GpuVisRecord {
        GpuVisRecord {
            vis,
            weights,
            dephase,
            phase_gradient,
            loc,
            off,
            cell,
            grid_cube,
            negative_w: i32::from(negative_w),
            _pad: 0,
        }
    }
}

/// Grid dimensions, as the kernels see them. Must match `GpuGridShape` in
/// grid.h.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GpuGridShape {
    pub(crate) n_pol: i32,
    pub(crate) n_chan: i32,
    pub(crate) ny: i32,
    pub(crate) nx: i32,
}

// The C structs are laid out by hand; catch any drift.
static_assertions::assert_eq_size!(GpuCfCell, [u8; 24]);
static_assertions::assert_eq_size!(GpuVisRecord, [u8; 104]);
static_assertions::assert_eq_size!(GpuGridShape, [u8; 16]);
static_assertions::const_assert_eq!(crate::constants::MAX_NUM_POLS, 4);

// Link hypergrid_gpu produced from build.rs
#[link(name = "hypergrid_gpu", kind = "static")]
extern "C" {
    /// Add the records to `d_grid` (complex doubles, `[pol][chan][y][x]`).
    /// Returns null on success, otherwise a GPU error string.
    pub(crate) fn grid_records(
        d_records: *const GpuVisRecord,
        num_records: c_int,
        d_cf_pixels: *const f32,
        d_cells: *const GpuCfCell,
        shape: GpuGridShape,
        d_grid: *mut f64,
    ) -> *const c_char;

    /// Predict each record from `d_grid` into `d_out` (complex floats, four
    /// polarisations per record), scaling by `d_scales`.
    pub(crate) fn degrid_records(
        d_records: *const GpuVisRecord,
        num_records: c_int,
        d_cf_pixels: *const f32,
        d_cells: *const GpuCfCell,
        shape: GpuGridShape,
        d_grid: *const f64,
        d_scales: *const f64,
        d_out: *mut f32,
    ) -> *const c_char;

    pub(crate) fn get_gpu_device_info(
        device: c_int,
        name: *mut c_char,
        device_major: *mut c_int,
        device_minor: *mut c_int,
        total_global_mem: *mut usize,
        driver_version: *mut c_int,
        runtime_version: *mut c_int,
    ) -> *const c_char;
}

macro_rules! gpu_kernel_call {
    ($gpu_fn:path, $($args:expr),* $(,)?) => {{
        #[allow(unused_unsafe)]
        unsafe {
            let error_message_ptr = $gpu_fn($($args),*);
            if error_message_ptr.is_null() {
                Ok(())
            } else {
                // Get the GPU error message behind the pointer.
                let error_message = std::ffi::CStr::from_ptr(error_message_ptr).to_str();
                #[cfg(feature = "cuda")]
                let error_message = error_message.unwrap_or("<cannot read CUDA error string>");
                #[cfg(feature = "hip")]
                let error_message = error_message.unwrap_or("<cannot read HIP error string>");
                let our_error_message = format!("{}: {error_message}", stringify!($gpu_fn));
                Err($crate::gpu::GpuError::Kernel {
                    msg: our_error_message.into(),
                    file: file!(),
                    line: line!(),
                })
            }
        }
    }};
}
pub(crate) use gpu_kernel_call;

#[derive(Clone, Copy)]
pub(crate) enum GpuCall {
    Malloc,
    CopyToDevice,
    CopyFromDevice,
}

impl GpuCall {
    #[track_caller]
    fn error(self, msg: &str) -> GpuError {
        let location = Location::caller();
        let (msg, file, line) = (msg.into(), location.file(), location.line());
        match self {
            GpuCall::Malloc => GpuError::Malloc { msg, file, line },
            GpuCall::CopyToDevice => GpuError::CopyToDevice { msg, file, line },
            GpuCall::CopyFromDevice => GpuError::CopyFromDevice { msg, file, line },
        }
    }
}

unsafe fn error_string(code: gpuError_t) -> &'static str {
    let msg = CStr::from_ptr(gpuGetErrorString(code)).to_str();
    #[cfg(feature = "cuda")]
    let msg = msg.unwrap_or("<cannot read CUDA error string>");
    #[cfg(feature = "hip")]
    let msg = msg.unwrap_or("<cannot read HIP error string>");
    msg
}

/// Run [`gpuGetLastError`] and [`gpuDeviceSynchronize`]. If either of these
/// calls return an error, it is converted to a Rust error and returned from
/// this function. The single argument describes what the just-performed
/// operation was and makes the returned error a helpful one.
///
/// # Safety
///
/// This function interfaces directly with the CUDA/HIP API. Rust errors attempt
/// to catch problems but there are no guarantees.
#[track_caller]
unsafe fn check_for_errors(gpu_call: GpuCall) -> Result<(), GpuError> {
    // Only do a device sync if we're in debug mode, for performance.
    let debug_mode = matches!(std::env::var("DEBUG").as_deref(), Ok("true"));
    if debug_mode {
        let code = gpuDeviceSynchronize();
        if code != gpuSuccess {
            return Err(gpu_call.error(error_string(code)));
        }
    }

    let code = gpuGetLastError();
    if code != gpuSuccess {
        return Err(gpu_call.error(error_string(code)));
    }

    Ok(())
}

/// A Rust-managed pointer to GPU device memory. When this is dropped,
/// [`gpuFree`] is called on the pointer.
#[derive(Debug)]
pub(crate) struct DevicePointer<T> {
    ptr: *mut T,

    /// The number of bytes allocated against `ptr`.
    size: usize,
}

// Device memory isn't tied to the host thread that allocated it.
unsafe impl<T: Send> Send for DevicePointer<T> {}

impl<T> Drop for DevicePointer<T> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                gpuFree(self.ptr.cast());
            }
        }
    }
}

impl<T> DevicePointer<T> {
    /// Get a const pointer to the device memory.
    pub(crate) fn get(&self) -> *const T {
        self.ptr as *const T
    }

    /// Get a mutable pointer to the device memory.
    pub(crate) fn get_mut(&mut self) -> *mut T {
        self.ptr
    }

    /// Get the number of elements allocated against the buffer.
    pub(crate) fn get_num_elements(&self) -> usize {
        self.size / std::mem::size_of::<T>()
    }

    /// Allocate a number of bytes on the device.
    #[track_caller]
    pub(crate) fn malloc(size: usize) -> Result<DevicePointer<T>, GpuError> {
        if size == 0 {
            Ok(Self::default())
        } else {
            let mut d_ptr = null_mut();
            unsafe {
                gpuMalloc(&mut d_ptr, size);
                check_for_errors(GpuCall::Malloc)?;
            }
            Ok(Self {
                ptr: d_ptr.cast(),
                size,
            })
        }
    }

    /// Re-allocate a number of bytes on the device. Nothing is done if `size`
    /// is smaller than `self.size`. Note that unlike `libc`'s `remalloc`, if a
    /// new buffer is created, the original bytes are not preserved.
    #[track_caller]
    pub(crate) fn realloc(&mut self, size: usize) -> Result<(), GpuError> {
        if size <= self.size {
            return Ok(());
        }

        // CUDA/HIP don't provide a realloc, so just make a new `DevicePointer`
        // and swap it with the old one; the old buffer will be dropped.
        let mut new = Self::malloc(size)?;
        std::mem::swap(self, &mut new);
        Ok(())
    }

    /// Copy a slice of data to the device. Any type is allowed, and the returned
    /// pointer is to the device memory.
    #[track_caller]
    pub(crate) fn copy_to_device(v: &[T]) -> Result<DevicePointer<T>, GpuError> {
        let size = std::mem::size_of_val(v);
        unsafe {
            let mut d_ptr = Self::malloc(size)?;
            if size > 0 {
                gpuMemcpy(
                    d_ptr.get_mut().cast(),
                    v.as_ptr().cast(),
                    size,
                    gpuMemcpyHostToDevice,
                );
                check_for_errors(GpuCall::CopyToDevice)?;
            }
            Ok(d_ptr)
        }
    }

    /// Copy a slice of data from the device. `v` must not be bigger than the
    /// device buffer; the first `v.len()` elements are copied over `v`.
    #[track_caller]
    pub(crate) fn copy_from_device(&self, v: &mut [T]) -> Result<(), GpuError> {
        if self.ptr.is_null() {
            return Err(GpuCall::CopyFromDevice
                .error("Attempted to copy data from a null device pointer"));
        }

        let size = std::mem::size_of_val(v);
        if size > self.size {
            return Err(GpuCall::CopyFromDevice.error(&format!(
                "Device buffer size {} is smaller than provided buffer size {size} (length {})",
                self.size,
                v.len()
            )));
        }

        unsafe {
            gpuMemcpy(
                v.as_mut_ptr().cast(),
                self.ptr.cast(),
                size,
                gpuMemcpyDeviceToHost,
            );
            check_for_errors(GpuCall::CopyFromDevice)
        }
    }

    /// Overwrite the device memory allocated against this [`DevicePointer`]
    /// with new memory. If the amount of memory associated with `v` exceeds
    /// what is already allocated against the pointer, then the buffer is freed
    /// and another is created to fit `v` (i.e. re-alloc).
    #[track_caller]
    pub(crate) fn overwrite(&mut self, v: &[T]) -> Result<(), GpuError> {
        // Nothing to do if the collection is empty.
        if v.is_empty() {
            return Ok(());
        }

        let size = std::mem::size_of_val(v);
        self.realloc(size)?;
        unsafe {
            gpuMemcpy(
                self.get_mut() as *mut c_void,
                v.as_ptr().cast(),
                size,
                gpuMemcpyHostToDevice,
            );
            check_for_errors(GpuCall::CopyToDevice)
        }
    }

    /// Clear all of the bytes in the buffer by writing zeros.
    pub(crate) fn clear(&mut self) {
        #[cfg(feature = "cuda")]
        use cuda_runtime_sys::cudaMemset as gpuMemset;
        #[cfg(feature = "hip")]
        use hip_sys::hiprt::hipMemset as gpuMemset;

        unsafe {
            if self.size > 0 {
                gpuMemset(self.get_mut().cast(), 0, self.size);
            }
        }
    }
}

impl<T> Default for DevicePointer<T> {
    fn default() -> Self {
        Self {
            ptr: null_mut(),
            size: 0,
        }
    }
}

#[derive(Error, Debug)]
pub enum GpuError {
    #[cfg(feature = "cuda")]
    #[error("{file}:{line}: cudaMemcpy to device failed: {msg}")]
    CopyToDevice {
        msg: Box<str>,
        file: &'static str,
        line: u32,
    },

    #[cfg(feature = "hip")]
    #[error("{file}:{line}: hipMemcpy to device failed: {msg}")]
    CopyToDevice {
        msg: Box<str>,
        file: &'static str,
        line: u32,
    },

    #[cfg(feature = "cuda")]
    #[error("{file}:{line}: cudaMemcpy from device failed: {msg}")]
    CopyFromDevice {
        msg: Box<str>,
        file: &'static str,
        line: u32,
    },

    #[cfg(feature = "hip")]
    #[error("{file}:{line}: hipMemcpy from device failed: {msg}")]
    CopyFromDevice {
        msg: Box<str>,
        file: &'static str,
        line: u32,
    },

    #[cfg(feature = "cuda")]
    #[error("{file}:{line}: cudaMalloc error: {msg}")]
    Malloc {
        msg: Box<str>,
        file: &'static str,
        line: u32,
    },

    #[cfg(feature = "hip")]
    #[error("{file}:{line}: hipMalloc error: {msg}")]
    Malloc {
        msg: Box<str>,
        file: &'static str,
        line: u32,
    },

    #[cfg(feature = "cuda")]
    #[error("{file}:{line}: CUDA kernel error: {msg}")]
    Kernel {
        msg: Box<str>,
        file: &'static str,
        line: u32,
    },

    #[cfg(feature = "hip")]
    #[error("{file}:{line}: HIP kernel error: {msg}")]
    Kernel {
        msg: Box<str>,
        file: &'static str,
        line: u32,
    },

    #[error("{file}:{line}: {msg}")]
    Generic {
        msg: Box<str>,
        file: &'static str,
        line: u32,
    },
}
