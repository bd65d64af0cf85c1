// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use super::*;
use serial_test::serial;

#[test]
#[serial]
fn copy_to_and_from_device_succeeds() {
    const LEN: usize = 100;
    let heap: Vec<f64> = (0..LEN).map(|i| i as f64).collect();
    let d_ptr = DevicePointer::copy_to_device(&heap).unwrap();
    assert_eq!(d_ptr.get_num_elements(), LEN);
    let mut heap2 = vec![-1.0; LEN];
    d_ptr.copy_from_device(&mut heap2).unwrap();
    assert_eq!(heap, heap2);

    // A shorter host buffer gets the leading elements.
    let mut head = [0.0; 10];
    d_ptr.copy_from_device(&mut head).unwrap();
    assert_eq!(&head, &heap[..10]);

    let mut too_long = vec![0.0; LEN + 1];
    assert!(d_ptr.copy_from_device(&mut too_long).is_err());
}

#[test]
#[serial]
fn overwrite_and_clear() {
    let mut d_ptr: DevicePointer<u32> = DevicePointer::default();
    assert!(d_ptr.get().is_null());
    d_ptr.overwrite(&[1, 2, 3]).unwrap();
    d_ptr.overwrite(&[4, 5, 6, 7, 8]).unwrap();
    let mut out = [0; 5];
    d_ptr.copy_from_device(&mut out).unwrap();
    assert_eq!(out, [4, 5, 6, 7, 8]);

    d_ptr.clear();
    d_ptr.copy_from_device(&mut out).unwrap();
    assert_eq!(out, [0; 5]);
}

#[test]
#[serial]
fn gpu_malloc_huge_fails() {
    let size = 1024_usize.pow(4); // 1 TB;
    let result: Result<DevicePointer<u8>, GpuError> = DevicePointer::malloc(size);
    assert!(result.is_err());
    let err = result.unwrap_err().to_string();
    #[cfg(feature = "cuda")]
    assert!(err.ends_with("cudaMalloc error: out of memory"), "{err}");
    #[cfg(feature = "hip")]
    assert!(
        err.contains("hipMalloc error"),
        "Error string wasn't expected; got: {err}"
    );
}

#[test]
#[serial]
fn device_info_is_available() {
    let (device, driver) = get_device_info().unwrap();
    assert!(!device.name.is_empty());
    assert!(driver.runtime_version.contains('.'));
}
