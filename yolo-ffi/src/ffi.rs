//! C interface, declared in `include/yolov8.h`.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::path::PathBuf;

use tracing::error;

use crate::Detector;

/// Opaque model handle owned by the caller between `load_model` and
/// `release_model`.
pub struct YOLOv8 {
    detector: Detector,
}

/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn path_arg(ptr: *const c_char) -> Option<PathBuf> {
    if ptr.is_null() {
        return None;
    }
    let c_str = CStr::from_ptr(ptr);
    Some(PathBuf::from(c_str.to_string_lossy().into_owned()))
}

/// Loads an exported artifact. Returns null on failure.
///
/// # Safety
/// `model_path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn load_model(model_path: *const c_char) -> *mut YOLOv8 {
    let Some(path) = path_arg(model_path) else {
        return std::ptr::null_mut();
    };
    match Detector::load(&path) {
        Ok(detector) => Box::into_raw(Box::new(YOLOv8 { detector })),
        Err(e) => {
            error!(path = %path.display(), "Error loading the model: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Detects objects in `frame_path` and writes the annotated frame to
/// `output_path`. Returns the detection count, or -1 on failure.
///
/// # Safety
/// `model` must be null or a live pointer from [`load_model`]; the paths
/// must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn process_frame(
    model: *mut YOLOv8,
    frame_path: *const c_char,
    output_path: *const c_char,
) -> c_int {
    if model.is_null() {
        return -1;
    }
    let (Some(frame), Some(output)) = (path_arg(frame_path), path_arg(output_path)) else {
        return -1;
    };
    let model = &*model;
    match model.detector.process_frame(&frame, &output) {
        Ok(n) => c_int::try_from(n).unwrap_or(c_int::MAX),
        Err(e) => {
            error!(frame = %frame.display(), "Failed to process the frame: {e}");
            -1
        }
    }
}

/// Frees a handle from [`load_model`]. Null is ignored.
///
/// # Safety
/// `model` must be null or a pointer from [`load_model`] not yet released.
#[no_mangle]
pub unsafe extern "C" fn release_model(model: *mut YOLOv8) {
    if !model.is_null() {
        drop(Box::from_raw(model));
    }
}
