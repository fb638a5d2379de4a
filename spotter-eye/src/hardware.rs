//! Shared library bindings for the accelerator and the detection renderer
//!
//! Both are plain C ABIs loaded at runtime with `libloading`.
//!
//! Accelerator library:
//!
//! ```text
//! int    accel_init(void);
//! size_t accel_output_words(uint32_t channels, uint32_t dim);
//! size_t accel_input_words(size_t values);
//! int    accel_prepare(const float *input, size_t len, uint64_t *buf, size_t words);
//! int    accel_infer(const uint64_t *input, size_t in_words, uint64_t *output, size_t out_words);
//! int    accel_postprocess(const uint64_t *output, size_t words, float *result, size_t len);
//! int    accel_deinit(void);
//! int    accel_reset(void);
//! ```
//!
//! Renderer library:
//!
//! ```text
//! int render_detections(const float *data, size_t len, float thresh, float hier_thresh,
//!                       const char *image, const char *names, const char *data_dir,
//!                       const char *output_stem, const char *probabilities);
//! ```
//!
//! Every `int` result is 0 on success.

use crate::capability::{AcceleratorBuffer, AcceleratorDevice, DetectionRenderer, RenderRequest};
use crate::error::VisionError;
use libloading::{Library, Symbol};
use std::ffi::{c_char, c_int, CString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

static ACCELERATOR_HELD: AtomicBool = AtomicBool::new(false);

/// Process-wide exclusive claim on the accelerator device.
///
/// Only one lease exists at a time; it is returned when dropped.
#[derive(Debug)]
pub struct AcceleratorLease {
    _private: (),
}

impl AcceleratorLease {
    pub fn acquire() -> Result<Self, VisionError> {
        ACCELERATOR_HELD
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                VisionError::AcceleratorFault("accelerator is already held by another pipeline".to_string())
            })?;
        Ok(Self { _private: () })
    }

    pub fn is_held() -> bool {
        ACCELERATOR_HELD.load(Ordering::Acquire)
    }
}

impl Drop for AcceleratorLease {
    fn drop(&mut self) {
        ACCELERATOR_HELD.store(false, Ordering::Release);
    }
}

type StatusFn = unsafe extern "C" fn() -> c_int;
type OutputWordsFn = unsafe extern "C" fn(u32, u32) -> usize;
type InputWordsFn = unsafe extern "C" fn(usize) -> usize;
type PrepareFn = unsafe extern "C" fn(*const f32, usize, *mut u64, usize) -> c_int;
type InferFn = unsafe extern "C" fn(*const u64, usize, *mut u64, usize) -> c_int;
type PostprocessFn = unsafe extern "C" fn(*const u64, usize, *mut f32, usize) -> c_int;
type RenderFn = unsafe extern "C" fn(
    *const f32,
    usize,
    f32,
    f32,
    *const c_char,
    *const c_char,
    *const c_char,
    *const c_char,
    *const c_char,
) -> c_int;

fn check(call: &str, status: c_int) -> Result<(), VisionError> {
    if status == 0 {
        Ok(())
    } else {
        Err(VisionError::AcceleratorFault(format!("{} returned {}", call, status)))
    }
}

fn c_path(path: &Path) -> Result<CString, VisionError> {
    let text = path
        .to_str()
        .ok_or_else(|| VisionError::Renderer(format!("path {:?} is not valid UTF-8", path)))?;
    CString::new(text).map_err(|e| VisionError::Renderer(format!("path {:?}: {}", path, e)))
}

/// Accelerator driven through its shared library.
///
/// Initialized on open; deinitialized and reset when dropped, which also
/// returns the lease.
pub struct SharedLibraryAccelerator {
    library: Library,
    path: PathBuf,
    initialized: bool,
    _lease: AcceleratorLease,
}

impl SharedLibraryAccelerator {
    pub fn open(path: &Path) -> Result<Self, VisionError> {
        let lease = AcceleratorLease::acquire()?;
        // SAFETY: the library is trusted deployment configuration; its
        // initializers have no preconditions.
        let library = unsafe { Library::new(path) }?;
        let mut accelerator = Self {
            library,
            path: path.to_path_buf(),
            initialized: false,
            _lease: lease,
        };

        let status = {
            let init: Symbol<StatusFn> = accelerator.symbol(b"accel_init\0")?;
            // SAFETY: signature fixed by the accelerator ABI.
            unsafe { init() }
        };
        check("accel_init", status)?;
        accelerator.initialized = true;
        info!("Accelerator initialized from {:?}", path);
        Ok(accelerator)
    }

    fn symbol<T>(&self, name: &[u8]) -> Result<Symbol<'_, T>, VisionError> {
        // SAFETY: every T used with this helper matches the documented ABI.
        unsafe { self.library.get::<T>(name) }.map_err(|e| {
            VisionError::AcceleratorFault(format!(
                "{:?} lacks {}: {}",
                self.path,
                String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)),
                e
            ))
        })
    }

    fn shutdown(&self) -> Result<(), VisionError> {
        let deinit: Symbol<StatusFn> = self.symbol(b"accel_deinit\0")?;
        // SAFETY: signature fixed by the accelerator ABI.
        check("accel_deinit", unsafe { deinit() })?;
        let reset: Symbol<StatusFn> = self.symbol(b"accel_reset\0")?;
        // SAFETY: signature fixed by the accelerator ABI.
        check("accel_reset", unsafe { reset() })
    }
}

impl AcceleratorDevice for SharedLibraryAccelerator {
    fn allocate_output(&mut self, channels: usize, dim: usize) -> Result<AcceleratorBuffer, VisionError> {
        let output_words: Symbol<OutputWordsFn> = self.symbol(b"accel_output_words\0")?;
        let (ch, d) = (
            u32::try_from(channels).map_err(|e| VisionError::AcceleratorFault(e.to_string()))?,
            u32::try_from(dim).map_err(|e| VisionError::AcceleratorFault(e.to_string()))?,
        );
        // SAFETY: pure size query.
        let words = unsafe { output_words(ch, d) };
        Ok(AcceleratorBuffer::zeroed(words, channels * dim * dim))
    }

    fn prepare(&mut self, input: &[f32]) -> Result<AcceleratorBuffer, VisionError> {
        let input_words: Symbol<InputWordsFn> = self.symbol(b"accel_input_words\0")?;
        let prepare: Symbol<PrepareFn> = self.symbol(b"accel_prepare\0")?;
        // SAFETY: pure size query.
        let words = unsafe { input_words(input.len()) };
        let mut buffer = AcceleratorBuffer::zeroed(words, input.len());
        let out = buffer.words_mut();
        // SAFETY: both pointers are valid for the lengths passed alongside.
        check("accel_prepare", unsafe {
            prepare(input.as_ptr(), input.len(), out.as_mut_ptr(), out.len())
        })?;
        Ok(buffer)
    }

    fn infer(&mut self, input: &AcceleratorBuffer, output: &mut AcceleratorBuffer) -> Result<(), VisionError> {
        let infer: Symbol<InferFn> = self.symbol(b"accel_infer\0")?;
        let src = input.words();
        let dst = output.words_mut();
        // SAFETY: both pointers are valid for the lengths passed alongside.
        check("accel_infer", unsafe {
            infer(src.as_ptr(), src.len(), dst.as_mut_ptr(), dst.len())
        })
    }

    fn postprocess(&mut self, output: &AcceleratorBuffer) -> Result<Vec<f32>, VisionError> {
        let postprocess: Symbol<PostprocessFn> = self.symbol(b"accel_postprocess\0")?;
        let mut result = vec![0.0f32; output.elements()];
        let src = output.words();
        // SAFETY: both pointers are valid for the lengths passed alongside.
        check("accel_postprocess", unsafe {
            postprocess(src.as_ptr(), src.len(), result.as_mut_ptr(), result.len())
        })?;
        Ok(result)
    }
}

impl Drop for SharedLibraryAccelerator {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }
        match self.shutdown() {
            Ok(()) => info!("Accelerator released"),
            Err(e) => error!("Accelerator release failed, device may need a manual reset: {}", e),
        }
    }
}

/// Detection renderer driven through its shared library.
pub struct SharedLibraryRenderer {
    library: Library,
    names_path: CString,
    data_dir: CString,
}

impl SharedLibraryRenderer {
    pub fn open(path: &Path, names_path: &Path, data_dir: &Path) -> Result<Self, VisionError> {
        // SAFETY: the library is trusted deployment configuration.
        let library = unsafe { Library::new(path) }?;
        if !names_path.is_file() {
            warn!("Class names file {:?} not found", names_path);
        }
        // the renderer concatenates file names onto the data directory
        let mut data_dir = data_dir.as_os_str().to_os_string();
        if !data_dir.to_string_lossy().ends_with(std::path::MAIN_SEPARATOR) {
            data_dir.push(std::path::MAIN_SEPARATOR_STR);
        }
        info!("Renderer loaded from {:?}", path);
        Ok(Self {
            library,
            names_path: c_path(names_path)?,
            data_dir: c_path(Path::new(&data_dir))?,
        })
    }
}

impl DetectionRenderer for SharedLibraryRenderer {
    fn draw_and_score(&mut self, request: &RenderRequest<'_>) -> Result<PathBuf, VisionError> {
        // SAFETY: signature fixed by the renderer ABI.
        let render: Symbol<RenderFn> = unsafe { self.library.get(b"render_detections\0") }
            .map_err(|e| VisionError::Renderer(format!("render_detections: {}", e)))?;

        let image = c_path(request.image_path)?;
        let stem = c_path(request.output_stem)?;
        let probabilities = c_path(request.probabilities_path)?;

        // SAFETY: all pointers stay valid for the duration of the call.
        let status = unsafe {
            render(
                request.detections.as_ptr(),
                request.detections.len(),
                request.class_threshold,
                request.hierarchy_threshold,
                image.as_ptr(),
                self.names_path.as_ptr(),
                self.data_dir.as_ptr(),
                stem.as_ptr(),
                probabilities.as_ptr(),
            )
        };
        if status != 0 {
            return Err(VisionError::Renderer(format!("render_detections returned {}", status)));
        }

        Ok(PathBuf::from(format!("{}.png", request.output_stem.to_string_lossy())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // one test owns the process-wide lease so parallel tests cannot race on it
    #[test]
    fn test_lease_lifecycle() {
        let lease = AcceleratorLease::acquire().unwrap();
        assert!(AcceleratorLease::is_held());
        assert!(matches!(
            AcceleratorLease::acquire(),
            Err(VisionError::AcceleratorFault(_))
        ));
        assert!(matches!(
            SharedLibraryAccelerator::open(Path::new("/nonexistent/libaccel.so")),
            Err(VisionError::AcceleratorFault(_))
        ));
        drop(lease);
        assert!(!AcceleratorLease::is_held());

        // a failed open returns the lease
        let result = SharedLibraryAccelerator::open(Path::new("/nonexistent/libaccel.so"));
        assert!(matches!(result, Err(VisionError::Library(_))));
        assert!(!AcceleratorLease::is_held());

        let again = AcceleratorLease::acquire();
        assert!(again.is_ok());
    }

    #[test]
    fn test_missing_renderer_library() {
        let result = SharedLibraryRenderer::open(
            Path::new("/nonexistent/librender.so"),
            Path::new("voc.names"),
            Path::new("/opt/darknet"),
        );
        assert!(matches!(result, Err(VisionError::Library(_))));
    }

    #[test]
    fn test_status_check() {
        assert!(check("accel_infer", 0).is_ok());
        let err = check("accel_infer", -2).unwrap_err();
        assert!(err.to_string().contains("accel_infer returned -2"));
    }
}
