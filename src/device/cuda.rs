use std::{
    ffi::{c_char, c_int, CStr},
    ptr::{null, null_mut},
};

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use nvidia_sys::cuda::{self as sys};

use super::{DeviceContext, DeviceError, DeviceHandle, DeviceKey};

static IS_INITIALIZED: OnceCell<bool> = OnceCell::new();

/// NVENC needs compute capability 3.0 or newer.
const MIN_NVENC_CAPABILITY: (i32, i32) = (3, 0);

trait CudaErrorCode {
    fn ok(self) -> std::result::Result<(), CudaError>;
}

#[derive(thiserror::Error, Debug)]
#[error("{label}: {message}")]
pub struct CudaError {
    code: sys::CUresult,
    label: String,
    message: String,
}

impl CudaErrorCode for sys::CUresult {
    fn ok(self) -> std::result::Result<(), CudaError> {
        match self {
            sys::CUresult::CUDA_SUCCESS => Ok(()),
            code => {
                let mut label: *const c_char = null();
                let mut message: *const c_char = null();
                unsafe {
                    sys::cuGetErrorName(code, &mut label);
                    sys::cuGetErrorString(code, &mut message);
                }

                let describe = |ptr: *const c_char| {
                    if ptr.is_null() {
                        format!("{code:?}")
                    } else {
                        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().to_string()
                    }
                };

                Err(CudaError {
                    code,
                    label: describe(label),
                    message: describe(message),
                })
            }
        }
    }
}

impl From<CudaError> for DeviceError {
    fn from(err: CudaError) -> Self {
        DeviceError::Driver(err.to_string())
    }
}

type Result<T> = std::result::Result<T, CudaError>;

pub fn init() -> Result<()> {
    IS_INITIALIZED.get_or_try_init(|| -> Result<bool> {
        unsafe {
            sys::cuInit(0).ok()?;
        }
        Ok(true)
    })?;

    Ok(())
}

pub struct Device {
    raw: sys::CUdevice,
}

impl Device {
    pub fn count() -> Result<c_int> {
        init()?;
        let mut count = 0;
        unsafe {
            sys::cuDeviceGetCount(&mut count).ok()?;
        }
        Ok(count)
    }

    pub fn new(idx: c_int) -> Result<Self> {
        init()?;
        let mut raw: sys::CUdevice = 0;
        unsafe {
            sys::cuDeviceGet(&mut raw, idx).ok()?;
        }

        Ok(Self { raw })
    }

    pub fn as_ptr(&self) -> sys::CUdevice {
        self.raw
    }

    pub fn name(&self) -> Result<String> {
        let mut name = vec![0 as c_char; 256];
        unsafe {
            sys::cuDeviceGetName(name.as_mut_ptr(), name.len() as _, self.raw).ok()?;
            Ok(CStr::from_ptr(name.as_ptr()).to_string_lossy().to_string())
        }
    }

    pub fn compute_capability(&self) -> Result<(i32, i32)> {
        let mut major = 0;
        let mut minor = 0;
        unsafe {
            sys::cuDeviceComputeCapability(&mut major, &mut minor, self.raw).ok()?;
        };
        Ok((major, minor))
    }
}

pub struct Context {
    raw: sys::CUcontext,
}

// CUDA contexts are not bound to the thread that created them; encode sessions
// on other threads reference them by pointer.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub fn new(flags: sys::CUctx_flags_enum, dev: &Device) -> Result<Self> {
        init()?;

        let mut raw: sys::CUcontext = null_mut();
        unsafe {
            sys::cuCtxCreate_v2(&mut raw, flags as _, dev.as_ptr()).ok()?;
            // cuCtxCreate leaves the context current on this thread.
            let mut popped: sys::CUcontext = null_mut();
            sys::cuCtxPopCurrent_v2(&mut popped).ok()?;
        };

        Ok(Self { raw })
    }

    pub fn api_version(&self) -> Result<u32> {
        let mut version = 0;
        unsafe {
            sys::cuCtxGetApiVersion(self.raw, &mut version).ok()?;
        };
        Ok(version)
    }

    pub fn as_ptr(&self) -> sys::CUcontext {
        self.raw
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(err) = unsafe { sys::cuCtxDestroy_v2(self.raw) }.ok() {
            warn!(%err, "failed to destroy CUDA context");
        }
    }
}

/// Open a blocking-sync CUDA context on the GPU the key points at.
pub fn create_device_context(key: DeviceKey) -> std::result::Result<DeviceContext, DeviceError> {
    let count = Device::count()?;
    if key.device_index as c_int >= count {
        return Err(DeviceError::NoSuchDevice {
            index: key.device_index,
            count: count as u32,
        });
    }

    let device = Device::new(key.device_index as c_int)?;
    let name = device.name()?;
    let capability = device.compute_capability()?;
    if capability < MIN_NVENC_CAPABILITY {
        return Err(DeviceError::Driver(format!(
            "{name} (compute {}.{}) doesn't support NVENC",
            capability.0, capability.1
        )));
    }

    let ctx = Context::new(sys::CUctx_flags_enum::CU_CTX_SCHED_BLOCKING_SYNC, &device)?;
    debug!(device = %key, %name, api_version = ctx.api_version()?, "opened CUDA context");

    Ok(DeviceContext::new(key, name, DeviceHandle::Cuda(ctx)))
}
