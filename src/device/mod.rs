//! Hardware device contexts and the process-wide registry that shares them.

#[cfg(feature = "nvenc")]
pub mod cuda;

use std::{collections::HashMap, fmt, sync::Arc};

use once_cell::sync::Lazy;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use tracing::{debug, info};

use crate::{
    codec::{CodecDescriptor, CodecError},
    frame::VideoFramePixelFormat,
    params::CodecParams,
    track::CodecModule,
};

/// Surfaces allocated per hardware frame pool.
pub const HW_FRAME_POOL_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub module: CodecModule,
    pub device_index: u32,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.module, self.device_index)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("{0} has no device contexts")]
    Unsupported(CodecModule),
    #[error("device #{index} does not exist ({count} present)")]
    NoSuchDevice { index: u32, count: u32 },
    #[error("driver error: {0}")]
    Driver(String),
    #[error("could not bind device context to codec")]
    Bind(#[source] CodecError),
}

/// Driver-level handle backing a device context.
pub enum DeviceHandle {
    #[cfg(feature = "nvenc")]
    Cuda(cuda::Context),
    /// No driver behind it; used for emulated devices.
    Virtual,
}

/// An initialized hardware acceleration session on one device.
pub struct DeviceContext {
    key: DeviceKey,
    name: String,
    handle: DeviceHandle,
}

impl DeviceContext {
    pub fn new(key: DeviceKey, name: impl Into<String>, handle: DeviceHandle) -> Self {
        Self {
            key,
            name: name.into(),
            handle,
        }
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("key", &self.key)
            .field("name", &self.name)
            .finish()
    }
}

pub trait DeviceContextFactory: Send + Sync {
    fn create(&self, key: DeviceKey) -> Result<DeviceContext, DeviceError>;
}

/// Creates contexts through the vendor drivers compiled into this build.
pub struct DriverDeviceFactory;

impl DeviceContextFactory for DriverDeviceFactory {
    fn create(&self, key: DeviceKey) -> Result<DeviceContext, DeviceError> {
        match key.module {
            #[cfg(feature = "nvenc")]
            CodecModule::Nvenc => cuda::create_device_context(key),
            module => Err(DeviceError::Unsupported(module)),
        }
    }
}

/// Registry of device contexts keyed by module and device index.
///
/// Contexts are created on first use and live as long as the registry (or
/// longer, while an encoder still holds one). Creation of a key happens at
/// most once; concurrent acquirers of a new key all receive the first
/// context created.
pub struct DeviceContextManager {
    factory: Box<dyn DeviceContextFactory>,
    contexts: RwLock<HashMap<DeviceKey, Arc<DeviceContext>>>,
}

static GLOBAL: Lazy<Arc<DeviceContextManager>> =
    Lazy::new(|| Arc::new(DeviceContextManager::new(Box::new(DriverDeviceFactory))));

impl DeviceContextManager {
    pub fn new(factory: Box<dyn DeviceContextFactory>) -> Self {
        Self {
            factory,
            contexts: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry backed by the vendor drivers.
    pub fn global() -> &'static Arc<DeviceContextManager> {
        &GLOBAL
    }

    pub fn acquire(
        &self,
        module: CodecModule,
        device_index: u32,
    ) -> Result<Arc<DeviceContext>, DeviceError> {
        let key = DeviceKey {
            module,
            device_index,
        };

        if let Some(context) = self.contexts.read().get(&key) {
            return Ok(context.clone());
        }

        // Only one upgradable guard exists at a time: whoever holds it either
        // sees the winner's context or is the winner. Plain readers keep
        // going while the winner creates; only the insert is exclusive.
        let contexts = self.contexts.upgradable_read();
        if let Some(context) = contexts.get(&key) {
            return Ok(context.clone());
        }
        let context = Arc::new(self.factory.create(key)?);
        info!(device = %key, name = context.name(), "created device context");
        RwLockUpgradableReadGuard::upgrade(contexts).insert(key, context.clone());
        Ok(context)
    }

    /// Lookup without creating.
    pub fn get(&self, key: DeviceKey) -> Option<Arc<DeviceContext>> {
        self.contexts.read().get(&key).cloned()
    }

    /// Number of references to a context held outside the registry.
    pub fn references(&self, key: DeviceKey) -> usize {
        self.contexts
            .read()
            .get(&key)
            .map_or(0, |context| Arc::strong_count(context) - 1)
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the registry's references. Contexts still held by encoders stay
    /// alive until those encoders let go.
    pub fn reset(&self) {
        let dropped = std::mem::take(&mut *self.contexts.write());
        debug!(count = dropped.len(), "device registry reset");
    }
}

/// Shape of the surfaces a hardware frame pool holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePoolDesc {
    pub hw_format: VideoFramePixelFormat,
    pub sw_format: VideoFramePixelFormat,
    pub width: u32,
    pub height: u32,
    pub surfaces: usize,
}

impl FramePoolDesc {
    pub fn for_params(params: &CodecParams) -> Self {
        Self {
            hw_format: params.pixel_format,
            sw_format: params.sw_format,
            width: params.width,
            height: params.height,
            surfaces: HW_FRAME_POOL_SIZE,
        }
    }
}

/// Staging surfaces for one hardware encoder, bound to that encoder's device
/// context. Never shared between encoders.
#[derive(Debug)]
pub struct HwFramePool {
    device: Arc<DeviceContext>,
    desc: FramePoolDesc,
}

impl HwFramePool {
    pub fn new(
        device: &Arc<DeviceContext>,
        codec: &CodecDescriptor,
        desc: FramePoolDesc,
    ) -> Result<Self, CodecError> {
        if device.key().module != codec.module {
            return Err(CodecError::Unsupported(format!(
                "{} frames on a {} device",
                codec.name,
                device.key().module
            )));
        }
        if !codec.accepts(desc.sw_format) {
            return Err(CodecError::InvalidParameter {
                option: "sw_format",
                value: format!("{:?}", desc.sw_format),
            });
        }
        if desc.width == 0 || desc.height == 0 {
            return Err(CodecError::InvalidParameter {
                option: "size",
                value: format!("{}x{}", desc.width, desc.height),
            });
        }
        if desc.sw_format.is_420() && (desc.width % 2 != 0 || desc.height % 2 != 0) {
            return Err(CodecError::InvalidParameter {
                option: "size",
                value: format!("{}x{} is odd for 4:2:0", desc.width, desc.height),
            });
        }
        if desc.surfaces == 0 {
            return Err(CodecError::InvalidParameter {
                option: "initial_pool_size",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            device: device.clone(),
            desc,
        })
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn desc(&self) -> &FramePoolDesc {
        &self.desc
    }
}
