/*!

A [`Device`] is an accelerator with a command queue and a loaded [`Program`].

Every device is backed by a [`DeviceEngine`]. [`Device::builder()`] creates the
bundled host engine, which runs kernels registered as Rust functions on a worker
thread. Other backends (vendor runtimes, mocks) implement [`DeviceEngine`] and are
wrapped with [`Device::from_engine()`].

Creating a device with a vector add kernel:
```
# use cuplex::{anyhow::Result, device::Device};
# fn main() -> Result<()> {
let device = Device::builder()
    .name("u250")
    .kernel("vadd", 4, |args| {
        let [a, b, c, _n] = args.as_mut_slice() else {
            unreachable!()
        };
        let (a, b) = (a.as_slice::<i32>()?, b.as_slice::<i32>()?);
        for (c, (a, b)) in c.as_slice_mut::<i32>()?.iter_mut().zip(a.iter().zip(b)) {
            *c = a + b;
        }
        Ok(())
    })
    .build()?;
dbg!(device.info());
# Ok(())
# }
```

# Queues
Commands on a device are ordered only by the events they wait on. The host engine
executes them in submission order on one queue.
*/

use crate::{
    event::Event,
    result::Result,
    scalar::ScalarElem,
};
use std::{
    fmt::{self, Debug},
    path::Path,
    ptr::NonNull,
    sync::Arc,
};

mod host_engine;
pub use host_engine::{HostKernelFn, KernelArg, KernelArgs};

/// Errors.
pub mod error {
    /// The device has exited and can not execute commands.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("Device({device}) was lost!")]
    pub struct DeviceLost {
        pub(crate) device: String,
    }

    /// The loaded program does not contain the kernel.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("Kernel {kernel:?} not found in program {program:?}!")]
    pub struct KernelNotFound {
        pub(crate) kernel: String,
        pub(crate) program: String,
    }

    /// No program has been loaded on the device.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("No program loaded on Device({device})!")]
    pub struct ProgramNotLoaded {
        pub(crate) device: String,
    }

    /// No device matched the name filter.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("No device matches {filter:?}, found {devices:?}!")]
    pub struct DeviceNotFound {
        pub(crate) filter: String,
        pub(crate) devices: Vec<String>,
    }
}
use error::*;

/// Builders.
pub mod builder {
    use super::*;

    /// Builder for creating a host [`Device`].
    pub struct DeviceBuilder {
        pub(super) options: host_engine::HostOptions,
    }

    impl DeviceBuilder {
        /// Name of the device, defaults to "host".
        pub fn name(mut self, name: impl Into<String>) -> Self {
            self.options.name = name.into();
            self
        }
        /// Number of compute units reported in [`DeviceInfo`], defaults to 1.
        ///
        /// Informational only. The host engine executes every command on one in-order
        /// queue, so launches on different compute units never overlap.
        pub fn compute_units(mut self, compute_units: usize) -> Self {
            self.options.compute_units = compute_units;
            self
        }
        /// Adds a kernel.
        ///
        /// `args` is the number of arguments of the kernel. The function receives
        /// the arguments of each launch, in slot order.
        pub fn kernel<F>(mut self, name: impl Into<String>, args: usize, f: F) -> Self
        where
            F: Fn(&mut KernelArgs<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
        {
            self.options.kernels.push((
                KernelDesc {
                    name: name.into(),
                    args,
                },
                Arc::new(f),
            ));
            self
        }
        /// Creates a device.
        ///
        /// **errors**
        /// - The worker thread could not be spawned.
        pub fn build(self) -> Result<Device> {
            let engine = host_engine::HostEngine::new(self.options)?;
            Ok(Device::from_engine(engine))
        }
    }
}
use builder::*;

/// Identifies a buffer allocated by a [`DeviceEngine`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BufferId(u64);

impl BufferId {
    /// Creates an id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
    /// The raw id.
    pub const fn get(&self) -> u64 {
        self.0
    }
}

/// A region of host memory passed to a device copy.
///
/// The region is not owned. Whoever enqueues a copy with it guarantees that the memory
/// stays valid, and is not accessed mutably by anyone else, until the copy's event
/// completes.
#[derive(Clone, Copy, Debug)]
pub struct HostPtr {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: HostPtr is a plain address, access is governed by the enqueue contract.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    /// A region of `len` bytes at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be valid for reads (and writes, if used for a device to host
    /// copy) of `len` bytes.
    pub const unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }
    /// The number of bytes.
    pub fn len(&self) -> usize {
        self.len
    }
    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// # Safety
    /// See [`HostPtr::new()`].
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
    /// # Safety
    /// See [`HostPtr::new()`]. The region must be writable.
    pub unsafe fn as_slice_mut<'a>(&self) -> &'a mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// An argument of a kernel launch.
#[derive(Clone, Copy, Debug)]
pub enum LaunchArg {
    /// A value passed directly.
    Scalar(ScalarElem),
    /// A device buffer, None if the buffer is empty.
    Buffer(Option<BufferId>),
}

/// The signature of a kernel in a [`Program`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KernelDesc {
    name: String,
    args: usize,
}

impl KernelDesc {
    /// Creates a desc.
    pub fn new(name: impl Into<String>, args: usize) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
    /// The name of the kernel.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The number of arguments.
    pub fn args(&self) -> usize {
        self.args
    }
}

/// A program image.
///
/// The image is opaque, it is only interpreted by the device engine that loads it
/// (for FPGAs this is the bitstream).
#[derive(Clone)]
pub struct Program {
    name: String,
    image: Arc<[u8]>,
}

impl Program {
    /// Wraps an image.
    pub fn from_bytes(name: impl Into<String>, image: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
        }
    }
    /// Reads an image from `path`, named after the file stem.
    ///
    /// **errors**
    /// - The file could not be read.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let image = std::fs::read(path)
            .map_err(|e| anyhow::Error::new(e).context(format!("reading {path:?}")))?;
        let name = path
            .file_stem()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::from_bytes(name, image))
    }
    /// The name of the program.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The image.
    pub fn image(&self) -> &[u8] {
        &self.image
    }
}

impl Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.name)
            .field("bytes", &self.image.len())
            .finish()
    }
}

/// Device info.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    name: String,
    compute_units: usize,
}

impl DeviceInfo {
    /// Creates info.
    pub fn new(name: impl Into<String>, compute_units: usize) -> Self {
        Self {
            name: name.into(),
            compute_units,
        }
    }
    /// The name of the device.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The number of compute units.
    pub fn compute_units(&self) -> usize {
        self.compute_units
    }
}

/// A device backend.
///
/// Commands return an [`Event`] immediately and complete it asynchronously. A command
/// may not start before every event in its `wait` list has completed, and fails with
/// the first dependency failure.
pub trait DeviceEngine: Send + Sync {
    /// Device info.
    fn info(&self) -> &DeviceInfo;
    /// Loads a program, replacing the previous one.
    fn load_program(&self, program: &Program) -> Result<()>;
    /// Looks up a kernel in the loaded program.
    fn kernel(&self, name: &str) -> Result<KernelDesc>;
    /// Allocates a buffer of `len` bytes, `len > 0`.
    fn alloc(&self, len: usize) -> Result<BufferId>;
    /// Frees a buffer. Commands already enqueued with it still complete.
    fn release(&self, id: BufferId);
    /// Enqueues a host to device copy of all of `buffer`.
    ///
    /// # Safety
    /// `src` must stay valid for reads until the returned event completes.
    unsafe fn write(&self, buffer: BufferId, src: HostPtr, wait: &[Event]) -> Result<Event>;
    /// Enqueues a device to host copy of all of `buffer`.
    ///
    /// # Safety
    /// `dst` must stay valid for writes, and must not be accessed, until the
    /// returned event completes.
    unsafe fn read(&self, buffer: BufferId, dst: HostPtr, wait: &[Event]) -> Result<Event>;
    /// Enqueues a launch of `kernel` on `compute_unit`.
    fn launch(
        &self,
        kernel: &KernelDesc,
        compute_unit: &str,
        args: &[LaunchArg],
        wait: &[Event],
    ) -> Result<Event>;
    /// Blocks until all enqueued commands have completed.
    fn wait(&self) -> Result<(), DeviceLost>;
}

/// A device.
///
/// Devices can be cloned, which is equivalent to [`Arc::clone()`].
#[derive(Clone)]
pub struct Device {
    engine: Arc<dyn DeviceEngine>,
}

impl Device {
    /// A builder for creating a host device.
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder {
            options: host_engine::HostOptions::default(),
        }
    }
    /// Wraps an engine.
    pub fn from_engine(engine: Arc<dyn DeviceEngine>) -> Self {
        Self { engine }
    }
    /// Device info.
    pub fn info(&self) -> &DeviceInfo {
        self.engine.info()
    }
    /// Wait for previous work to finish.
    ///
    /// **errors**
    /// Returns an error if the device was lost while waiting.
    pub fn wait(&self) -> Result<(), DeviceLost> {
        self.engine.wait()
    }
    pub(crate) fn engine(&self) -> &Arc<dyn DeviceEngine> {
        &self.engine
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }
}

impl Eq for Device {}

impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({})", self.info().name())
    }
}

/// Selects the first device whose name contains `filter`, ignoring case.
///
/// **errors**
/// - [`DeviceNotFound`](error::DeviceNotFound)
pub fn select<'a>(
    devices: impl IntoIterator<Item = &'a Device>,
    filter: &str,
) -> Result<Device, DeviceNotFound> {
    let needle = filter.to_lowercase();
    let mut names = Vec::new();
    for device in devices {
        let name = device.info().name();
        if name.to_lowercase().contains(&needle) {
            return Ok(device.clone());
        }
        names.push(name.to_string());
    }
    Err(DeviceNotFound {
        filter: filter.to_string(),
        devices: names,
    })
}

/// A device buffer, freed on drop. Empty buffers are not allocated.
pub(crate) struct DeviceBuffer {
    engine: Arc<dyn DeviceEngine>,
    id: Option<BufferId>,
    len: usize,
}

impl DeviceBuffer {
    pub(crate) fn new(device: &Device, len: usize) -> Result<Self> {
        let engine = device.engine.clone();
        let id = if len > 0 {
            Some(engine.alloc(len)?)
        } else {
            None
        };
        Ok(Self { engine, id, len })
    }
    pub(crate) fn len(&self) -> usize {
        self.len
    }
    /// # Safety
    /// See [`DeviceEngine::write()`].
    pub(crate) unsafe fn upload(&self, src: HostPtr, wait: &[Event]) -> Result<Event> {
        debug_assert_eq!(src.len(), self.len);
        match self.id {
            Some(id) => unsafe { self.engine.write(id, src, wait) },
            None => Ok(Event::complete(crate::event::Command::Write)),
        }
    }
    /// # Safety
    /// See [`DeviceEngine::read()`].
    pub(crate) unsafe fn download(&self, dst: HostPtr, wait: &[Event]) -> Result<Event> {
        debug_assert_eq!(dst.len(), self.len);
        match self.id {
            Some(id) => unsafe { self.engine.read(id, dst, wait) },
            None => Ok(Event::complete(crate::event::Command::Read)),
        }
    }
    pub(crate) fn launch_arg(&self) -> LaunchArg {
        LaunchArg::Buffer(self.id)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.engine.release(id);
        }
    }
}

impl Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_device_by_name() {
        let a = Device::builder().name("xilinx_u200").build().unwrap();
        let b = Device::builder().name("xilinx_U250_gen3x16").build().unwrap();
        let devices = [a.clone(), b.clone()];
        assert_eq!(select(&devices, "u250").unwrap(), b);
        assert_eq!(select(&devices, "XILINX").unwrap(), a);
        assert!(select(&devices, "alveo").is_err());
    }

    #[test]
    fn empty_device_buffer_is_not_allocated() {
        let device = Device::builder().build().unwrap();
        let buffer = DeviceBuffer::new(&device, 0).unwrap();
        assert!(matches!(buffer.launch_arg(), LaunchArg::Buffer(None)));
        let mut bytes = [0u8; 0];
        let dst = unsafe { HostPtr::new(NonNull::new(bytes.as_mut_ptr()).unwrap(), 0) };
        let event = unsafe { buffer.download(dst, &[]).unwrap() };
        assert!(event.is_complete());
    }

    #[test]
    fn program_from_file() {
        let path = std::env::temp_dir().join(format!("cuplex-{}.xclbin", std::process::id()));
        std::fs::write(&path, b"bitstream").unwrap();
        let program = Program::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(program.image(), b"bitstream");
        assert!(program.name().starts_with("cuplex-"));
        assert!(Program::from_file(&path).is_err());
    }
}
