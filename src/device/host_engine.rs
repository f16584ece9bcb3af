use super::{
    error::{DeviceLost, KernelNotFound, ProgramNotLoaded},
    BufferId, DeviceEngine, DeviceInfo, HostPtr, KernelDesc, LaunchArg, Program,
};
use crate::{
    alloc::AlignedVec,
    event::{Command, Event},
    scalar::{Scalar, ScalarElem},
};
use anyhow::{bail, format_err, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

/// A kernel implemented on the host.
pub type HostKernelFn = Arc<dyn Fn(&mut KernelArgs<'_>) -> Result<()> + Send + Sync>;

pub(super) struct HostOptions {
    pub(super) name: String,
    pub(super) compute_units: usize,
    pub(super) kernels: Vec<(KernelDesc, HostKernelFn)>,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            name: "host".to_string(),
            compute_units: 1,
            kernels: Vec::new(),
        }
    }
}

/// An argument of a host kernel.
pub enum KernelArg<'a> {
    /// A value.
    Scalar(ScalarElem),
    /// The bytes of a device buffer.
    Buffer(&'a mut [u8]),
}

impl KernelArg<'_> {
    /// The value of a scalar argument.
    pub fn as_scalar<T: Scalar>(&self) -> Result<T> {
        match self {
            Self::Scalar(x) => x.to_scalar().ok_or_else(|| {
                format_err!("Expected {}, found {}!", T::SCALAR_TYPE, x.scalar_type())
            }),
            Self::Buffer(_) => bail!("Expected {}, found a buffer!", T::SCALAR_TYPE),
        }
    }
    /// The elements of a buffer argument.
    pub fn as_slice<T: Scalar>(&self) -> Result<&[T]> {
        match self {
            Self::Buffer(bytes) if bytes.is_empty() => Ok(&[]),
            Self::Buffer(bytes) => bytemuck::try_cast_slice(bytes)
                .map_err(|e| format_err!("Buffer is not a [{}]: {e:?}", T::SCALAR_TYPE)),
            Self::Scalar(x) => bail!("Expected a buffer, found {:?}!", x),
        }
    }
    /// The elements of a buffer argument, mutably.
    pub fn as_slice_mut<T: Scalar>(&mut self) -> Result<&mut [T]> {
        match self {
            Self::Buffer(bytes) if bytes.is_empty() => Ok(&mut []),
            Self::Buffer(bytes) => bytemuck::try_cast_slice_mut(bytes)
                .map_err(|e| format_err!("Buffer is not a [{}]: {e:?}", T::SCALAR_TYPE)),
            Self::Scalar(x) => bail!("Expected a buffer, found {:?}!", x),
        }
    }
}

/// The arguments of a host kernel launch.
pub struct KernelArgs<'a> {
    compute_unit: &'a str,
    args: Vec<KernelArg<'a>>,
}

impl<'a> KernelArgs<'a> {
    /// The compute unit the kernel runs on.
    pub fn compute_unit(&self) -> &str {
        self.compute_unit
    }
    /// The number of arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }
    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
    /// The arguments.
    pub fn as_slice(&self) -> &[KernelArg<'a>] {
        &self.args
    }
    /// The arguments, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [KernelArg<'a>] {
        &mut self.args
    }
    /// The value of scalar argument `index`.
    pub fn scalar<T: Scalar>(&self, index: usize) -> Result<T> {
        self.args
            .get(index)
            .ok_or_else(|| format_err!("Argument {index} out of range 0..{}!", self.args.len()))?
            .as_scalar()
    }
}

type Storage = Arc<Mutex<AlignedVec<u8>>>;

enum HostArg {
    Scalar(ScalarElem),
    Buffer(Option<Storage>),
}

enum Op {
    Write {
        dst: Storage,
        src: HostPtr,
        wait: Vec<Event>,
        event: Event,
    },
    Read {
        src: Storage,
        dst: HostPtr,
        wait: Vec<Event>,
        event: Event,
    },
    Launch {
        kernel: HostKernelFn,
        name: String,
        compute_unit: String,
        args: Vec<HostArg>,
        wait: Vec<Event>,
        event: Event,
    },
    Exit,
}

impl Op {
    fn event(&self) -> Option<&Event> {
        match self {
            Op::Write { event, .. } | Op::Read { event, .. } | Op::Launch { event, .. } => {
                Some(event)
            }
            Op::Exit => None,
        }
    }
}

fn drain_lost(receiver: &Receiver<Op>, device: &str) {
    for op in receiver.try_iter() {
        if let Some(event) = op.event() {
            log::warn!("Device({device}) dropped a {} command", event.command());
            event.signal(Err(DeviceLost {
                device: device.to_string(),
            }
            .into()));
        }
    }
}

pub(super) struct HostEngine {
    info: DeviceInfo,
    kernels: HashMap<String, (KernelDesc, HostKernelFn)>,
    program: Mutex<Option<Program>>,
    buffers: DashMap<BufferId, Storage>,
    next_id: AtomicU64,
    op_sender: Sender<Op>,
    op_receiver: Receiver<Op>,
    last: Mutex<Option<Event>>,
    worker_exited: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HostEngine {
    pub(super) fn new(options: HostOptions) -> Result<Arc<Self>> {
        let HostOptions {
            name,
            compute_units,
            kernels,
        } = options;
        let kernels = kernels
            .into_iter()
            .map(|(desc, f)| (desc.name.clone(), (desc, f)))
            .collect();
        let (op_sender, op_receiver) = unbounded();
        let worker = Worker {
            device: name.clone(),
            op_receiver: op_receiver.clone(),
            exited: Arc::new(AtomicBool::default()),
        };
        let worker_exited = worker.exited.clone();
        let handle = std::thread::Builder::new()
            .name(format!("cuplex-{name}-queue"))
            .spawn(move || worker.run())?;
        Ok(Arc::new(Self {
            info: DeviceInfo::new(name, compute_units),
            kernels,
            program: Mutex::default(),
            buffers: DashMap::default(),
            next_id: AtomicU64::new(1),
            op_sender,
            op_receiver,
            last: Mutex::default(),
            worker_exited,
            worker: Mutex::new(Some(handle)),
        }))
    }
    fn device_lost(&self) -> DeviceLost {
        DeviceLost {
            device: self.info.name().to_string(),
        }
    }
    fn storage(&self, id: BufferId) -> Result<Storage> {
        self.buffers
            .get(&id)
            .map(|x| x.value().clone())
            .ok_or_else(|| {
                format_err!("Buffer {} not found on Device({})!", id.get(), self.info.name())
            })
    }
    fn send_op(&self, op: Op) -> Result<Event> {
        let event = op
            .event()
            .cloned()
            .ok_or_else(|| format_err!("Op has no event!"))?;
        if self.worker_exited.load(Ordering::SeqCst) {
            return Err(self.device_lost().into());
        }
        let mut last = self.last.lock();
        self.op_sender
            .send(op)
            .map_err(|_| anyhow::Error::new(self.device_lost()))?;
        last.replace(event.clone());
        if self.worker_exited.load(Ordering::SeqCst) {
            drain_lost(&self.op_receiver, self.info.name());
        }
        Ok(event)
    }
}

impl DeviceEngine for HostEngine {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }
    fn load_program(&self, program: &Program) -> Result<()> {
        log::info!(
            "Device({}) loaded program {:?} ({}B)",
            self.info.name(),
            program.name(),
            program.image().len()
        );
        self.program.lock().replace(program.clone());
        Ok(())
    }
    fn kernel(&self, name: &str) -> Result<KernelDesc> {
        let program = self.program.lock();
        let program = program.as_ref().ok_or_else(|| ProgramNotLoaded {
            device: self.info.name().to_string(),
        })?;
        let (desc, _) = self.kernels.get(name).ok_or_else(|| KernelNotFound {
            kernel: name.to_string(),
            program: program.name().to_string(),
        })?;
        Ok(desc.clone())
    }
    fn alloc(&self, len: usize) -> Result<BufferId> {
        let storage = AlignedVec::zeroed(len)?;
        let id = BufferId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.buffers.insert(id, Arc::new(Mutex::new(storage)));
        Ok(id)
    }
    fn release(&self, id: BufferId) {
        self.buffers.remove(&id);
    }
    unsafe fn write(&self, buffer: BufferId, src: HostPtr, wait: &[Event]) -> Result<Event> {
        let dst = self.storage(buffer)?;
        self.send_op(Op::Write {
            dst,
            src,
            wait: wait.to_vec(),
            event: Event::new(Command::Write),
        })
    }
    unsafe fn read(&self, buffer: BufferId, dst: HostPtr, wait: &[Event]) -> Result<Event> {
        let src = self.storage(buffer)?;
        self.send_op(Op::Read {
            src,
            dst,
            wait: wait.to_vec(),
            event: Event::new(Command::Read),
        })
    }
    fn launch(
        &self,
        kernel: &KernelDesc,
        compute_unit: &str,
        args: &[LaunchArg],
        wait: &[Event],
    ) -> Result<Event> {
        let (desc, f) = self.kernels.get(kernel.name()).ok_or_else(|| KernelNotFound {
            kernel: kernel.name().to_string(),
            program: self
                .program
                .lock()
                .as_ref()
                .map(|x| x.name().to_string())
                .unwrap_or_default(),
        })?;
        if args.len() != desc.args() {
            bail!(
                "Kernel {:?} takes {} arguments, found {}!",
                desc.name(),
                desc.args(),
                args.len()
            );
        }
        let args = args
            .iter()
            .map(|arg| {
                Ok(match arg {
                    LaunchArg::Scalar(x) => HostArg::Scalar(*x),
                    LaunchArg::Buffer(Some(id)) => HostArg::Buffer(Some(self.storage(*id)?)),
                    LaunchArg::Buffer(None) => HostArg::Buffer(None),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.send_op(Op::Launch {
            kernel: f.clone(),
            name: desc.name().to_string(),
            compute_unit: compute_unit.to_string(),
            args,
            wait: wait.to_vec(),
            event: Event::new(Command::Launch),
        })
    }
    fn wait(&self) -> Result<(), DeviceLost> {
        let last = self.last.lock().clone();
        if let Some(event) = last {
            // Command failures are reported through their own events.
            let _ = event.wait();
        }
        if self.worker_exited.load(Ordering::SeqCst) {
            return Err(self.device_lost());
        }
        Ok(())
    }
}

impl Drop for HostEngine {
    fn drop(&mut self) {
        if self.op_sender.send(Op::Exit).is_ok() {
            if let Some(handle) = self.worker.lock().take() {
                if handle.join().is_err() {
                    log::warn!("Device({}) worker panicked", self.info.name());
                }
            }
        }
        drain_lost(&self.op_receiver, self.info.name());
    }
}

struct Worker {
    device: String,
    op_receiver: Receiver<Op>,
    exited: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        while let Ok(op) = self.op_receiver.recv() {
            if let Op::Exit = op {
                break;
            }
            self.execute(op);
        }
    }
    fn execute(&self, op: Op) {
        match op {
            Op::Write {
                dst,
                src,
                wait,
                event,
            } => {
                if let Err(e) = Event::wait_all(&wait) {
                    event.fail(e);
                    return;
                }
                log::trace!("Device({}) write {}B", self.device, src.len());
                let result = (|| {
                    let mut dst = dst.lock();
                    if dst.len() != src.len() {
                        bail!("Host region is {}B, buffer is {}B!", src.len(), dst.len());
                    }
                    dst.copy_from_slice(unsafe { src.as_slice() });
                    Ok(())
                })();
                event.signal(result);
            }
            Op::Read {
                src,
                dst,
                wait,
                event,
            } => {
                if let Err(e) = Event::wait_all(&wait) {
                    event.fail(e);
                    return;
                }
                log::trace!("Device({}) read {}B", self.device, dst.len());
                let result = (|| {
                    let src = src.lock();
                    if src.len() != dst.len() {
                        bail!("Host region is {}B, buffer is {}B!", dst.len(), src.len());
                    }
                    unsafe { dst.as_slice_mut() }.copy_from_slice(&src);
                    Ok(())
                })();
                event.signal(result);
            }
            Op::Launch {
                kernel,
                name,
                compute_unit,
                args,
                wait,
                event,
            } => {
                if let Err(e) = Event::wait_all(&wait) {
                    event.fail(e);
                    return;
                }
                log::trace!("Device({}) launch {name} on {compute_unit}", self.device);
                let result = launch(&kernel, &name, &compute_unit, &args);
                event.signal(result);
            }
            Op::Exit => (),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.exited.store(true, Ordering::SeqCst);
        drain_lost(&self.op_receiver, &self.device);
    }
}

fn launch(kernel: &HostKernelFn, name: &str, compute_unit: &str, args: &[HostArg]) -> Result<()> {
    let storages: Vec<&Storage> = args
        .iter()
        .filter_map(|arg| match arg {
            HostArg::Buffer(Some(storage)) => Some(storage),
            _ => None,
        })
        .collect();
    for (i, a) in storages.iter().enumerate() {
        if storages[..i].iter().any(|b| Arc::ptr_eq(a, b)) {
            bail!("Kernel {name:?} was passed the same buffer twice!");
        }
    }
    let mut guards: Vec<Option<MutexGuard<AlignedVec<u8>>>> = args
        .iter()
        .map(|arg| match arg {
            HostArg::Buffer(Some(storage)) => Some(storage.lock()),
            _ => None,
        })
        .collect();
    let args = args
        .iter()
        .zip(guards.iter_mut())
        .map(|(arg, guard)| match (arg, guard) {
            (HostArg::Scalar(x), _) => KernelArg::Scalar(*x),
            (HostArg::Buffer(_), Some(guard)) => KernelArg::Buffer(guard.as_mut_slice()),
            (HostArg::Buffer(_), None) => KernelArg::Buffer(&mut []),
        })
        .collect();
    let mut kernel_args = KernelArgs { compute_unit, args };
    match catch_unwind(AssertUnwindSafe(|| kernel(&mut kernel_args))) {
        Ok(result) => result.map_err(|e| e.context(format!("{name} on {compute_unit}"))),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|x| x.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            bail!("Kernel {name:?} panicked on {compute_unit}: {msg}")
        }
    }
}
