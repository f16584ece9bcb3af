/*!
Binding arguments and running kernel instances.

A [`Context`] is created for one [`Device`] and [`Program`], with one instance per
requested compute unit. Arguments are bound per instance with
[`arg`](Context::arg), or divided across every instance with
[`split`](Context::split). [`run`](Context::run) enqueues the copies and the launch
of each selected instance and returns immediately. [`wait`](Context::wait) blocks
until they finish and copies the results back into the bound host arrays.

Instances are independent, each can be run and waited on by itself:
```
# use cuplex::{anyhow::Result, arg::{Arg, Select}, context::Context, device::{Device, Program}};
# fn main() -> Result<()> {
let device = Device::builder()
    .kernel("square", 1, |args| {
        for x in args.as_mut_slice()[0].as_slice_mut::<f32>()? {
            *x *= *x;
        }
        Ok(())
    })
    .build()?;
let mut x = vec![3f32; 10];
Context::builder(device)
    .program(Program::from_bytes("square", b"".to_vec()))
    .replicate("square", 2)
    .scope(|context| {
        context.split(0, Arg::read_write(&mut x))?;
        context.run(0)?;
        context.run(1)?;
        context.wait(1)?;
        context.wait(Select::All)
    })?;
assert_eq!(x, [9f32; 10]);
# Ok(())
# }
```

# Lifetimes
Host arrays borrowed for `'a` can only be bound inside
[`scope`](builder::ContextBuilder::scope), which owns the context and drops it
before returning. Instances that were run but not waited on are drained at the end
of the scope, and their results are discarded. A context from
[`build`](builder::ContextBuilder::build) only binds `'static` arrays and mapped
blocks:
```compile_fail
# use cuplex::{anyhow::Result, arg::{Arg, Select}, context::Context, device::{Device, Program}};
# fn main() -> Result<()> {
# let device = Device::builder().kernel("noop", 1, |_| Ok(())).build()?;
let x = vec![1i32; 8];
let mut context = Context::builder(device)
    .program(Program::from_bytes("noop", b"".to_vec()))
    .kernel("noop")
    .build()?;
context.arg(0, Arg::read(&x), Select::All)?;
# Ok(())
# }
```
A scoped context can not be swapped out of its scope:
```compile_fail
# use cuplex::{anyhow::Result, arg::{Arg, Select}, context::Context, device::{Device, Program}};
# fn main() -> Result<()> {
# let device = Device::builder().kernel("noop", 1, |_| Ok(())).build()?;
# let program = Program::from_bytes("noop", b"".to_vec());
let other = Context::builder(device.clone())
    .program(program.clone())
    .kernel("noop")
    .build()?;
let x = vec![1i32; 8];
Context::builder(device)
    .program(program)
    .kernel("noop")
    .scope(|context| {
        context.arg(0, Arg::read(&x), Select::All)?;
        context.run(Select::All)?;
        std::mem::forget(std::mem::replace(context, other));
        Ok(())
    })?;
# Ok(())
# }
```
*/

use crate::{
    arg::{Access, Arg, ArgSlot, Binding, BufferSlot, HostMemory, Select},
    device::{Device, Program},
    error::{Error, ExecutionFailure, InstanceFailure},
    kernel::{error::KernelSpecError, InstanceState, KernelInstance, KernelSpec},
    scalar::Scalar,
    split::partition,
};
use std::{collections::HashSet, marker::PhantomData, ops::Range};

/// Builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Context`].
    pub struct ContextBuilder {
        pub(super) device: Device,
        pub(super) program: Option<Program>,
        pub(super) kernels: Vec<Result<KernelSpec, KernelSpecError>>,
    }

    impl ContextBuilder {
        /// The program to load, required.
        pub fn program(mut self, program: Program) -> Self {
            self.program.replace(program);
            self
        }
        /// Adds instances, ie "vadd:{vadd_1,vadd_2}".
        ///
        /// See [`KernelSpec`].
        pub fn kernel(mut self, spec: &str) -> Self {
            self.kernels.push(spec.parse());
            self
        }
        /// Adds `n` instances of `kernel`, on compute units `kernel_1` to `kernel_n`.
        pub fn replicate(mut self, kernel: &str, n: usize) -> Self {
            self.kernels.push(KernelSpec::replicated(kernel, n));
            self
        }
        /// Loads the program and creates the instances.
        ///
        /// The context only binds `'static` arrays, see [`.scope()`](Self::scope) for
        /// borrowed ones.
        ///
        /// **errors**
        /// - [`InvalidArgument`](Error::InvalidArgument): No program or kernel, an
        ///   invalid kernel spec, a kernel missing from the program, or a compute
        ///   unit requested twice.
        /// - [`Device`](Error::Device): The program could not be loaded.
        pub fn build(self) -> Result<Context<'static>, Error> {
            self.create()
        }
        /// Creates a context that borrows host arrays for `'a`, and passes it to `f`.
        ///
        /// The context is dropped before `scope` returns, blocking until every
        /// instance that was run and not waited on completes. Their results are
        /// discarded.
        ///
        /// **errors**
        /// See [`.build()`](Self::build). Otherwise returns the output of `f`.
        pub fn scope<'a, T>(
            self,
            f: impl FnOnce(&mut Context<'a>) -> Result<T, Error>,
        ) -> Result<T, Error> {
            let mut context = self.create()?;
            f(&mut context)
        }
        fn create<'a>(self) -> Result<Context<'a>, Error> {
            let Self {
                device,
                program,
                kernels,
            } = self;
            let program =
                program.ok_or_else(|| Error::InvalidArgument("no program".to_string()))?;
            if kernels.is_empty() {
                return Err(Error::InvalidArgument("no kernel".to_string()));
            }
            let kernels = kernels.into_iter().collect::<Result<Vec<_>, _>>()?;
            let engine = device.engine();
            engine.load_program(&program).map_err(Error::Device)?;
            let mut compute_units = HashSet::new();
            let mut instances = Vec::new();
            for spec in kernels.iter() {
                let desc = engine
                    .kernel(spec.kernel())
                    .map_err(|e| Error::InvalidArgument(format!("{e:#}")))?;
                for compute_unit in spec.compute_units() {
                    if !compute_units.insert(compute_unit.as_str()) {
                        return Err(Error::InvalidArgument(format!(
                            "compute unit {compute_unit:?} requested twice"
                        )));
                    }
                    instances.push(KernelInstance::new(
                        instances.len(),
                        device.clone(),
                        desc.clone(),
                        compute_unit.clone(),
                    ));
                }
            }
            log::info!(
                "{device:?} created a context for {:?} with {} instances: {}",
                program.name(),
                instances.len(),
                kernels
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ")
            );
            Ok(Context {
                device,
                program,
                instances,
                _borrow: PhantomData,
            })
        }
    }
}
use builder::ContextBuilder;

/// Kernel instances on a device, with their bound arguments.
///
/// Invariant over `'a`, so a scoped context can not be replaced by one that outlives
/// its arrays.
#[derive(Debug)]
pub struct Context<'a> {
    device: Device,
    program: Program,
    instances: Vec<KernelInstance<'a>>,
    _borrow: PhantomData<fn(&'a ()) -> &'a ()>,
}

impl<'a> Context<'a> {
    /// A builder for creating a context on `device`.
    pub fn builder(device: Device) -> ContextBuilder {
        ContextBuilder {
            device,
            program: None,
            kernels: Vec::new(),
        }
    }
    /// The device.
    pub fn device(&self) -> &Device {
        &self.device
    }
    /// The loaded program.
    pub fn program(&self) -> &Program {
        &self.program
    }
    /// The number of instances.
    pub fn instances(&self) -> usize {
        self.instances.len()
    }
    /// The compute unit of `instance`.
    pub fn compute_unit(&self, instance: usize) -> Option<&str> {
        self.instances
            .get(instance)
            .map(|x| x.compute_unit.as_str())
    }
    /// The state of `instance`.
    pub fn state(&self, instance: usize) -> Option<InstanceState> {
        self.instances.get(instance).map(|x| x.state)
    }
    /// How `slot` of `instance` is bound, None if it is not.
    pub fn binding(&self, instance: usize, slot: usize) -> Option<Binding> {
        self.instances
            .get(instance)?
            .slot(slot)
            .map(ArgSlot::binding)
    }
    fn selected(&self, select: Select) -> Result<Range<usize>, Error> {
        let n = self.instances.len();
        match select {
            Select::One(i) if i < n => Ok(i..i + 1),
            Select::One(i) => Err(Error::InvalidArgument(format!(
                "instance {i} out of range 0..{n}"
            ))),
            Select::All => Ok(0..n),
        }
    }
    fn check_rebind(&self, instances: Range<usize>, slot: usize) -> Result<(), Error> {
        for instance in &self.instances[instances] {
            let slots = instance.slots.len();
            if slot >= slots {
                return Err(Error::InvalidArgument(format!(
                    "slot {slot} out of range 0..{slots} for {}",
                    instance.desc.name()
                )));
            }
            if instance.state.is_running() {
                return Err(Error::InvalidState(format!(
                    "instance {} is running, slot {slot} can not be rebound",
                    instance.index
                )));
            }
        }
        Ok(())
    }
    fn commit(&mut self, instances: Range<usize>, slot: usize, slots: Vec<ArgSlot<'a>>) {
        for (instance, arg) in self.instances[instances].iter_mut().zip(slots) {
            instance.slots[slot].replace(arg);
        }
    }
    /// Binds `arg` to `slot` of the selected instances.
    ///
    /// With [`Select::All`] every instance gets its own device buffer of the whole
    /// array. The latest bind to a slot wins.
    ///
    /// **errors**
    /// - [`InvalidArgument`](Error::InvalidArgument): The instance or slot is out of
    ///   range, or an array that is written back is selected for more than one instance.
    /// - [`InvalidState`](Error::InvalidState): A selected instance is running.
    /// - [`AllocationFailure`](Error::AllocationFailure): No slot is modified.
    pub fn arg(
        &mut self,
        slot: usize,
        arg: Arg<'a>,
        select: impl Into<Select>,
    ) -> Result<&mut Self, Error> {
        let instances = self.selected(select.into())?;
        if instances.len() > 1 && arg.access().map_or(false, |x| x.downloads()) {
            return Err(Error::InvalidArgument(format!(
                "a {} array can not be bound to {} instances, split it instead",
                arg.role(),
                instances.len()
            )));
        }
        self.check_rebind(instances.clone(), slot)?;
        let slots = instances
            .clone()
            .map(|_| arg.bind(&self.device))
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!(
            "bound {} {} to slot {slot} of instances {instances:?}",
            arg.role(),
            arg.scalar_type()
        );
        self.commit(instances, slot, slots);
        Ok(self)
    }
    /// Divides `arg` evenly across every instance and binds the parts to `slot`.
    ///
    /// Of `n` elements over `k` instances, the first `n % k` instances get
    /// `n / k + 1` elements and the rest `n / k`, in order. Instances may receive
    /// empty parts. Scalars are bound unchanged to every instance.
    ///
    /// **errors**
    /// See [`.arg()`](Context::arg).
    pub fn split(&mut self, slot: usize, arg: Arg<'a>) -> Result<&mut Self, Error> {
        let instances = self.selected(Select::All)?;
        self.check_rebind(instances.clone(), slot)?;
        let ranges = partition(arg.len(), instances.len());
        let slots = arg.bind_split(&self.device, &ranges)?;
        log::debug!(
            "split {} {} to slot {slot} as {ranges:?}",
            arg.role(),
            arg.scalar_type()
        );
        self.commit(instances, slot, slots);
        Ok(self)
    }
    /// Binds a zeroed block of `len` elements, owned by the context, to `slot` of
    /// `instance`.
    ///
    /// Returns the block, to be filled before [`run`](Context::run). Results are
    /// available from [`mapped`](Context::mapped) after [`wait`](Context::wait).
    ///
    /// **errors**
    /// See [`.arg()`](Context::arg).
    pub fn map<T: Scalar>(
        &mut self,
        slot: usize,
        access: Access,
        len: usize,
        instance: usize,
    ) -> Result<&mut [T], Error> {
        let instances = self.selected(Select::One(instance))?;
        self.check_rebind(instances.clone(), slot)?;
        let host = HostMemory::mapped::<T>(len)?;
        let buffer = BufferSlot::new(&self.device, access, host, 0)?;
        log::debug!("mapped {len} {} to slot {slot} of instance {instance}", T::SCALAR_TYPE);
        self.commit(instances, slot, vec![ArgSlot::Buffer(buffer)]);
        match self.instances[instance].slots[slot].as_mut() {
            Some(ArgSlot::Buffer(BufferSlot {
                host: HostMemory::Mapped { block, .. },
                ..
            })) => bytemuck::try_cast_slice_mut(block.as_mut_slice())
                .map_err(|e| Error::InvalidState(format!("{e:?}"))),
            _ => Err(Error::InvalidState(format!(
                "slot {slot} of instance {instance} is not mapped"
            ))),
        }
    }
    /// The block mapped to `slot` of `instance`.
    ///
    /// **errors**
    /// - [`InvalidArgument`](Error::InvalidArgument): The slot was not bound with
    ///   [`.map()`](Context::map), or not with `T`.
    pub fn mapped<T: Scalar>(&self, instance: usize, slot: usize) -> Result<&[T], Error> {
        let not_mapped = || {
            Error::InvalidArgument(format!(
                "slot {slot} of instance {instance} is not a mapped [{}]",
                T::SCALAR_TYPE
            ))
        };
        match self.instances.get(instance).and_then(|x| x.slot(slot)) {
            Some(ArgSlot::Buffer(BufferSlot {
                host: HostMemory::Mapped { block, scalar_type },
                ..
            })) if *scalar_type == T::SCALAR_TYPE => {
                bytemuck::try_cast_slice(block.as_slice()).map_err(|_| not_mapped())
            }
            _ => Err(not_mapped()),
        }
    }
    /// Enqueues the selected instances.
    ///
    /// For each instance, the host to device copies of its inputs are enqueued, then
    /// its launch, which waits on them. Does not block. Results are copied back by
    /// [`wait`](Context::wait).
    ///
    /// **errors**
    /// - [`InvalidArgument`](Error::InvalidArgument): The instance is out of range.
    /// - [`ReentrantDispatch`](Error::ReentrantDispatch): A selected instance was not
    ///   waited on since it was last run. No instance is run.
    /// - [`InvalidState`](Error::InvalidState): A selected instance has an unbound
    ///   slot. No instance is run.
    /// - [`Device`](Error::Device): The device rejected a command. Instances before
    ///   the failed one are running.
    pub fn run(&mut self, select: impl Into<Select>) -> Result<(), Error> {
        let instances = self.selected(select.into())?;
        let running: Vec<usize> = self.instances[instances.clone()]
            .iter()
            .filter(|x| x.state.is_running())
            .map(|x| x.index)
            .collect();
        if !running.is_empty() {
            return Err(Error::ReentrantDispatch { instances: running });
        }
        for instance in &self.instances[instances.clone()] {
            if let Some(slot) = instance.unbound_slot() {
                return Err(Error::InvalidState(format!(
                    "slot {slot} of instance {} is not bound",
                    instance.index
                )));
            }
        }
        for instance in &mut self.instances[instances] {
            instance.dispatch()?;
        }
        Ok(())
    }
    /// Blocks until the selected instances complete, copying their results back
    /// to the host.
    ///
    /// Waiting on an instance that is not running does nothing. Every selected
    /// instance is drained before failures are reported, and each becomes
    /// [`Done`](InstanceState::Done), ready to be run again.
    ///
    /// **errors**
    /// - [`InvalidArgument`](Error::InvalidArgument): The instance is out of range.
    /// - [`Execution`](Error::Execution): Lists every instance that failed.
    pub fn wait(&mut self, select: impl Into<Select>) -> Result<(), Error> {
        let instances = self.selected(select.into())?;
        let mut failures = Vec::new();
        for instance in &mut self.instances[instances] {
            if let Err(error) = instance.finish() {
                log::debug!("instance {} failed: {error}", instance.index);
                failures.push(InstanceFailure::new(
                    instance.index,
                    instance.compute_unit.clone(),
                    error,
                ));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ExecutionFailure::new(failures).into())
        }
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        for instance in self.instances.iter_mut() {
            instance.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arg::Role,
        device::{error::DeviceLost, BufferId, DeviceEngine, DeviceInfo, HostPtr, KernelDesc, LaunchArg},
        error::ErrorKind,
        event::{Command, Event},
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn device() -> Device {
        Device::builder()
            .kernel("scale", 2, |args| {
                let alpha = args.scalar::<i32>(1)?;
                for x in args.as_mut_slice()[0].as_slice_mut::<i32>()? {
                    *x *= alpha;
                }
                Ok(())
            })
            .build()
            .unwrap()
    }

    fn builder(device: Device, instances: usize) -> ContextBuilder {
        Context::builder(device)
            .program(Program::from_bytes("scale", b"".to_vec()))
            .replicate("scale", instances)
    }

    fn context(instances: usize) -> Context<'static> {
        builder(device(), instances).build().unwrap()
    }

    /// Injected on top of a host device.
    #[derive(Clone, Copy, Default)]
    struct Faults {
        /// Allocations that succeed before the rest fail.
        allocs: Option<usize>,
        reject_write: bool,
        reject_launch: bool,
        fail_write: bool,
        fail_read: bool,
    }

    struct FaultyEngine {
        host: Device,
        faults: Mutex<Faults>,
    }

    impl FaultyEngine {
        fn host(&self) -> &dyn DeviceEngine {
            self.host.engine().as_ref()
        }
    }

    fn failed(command: Command, msg: &'static str) -> Event {
        let event = Event::new(command);
        event.signal(Err(anyhow::Error::msg(msg)));
        event
    }

    impl DeviceEngine for FaultyEngine {
        fn info(&self) -> &DeviceInfo {
            self.host.info()
        }
        fn load_program(&self, program: &Program) -> anyhow::Result<()> {
            self.host().load_program(program)
        }
        fn kernel(&self, name: &str) -> anyhow::Result<KernelDesc> {
            self.host().kernel(name)
        }
        fn alloc(&self, len: usize) -> anyhow::Result<BufferId> {
            if let Some(allocs) = self.faults.lock().allocs.as_mut() {
                if *allocs == 0 {
                    anyhow::bail!("out of device memory");
                }
                *allocs -= 1;
            }
            self.host().alloc(len)
        }
        fn release(&self, id: BufferId) {
            self.host().release(id)
        }
        unsafe fn write(
            &self,
            buffer: BufferId,
            src: HostPtr,
            wait: &[Event],
        ) -> anyhow::Result<Event> {
            let faults = *self.faults.lock();
            if faults.reject_write {
                anyhow::bail!("write queue full");
            }
            if faults.fail_write {
                return Ok(failed(Command::Write, "dma timeout"));
            }
            unsafe { self.host().write(buffer, src, wait) }
        }
        unsafe fn read(
            &self,
            buffer: BufferId,
            dst: HostPtr,
            wait: &[Event],
        ) -> anyhow::Result<Event> {
            if self.faults.lock().fail_read {
                return Ok(failed(Command::Read, "dma timeout"));
            }
            unsafe { self.host().read(buffer, dst, wait) }
        }
        fn launch(
            &self,
            kernel: &KernelDesc,
            compute_unit: &str,
            args: &[LaunchArg],
            wait: &[Event],
        ) -> anyhow::Result<Event> {
            if self.faults.lock().reject_launch {
                anyhow::bail!("launch queue full");
            }
            self.host().launch(kernel, compute_unit, args, wait)
        }
        fn wait(&self) -> Result<(), DeviceLost> {
            self.host().wait()
        }
    }

    fn faulty() -> (Arc<FaultyEngine>, Device) {
        let engine = Arc::new(FaultyEngine {
            host: device(),
            faults: Mutex::default(),
        });
        let device = Device::from_engine(engine.clone());
        (engine, device)
    }

    #[test]
    fn build_errors() {
        let program = Program::from_bytes("scale", b"".to_vec());
        let err = Context::builder(device()).kernel("scale").build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = Context::builder(device())
            .program(program.clone())
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = Context::builder(device())
            .program(program.clone())
            .kernel("scale:{")
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = Context::builder(device())
            .program(program.clone())
            .kernel("vadd")
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = Context::builder(device())
            .program(program)
            .kernel("scale:{a,b}")
            .kernel("scale:{b}")
            .scope(|_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn instances_from_specs() {
        let context = Context::builder(device())
            .program(Program::from_bytes("scale", b"".to_vec()))
            .kernel("scale:{scale_a, scale_b}")
            .kernel("scale")
            .build()
            .unwrap();
        assert_eq!(context.instances(), 3);
        assert_eq!(context.compute_unit(1), Some("scale_b"));
        assert_eq!(context.compute_unit(2), Some("scale"));
        assert_eq!(context.compute_unit(3), None);
        assert_eq!(context.state(0), Some(InstanceState::Idle));
        assert_eq!(context.binding(0, 0), None);
    }

    #[test]
    fn bind_errors_leave_slots_unchanged() {
        let x = [1i32; 4];
        let mut y = [0i32; 4];
        builder(device(), 2)
            .scope(|context| {
                context.arg(1, Arg::scalar(2i32), Select::All)?;
                let err = context.arg(2, Arg::read(&x), 0).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::InvalidArgument);
                let err = context.arg(0, Arg::read(&x), 2).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::InvalidArgument);
                let err = context.arg(1, Arg::write(&mut y), Select::All).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::InvalidArgument);
                for i in 0..2 {
                    assert_eq!(context.binding(i, 1).map(|x| x.role()), Some(Role::Scalar));
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn run_unbound_is_invalid_state() {
        let mut context = context(2);
        context.arg(1, Arg::scalar(2i32), Select::All).unwrap();
        let err = context.run(Select::All).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(context.state(0), Some(InstanceState::Idle));
    }

    #[test]
    fn map_then_mapped() {
        let mut context = context(1);
        context.arg(1, Arg::scalar(3i32), 0).unwrap();
        context
            .map::<i32>(0, Access::ReadWrite, 4, 0)
            .unwrap()
            .copy_from_slice(&[1, 2, 3, 4]);
        assert!(context.mapped::<u32>(0, 0).is_err());
        assert!(context.mapped::<i32>(0, 1).is_err());
        context.run(0).unwrap();
        context.wait(0).unwrap();
        assert_eq!(context.mapped::<i32>(0, 0).unwrap(), [3, 6, 9, 12]);
        let binding = context.binding(0, 0).unwrap();
        assert_eq!((binding.role(), binding.len()), (Role::ReadWrite, 4));
    }

    #[test]
    fn allocation_failure_leaves_slots_unchanged() {
        let (engine, device) = faulty();
        let x = [1i32; 9];
        let y = [2i32; 6];
        builder(device, 3)
            .scope(|context| {
                context
                    .split(0, Arg::read(&x))?
                    .arg(1, Arg::scalar(2i32), Select::All)?;
                engine.faults.lock().allocs = Some(1);
                let err = context.split(0, Arg::read(&y)).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::AllocationFailure);
                engine.faults.lock().allocs = Some(2);
                let err = context.arg(0, Arg::read(&y), Select::All).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::AllocationFailure);
                engine.faults.lock().allocs = Some(0);
                let err = context.map::<i32>(0, Access::Read, 4, 2).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::AllocationFailure);
                for i in 0..3 {
                    let binding = context.binding(i, 0).unwrap();
                    assert_eq!((binding.offset(), binding.len()), (3 * i, 3));
                }
                engine.faults.lock().allocs = None;
                context.run(Select::All)?;
                context.wait(Select::All)
            })
            .unwrap();
    }

    #[test]
    fn rejected_commands_restore_state() {
        let (engine, device) = faulty();
        let mut x = [1i32; 4];
        builder(device, 2)
            .scope(|context| {
                context
                    .split(0, Arg::read_write(&mut x))?
                    .split(1, Arg::scalar(3i32))?;
                engine.faults.lock().reject_write = true;
                let err = context.run(Select::All).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::Device);
                assert_eq!(context.state(0), Some(InstanceState::Idle));
                assert_eq!(context.state(1), Some(InstanceState::Idle));
                engine.faults.lock().reject_write = false;
                context.run(Select::All)?;
                context.wait(Select::All)?;
                engine.faults.lock().reject_launch = true;
                let err = context.run(1).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::Device);
                assert_eq!(context.state(1), Some(InstanceState::Done));
                Ok(())
            })
            .unwrap();
        assert_eq!(x, [3; 4]);
    }

    #[test]
    fn failed_copies_report_command() {
        let (engine, device) = faulty();
        let mut x = [1i32; 4];
        builder(device, 2)
            .scope(|context| {
                context
                    .split(0, Arg::read_write(&mut x))?
                    .split(1, Arg::scalar(3i32))?;
                engine.faults.lock().fail_write = true;
                context.run(Select::All)?;
                let failure = match context.wait(Select::All).unwrap_err() {
                    Error::Execution(failure) => failure,
                    e => panic!("{e:?}"),
                };
                assert_eq!(failure.instances().collect::<Vec<_>>(), [0, 1]);
                for failure in failure.failures() {
                    assert_eq!(failure.error().command(), Command::Write);
                }
                *engine.faults.lock() = Faults {
                    fail_read: true,
                    ..Faults::default()
                };
                context.run(0)?;
                let failure = match context.wait(0).unwrap_err() {
                    Error::Execution(failure) => failure,
                    e => panic!("{e:?}"),
                };
                assert_eq!(failure.instances().collect::<Vec<_>>(), [0]);
                assert_eq!(failure.failures()[0].error().command(), Command::Read);
                assert_eq!(context.state(0), Some(InstanceState::Done));
                Ok(())
            })
            .unwrap();
        assert_eq!(x, [1; 4]);
    }
}
