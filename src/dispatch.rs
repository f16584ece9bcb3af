use crate::{
    arg::ArgSlot,
    error::Error,
    event::{Command, Event, ExecutionError},
    kernel::{InstanceState, KernelInstance},
};

impl KernelInstance<'_> {
    /** Enqueues the host to device copies, then the launch, which waits on them.

    Does not block. The instance must be bound and not running. If the engine
    rejects a command, the commands already enqueued are waited on and the
    instance keeps its previous state. */
    pub(crate) fn dispatch(&mut self) -> Result<(), Error> {
        debug_assert!(!self.state.is_running());
        let previous = self.state;
        self.state = InstanceState::Writing;
        let mut writes = Vec::new();
        let mut args = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(slot) = slot else {
                let _ = Event::wait_all(&writes);
                self.state = previous;
                return Err(Error::InvalidState(format!(
                    "slot {index} of instance {} is not bound",
                    self.index
                )));
            };
            if let ArgSlot::Buffer(buffer) = slot {
                if buffer.access.uploads() {
                    let src = buffer.host.host_ptr();
                    // Safety: host memory outlives the instance, which waits on
                    // its writes before it is dropped or rebound.
                    match unsafe { buffer.buffer.upload(src, &[]) } {
                        Ok(event) => writes.push(event),
                        Err(e) => {
                            let _ = Event::wait_all(&writes);
                            self.state = previous;
                            return Err(Error::Device(e));
                        }
                    }
                }
            }
            args.push(slot.launch_arg());
        }
        let launch = self
            .device
            .engine()
            .launch(&self.desc, &self.compute_unit, &args, &writes);
        let launch = match launch {
            Ok(launch) => launch,
            Err(e) => {
                let _ = Event::wait_all(&writes);
                self.state = previous;
                return Err(Error::Device(e));
            }
        };
        log::debug!(
            "{} enqueued {} writes and a launch on {}",
            self.desc.name(),
            writes.len(),
            self.compute_unit
        );
        self.write_events = writes;
        self.launch_event.replace(launch);
        self.state = InstanceState::Running;
        Ok(())
    }
    /** Blocks until the launch completes, then copies results back to the host.

    Returns the first failure of the writes, the launch or the reads. The reads are
    skipped if the launch failed. A no op unless the instance is running. */
    pub(crate) fn finish(&mut self) -> Result<(), ExecutionError> {
        let Some(launch) = self.launch_event.take() else {
            return Ok(());
        };
        let writes = std::mem::take(&mut self.write_events);
        let mut result = Event::wait_all(writes.iter().chain([&launch]));
        if result.is_ok() {
            self.state = InstanceState::Reading;
            let mut reads = Vec::new();
            let mut enqueue = Ok(());
            for slot in self.slots.iter_mut().flatten() {
                if let ArgSlot::Buffer(buffer) = slot {
                    if buffer.access.downloads() {
                        let dst = buffer.host.host_ptr();
                        // Safety: the host memory is writable and borrowed by the
                        // instance, which waits on the read below.
                        match unsafe { buffer.buffer.download(dst, &[launch.clone()]) } {
                            Ok(event) => reads.push(event),
                            Err(e) => {
                                enqueue = Err(ExecutionError::new(Command::Read, e));
                                break;
                            }
                        }
                    }
                }
            }
            result = Event::wait_all(&reads).and(enqueue);
            log::debug!(
                "{} read {} buffers from {}",
                self.desc.name(),
                reads.len(),
                self.compute_unit
            );
        }
        self.state = InstanceState::Done;
        result
    }
    /// Blocks until in flight commands complete, discarding results.
    pub(crate) fn abandon(&mut self) {
        if let Some(launch) = self.launch_event.take() {
            log::warn!(
                "{} on {} was not waited on, discarding results",
                self.desc.name(),
                self.compute_unit
            );
            let writes = std::mem::take(&mut self.write_events);
            if let Err(e) = Event::wait_all(writes.iter().chain([&launch])) {
                log::warn!("{} on {}: {e}", self.desc.name(), self.compute_unit);
            }
            self.state = InstanceState::Done;
        }
    }
}
