/*!
Errors returned by [`Context`](crate::context::Context).

Binding errors are returned by the call that caused them and leave the context
unchanged. Failures on the device are only observed by
[`wait`](crate::context::Context::wait), as [`Error::Execution`].
*/

use crate::{alloc::AllocError, event::ExecutionError, kernel::error::KernelSpecError};
use std::fmt::{self, Display};

/// The kind of an [`Error`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
pub enum ErrorKind {
    /// A slot, instance, value or kernel spec was invalid.
    InvalidArgument,
    /// Host or device memory could not be allocated.
    AllocationFailure,
    /// An instance was run again before it was waited on.
    ReentrantDispatch,
    /// The operation is not allowed in the state of the instance.
    InvalidState,
    /// The device failed a copy or launch.
    DeviceExecutionFailure,
    /// The device rejected a command or was lost.
    Device,
}

/// An error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A slot, instance, value or kernel spec was invalid.
    #[error("Invalid argument: {0}!")]
    InvalidArgument(String),
    /// Host or device memory could not be allocated.
    #[error("Allocation failed: {0:#}")]
    AllocationFailure(anyhow::Error),
    /// Instances were run again before they were waited on.
    #[error("Instances {instances:?} are still running!")]
    ReentrantDispatch {
        /// The running instances.
        instances: Vec<usize>,
    },
    /// The operation is not allowed in the state of the instance.
    #[error("Invalid state: {0}!")]
    InvalidState(String),
    /// One or more instances failed on the device.
    #[error(transparent)]
    Execution(#[from] ExecutionFailure),
    /// The device rejected a command or was lost.
    #[error("Device error: {0:#}")]
    Device(anyhow::Error),
}

impl Error {
    /// The kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::AllocationFailure(_) => ErrorKind::AllocationFailure,
            Self::ReentrantDispatch { .. } => ErrorKind::ReentrantDispatch,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Execution(_) => ErrorKind::DeviceExecutionFailure,
            Self::Device(_) => ErrorKind::Device,
        }
    }
}

impl From<AllocError> for Error {
    fn from(error: AllocError) -> Self {
        Self::AllocationFailure(error.into())
    }
}

impl From<KernelSpecError> for Error {
    fn from(error: KernelSpecError) -> Self {
        Self::InvalidArgument(error.to_string())
    }
}

/// An instance that failed on the device.
#[derive(Clone, Debug)]
pub struct InstanceFailure {
    instance: usize,
    compute_unit: String,
    error: ExecutionError,
}

impl InstanceFailure {
    pub(crate) fn new(instance: usize, compute_unit: String, error: ExecutionError) -> Self {
        Self {
            instance,
            compute_unit,
            error,
        }
    }
    /// The index of the instance.
    pub fn instance(&self) -> usize {
        self.instance
    }
    /// The compute unit of the instance.
    pub fn compute_unit(&self) -> &str {
        &self.compute_unit
    }
    /// The first command that failed.
    pub fn error(&self) -> &ExecutionError {
        &self.error
    }
}

impl Display for InstanceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instance {} ({}): {}",
            self.instance, self.compute_unit, self.error
        )
    }
}

/** The instances that failed during a [`wait`](crate::context::Context::wait).

Reported once, after every selected instance was drained. */
#[derive(Clone, Debug)]
pub struct ExecutionFailure {
    failures: Vec<InstanceFailure>,
}

impl ExecutionFailure {
    pub(crate) fn new(failures: Vec<InstanceFailure>) -> Self {
        Self { failures }
    }
    /// The failures, ordered by instance.
    pub fn failures(&self) -> &[InstanceFailure] {
        &self.failures
    }
    /// The indices of the failed instances.
    pub fn instances(&self) -> impl Iterator<Item = usize> + '_ {
        self.failures.iter().map(InstanceFailure::instance)
    }
}

impl Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Execution failed on {} instance(s)", self.failures.len())?;
        for failure in self.failures.iter() {
            write!(f, "\n  {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecutionFailure {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Command;

    #[test]
    fn error_kinds() {
        assert_eq!(
            Error::InvalidArgument("slot 9".into()).kind(),
            ErrorKind::InvalidArgument
        );
        let error = Error::ReentrantDispatch {
            instances: vec![0, 2],
        };
        assert_eq!(error.kind(), ErrorKind::ReentrantDispatch);
        assert!(error.to_string().contains("[0, 2]"));
        let error = Error::from(crate::alloc::AlignedVec::<u64>::zeroed(usize::MAX).unwrap_err());
        assert_eq!(error.kind(), ErrorKind::AllocationFailure);
    }

    #[test]
    fn execution_failure_lists_instances() {
        let failure = ExecutionFailure::new(vec![
            InstanceFailure::new(
                0,
                "vadd_1".into(),
                ExecutionError::new(Command::Launch, anyhow::format_err!("timeout")),
            ),
            InstanceFailure::new(
                3,
                "vadd_4".into(),
                ExecutionError::new(Command::Read, anyhow::format_err!("dma")),
            ),
        ]);
        assert_eq!(failure.instances().collect::<Vec<_>>(), [0, 3]);
        let error = Error::from(failure);
        assert_eq!(error.kind(), ErrorKind::DeviceExecutionFailure);
        let msg = error.to_string();
        assert!(msg.contains("vadd_4") && msg.contains("dma"), "{msg}");
    }
}
