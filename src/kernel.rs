/*!
Kernel instances.

A kernel is replicated across compute units. Each replica is an independently
schedulable instance with its own argument slots. Instances are named with specs
of the form `kernel:{cu_1,cu_2}`:

```
# use cuplex::kernel::KernelSpec;
let spec: KernelSpec = "vadd:{vadd_1, vadd_2}".parse().unwrap();
assert_eq!(spec.kernel(), "vadd");
assert_eq!(spec.compute_units(), ["vadd_1", "vadd_2"]);
assert_eq!(spec, KernelSpec::replicated("vadd", 2).unwrap());
```
*/

use crate::{
    arg::ArgSlot,
    device::{Device, KernelDesc},
    event::Event,
};
use std::{
    fmt::{self, Display},
    str::FromStr,
};

/// Errors.
pub mod error {
    /// A kernel spec could not be parsed.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("Invalid kernel spec {spec:?}: {reason}!")]
    pub struct KernelSpecError {
        pub(super) spec: String,
        pub(super) reason: &'static str,
    }
}
use error::KernelSpecError;

/// A kernel and the compute units it is instantiated on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KernelSpec {
    kernel: String,
    compute_units: Vec<String>,
}

impl KernelSpec {
    /// `n` instances of `kernel`, on compute units `kernel_1` to `kernel_n`.
    pub fn replicated(kernel: &str, n: usize) -> Result<Self, KernelSpecError> {
        let err = |reason| KernelSpecError {
            spec: format!("{kernel} x {n}"),
            reason,
        };
        if n == 0 {
            return Err(err("no compute units"));
        }
        if !valid_name(kernel) {
            return Err(err("invalid kernel name"));
        }
        Ok(Self {
            kernel: kernel.to_string(),
            compute_units: (1..=n).map(|i| format!("{kernel}_{i}")).collect(),
        })
    }
    /// The name of the kernel.
    pub fn kernel(&self) -> &str {
        &self.kernel
    }
    /// The compute units, one per instance.
    pub fn compute_units(&self) -> &[String] {
        &self.compute_units
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(&['{', '}', ',', ':'][..]) && name.trim() == name
}

impl FromStr for KernelSpec {
    type Err = KernelSpecError;
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let err = |reason| KernelSpecError {
            spec: spec.to_string(),
            reason,
        };
        let (kernel, compute_units) = match spec.split_once(':') {
            Some((kernel, compute_units)) => {
                let compute_units = compute_units
                    .trim()
                    .strip_prefix('{')
                    .and_then(|x| x.strip_suffix('}'))
                    .ok_or_else(|| err("expected kernel:{cu,..}"))?;
                (kernel.trim(), Some(compute_units))
            }
            None => (spec.trim(), None),
        };
        if !valid_name(kernel) {
            return Err(err("invalid kernel name"));
        }
        let compute_units = match compute_units {
            Some(compute_units) => compute_units
                .split(',')
                .map(|x| {
                    let x = x.trim();
                    if valid_name(x) {
                        Ok(x.to_string())
                    } else {
                        Err(err("invalid compute unit name"))
                    }
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![kernel.to_string()],
        };
        Ok(Self {
            kernel: kernel.to_string(),
            compute_units,
        })
    }
}

impl Display for KernelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{{{}}}", self.kernel, self.compute_units.join(","))
    }
}

/** The state of a kernel instance.

`Idle -> Writing -> Running -> Reading -> Done`. `Writing` and `Reading` are only
observed while [`run`](crate::context::Context::run) and
[`wait`](crate::context::Context::wait) are enqueueing. */
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::Display)]
pub enum InstanceState {
    /// Never run.
    Idle,
    /// Enqueueing host to device copies.
    Writing,
    /// Launched and not yet waited on.
    Running,
    /// Copying results back to the host.
    Reading,
    /// Waited on, may be run again.
    Done,
}

impl InstanceState {
    /// Whether the instance was run and not yet waited on.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Writing | Self::Running | Self::Reading)
    }
}

/// One replica of the kernel on a compute unit.
#[derive(Debug)]
pub(crate) struct KernelInstance<'a> {
    pub(crate) index: usize,
    pub(crate) device: Device,
    pub(crate) desc: KernelDesc,
    pub(crate) compute_unit: String,
    pub(crate) slots: Vec<Option<ArgSlot<'a>>>,
    pub(crate) state: InstanceState,
    pub(crate) write_events: Vec<Event>,
    pub(crate) launch_event: Option<Event>,
}

impl<'a> KernelInstance<'a> {
    pub(crate) fn new(index: usize, device: Device, desc: KernelDesc, compute_unit: String) -> Self {
        let slots = std::iter::repeat_with(|| None).take(desc.args()).collect();
        Self {
            index,
            device,
            desc,
            compute_unit,
            slots,
            state: InstanceState::Idle,
            write_events: Vec::new(),
            launch_event: None,
        }
    }
    pub(crate) fn slot(&self, slot: usize) -> Option<&ArgSlot<'a>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }
    pub(crate) fn unbound_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kernel_specs() {
        let spec: KernelSpec = "vadd".parse().unwrap();
        assert_eq!(spec.compute_units(), ["vadd"]);
        let spec: KernelSpec = "vadd:{vadd_1}".parse().unwrap();
        assert_eq!(spec.kernel(), "vadd");
        assert_eq!(spec.compute_units(), ["vadd_1"]);
        assert_eq!(spec.to_string(), "vadd:{vadd_1}");
        let spec: KernelSpec = " mmult : { mmult_1 ,mmult_2 } ".parse().unwrap();
        assert_eq!(spec.to_string(), "mmult:{mmult_1,mmult_2}");
    }

    #[test]
    fn reject_bad_kernel_specs() {
        for spec in ["", ":{a}", "vadd:", "vadd:{}", "vadd:{a,}", "vadd:{a", "vadd:a}", "a:{b:{c}}"] {
            assert!(spec.parse::<KernelSpec>().is_err(), "{spec:?}");
        }
        assert!(KernelSpec::replicated("vadd", 0).is_err());
    }

    #[test]
    fn replicated_names() {
        let spec = KernelSpec::replicated("vadd", 3).unwrap();
        assert_eq!(spec.compute_units(), ["vadd_1", "vadd_2", "vadd_3"]);
    }

    #[test]
    fn running_states() {
        assert!(!InstanceState::Idle.is_running());
        assert!(InstanceState::Running.is_running());
        assert!(!InstanceState::Done.is_running());
    }
}
