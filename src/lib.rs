/*!
Split-dispatch of one kernel across several compute units of an accelerator.

A [`Context`](context::Context) owns a [`Device`](device::Device) with a loaded
[`Program`](device::Program) and one kernel instance per compute unit. Inside a
[`scope`](context::builder::ContextBuilder::scope), host arrays are bound to
argument slots, either whole or [split](context::Context::split)
evenly across the instances. [`run`](context::Context::run) enqueues the host to
device copies and the launches without blocking, and
[`wait`](context::Context::wait) blocks until the launches finish and copies the
results back into the host arrays.

```
# use cuplex::{anyhow::Result, arg::{Arg, Select}, context::Context, device::{Device, Program}};
# fn main() -> Result<()> {
let device = Device::builder()
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
let n = 4096;
let input1 = vec![1i32; n];
let input2 = vec![2i32; n];
let mut output = vec![0i32; n];
Context::builder(device)
    .program(Program::from_bytes("vadd", b"".to_vec()))
    .kernel("vadd:{vadd_1,vadd_2}")
    .scope(|context| {
        context
            .split(2, Arg::write(&mut output))?
            .split(0, Arg::read(&input1))?
            .split(1, Arg::read(&input2))?
            .split(3, Arg::scalar(n as i32))?;
        context.run(Select::All)?;
        context.wait(Select::All)
    })?;
assert!(output.iter().all(|x| *x == 3));
# Ok(())
# }
```
*/
#![forbid(unsafe_op_in_unsafe_fn)]

pub extern crate anyhow;

pub mod result {
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}

pub mod alloc;
pub mod arg;
pub mod context;
pub mod device;
mod dispatch;
pub mod error;
pub mod event;
pub mod kernel;
pub mod scalar;
pub mod split;
