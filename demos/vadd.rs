//! Adds two vectors on two compute units.
//!
//! `cargo run --example vadd [program]`, where `program` is an optional path to the
//! program image.

use cuplex::{
    anyhow::Result,
    arg::{Arg, Select},
    context::Context,
    device::{self, Device, Program},
};

fn main() -> Result<()> {
    let devices = [Device::builder()
        .name("xilinx_u250_gen3x16_xdma_shell")
        .compute_units(2)
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
        .build()?];
    let device = device::select(&devices, "u250")?;
    let program = match std::env::args().nth(1) {
        Some(path) => Program::from_file(path)?,
        None => Program::from_bytes("vadd", Vec::<u8>::new()),
    };

    let n = 4096;
    let input1 = vec![1i32; n];
    let input2 = vec![2i32; n];
    let mut output = vec![0i32; n];
    Context::builder(device)
        .program(program)
        .kernel("vadd:{vadd_1}")
        .kernel("vadd:{vadd_2}")
        .scope(|context| {
            context
                .split(2, Arg::write(&mut output))?
                .split(0, Arg::read(&input1))?
                .split(1, Arg::read(&input2))?
                .split(3, Arg::scalar(n as i32))?;
            context.run(Select::All)?;
            context.wait(Select::All)
        })?;
    let ok = output.iter().all(|x| *x == 3);
    println!("{} {}", if ok { "TRUE" } else { "FALSE" }, output[0]);
    Ok(())
}
