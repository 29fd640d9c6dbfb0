//! Built-in chain steps
//!
//! One struct per step; `ChainRunner`'s builder methods construct them.

mod expect;
mod flow;
mod fs;
mod process;

pub(crate) use expect::{CodeCheck, CodeStep, ExpectStep, FileStep, OutputStep, Stream};
pub(crate) use flow::{SleepStep, TapStep, TimeEndStep, TimeStep};
pub(crate) use fs::{CwdStep, DebugStep, EnvStep, MkdirStep, RmStep, TmpdirStep};
pub(crate) use process::{KillStep, ShellStep, SpawnStep, WaitStep, WriteStep};
