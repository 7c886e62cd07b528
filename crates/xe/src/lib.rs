mod client;
mod runner;

pub use client::{split_minimal, VdiInfo, XeClient, XeConnection, XeError, DEFAULT_XE_PATH};
pub use runner::{CommandError, CommandOutput, CommandRunner, ProcessRunner};
