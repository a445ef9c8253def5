//! Execution control: the reduced-privilege fork/exec launcher.

pub mod launcher;

pub use launcher::{Launcher, LaunchCallback};
