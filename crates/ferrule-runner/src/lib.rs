//! Step execution boundary for Ferrule.
//!
//! The orchestrator hands a [`StepRunner`] an environment and an opaque
//! command and gets back an exit status plus streamed output lines.

pub mod runner;
pub mod shell;

pub use runner::{OutputLine, OutputStream, RunnerConfig, StepContext, StepResult, StepRunner};
pub use shell::ShellRunner;
