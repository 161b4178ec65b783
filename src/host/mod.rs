//! Host integration
//!
//! Bridges order handlers to the appliance OS: process execution with
//! bounded timeouts, detached restarts, and local state files.

pub mod io;
mod restart;
mod runner;

pub use restart::RestartScheduler;
pub use runner::{tail_chars, CommandOutput, CommandRunner, ProcessRunner};

#[cfg(test)]
pub(crate) mod testing {
    use super::{CommandOutput, CommandRunner};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Records every command line and answers with scripted outputs
    #[derive(Default)]
    pub struct FakeRunner {
        calls: Mutex<Vec<Vec<String>>>,
        outputs: Mutex<HashMap<String, std::result::Result<CommandOutput, String>>>,
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl FakeRunner {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Answer runs of `program` with `output`
        pub fn respond(&self, program: &str, output: CommandOutput) {
            self.outputs.lock().unwrap().insert(program.into(), Ok(output));
        }

        /// Make runs of `program` fail to execute at all
        pub fn fail(&self, program: &str, message: &str) {
            self.outputs.lock().unwrap().insert(program.into(), Err(message.into()));
        }

        /// Write `content` to the path following `-o` when `program` runs
        pub fn produce_file(&self, program: &str, content: &[u8]) {
            self.files.lock().unwrap().insert(program.into(), content.to_vec());
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, argv: &[String], _timeout: Option<Duration>) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(argv.to_vec());
            let program = argv.first().cloned().unwrap_or_default();

            if let Some(content) = self.files.lock().unwrap().get(&program) {
                if let Some(pos) = argv.iter().position(|a| a == "-o") {
                    std::fs::write(&argv[pos + 1], content)?;
                }
            }

            match self.outputs.lock().unwrap().get(&program) {
                Some(Ok(out)) => Ok(out.clone()),
                Some(Err(msg)) => Err(anyhow!("{}", msg)),
                None => Ok(CommandOutput::ok("")),
            }
        }
    }
}
