//! Outbound interface to the order transport
//!
//! Fetching orders and delivering reports upstream belong to the transport
//! collaborator. This module only defines the seam it plugs into.

mod log;
mod traits;

pub use log::LogReporter;
pub use traits::CompletionReporter;

#[cfg(test)]
pub(crate) mod testing {
    use super::CompletionReporter;
    use anyhow::{bail, Result};
    use appliance_shared::Params;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// One observed completion call
    #[derive(Debug, Clone, PartialEq)]
    pub struct Completion {
        pub order_id: String,
        pub success: bool,
        pub result: Option<Params>,
        pub error: Option<String>,
    }

    /// Records every completion call
    #[derive(Default)]
    pub struct RecordingReporter {
        completions: Mutex<Vec<Completion>>,
        fail: bool,
    }

    impl RecordingReporter {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// A reporter whose every delivery fails after recording
        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                ..Default::default()
            })
        }

        pub fn completions(&self) -> Vec<Completion> {
            self.completions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionReporter for RecordingReporter {
        async fn report(
            &self,
            order_id: &str,
            success: bool,
            result: Option<&Params>,
            error: Option<&str>,
        ) -> Result<()> {
            self.completions.lock().unwrap().push(Completion {
                order_id: order_id.into(),
                success,
                result: result.cloned(),
                error: error.map(str::to_string),
            });
            if self.fail {
                bail!("upstream unavailable");
            }
            Ok(())
        }
    }
}
