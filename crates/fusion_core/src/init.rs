//! # Ordered Initialization
//!
//! Runs named setup steps in order and tears them down in reverse.
//!
//! A failing step unwinds every step completed before it, so a partially
//! initialized subsystem never survives an error.

use crate::error::FusionResult;

type Teardown = Box<dyn FnOnce() + Send>;

/// Stack of completed setup steps.
#[derive(Default)]
pub struct InitSequence {
    completed: Vec<(&'static str, Teardown)>,
}

impl std::fmt::Debug for InitSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.completed.iter().map(|(name, _)| name))
            .finish()
    }
}

impl InitSequence {
    /// Creates an empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `init`. On success `teardown` is remembered, on failure every
    /// completed step is torn down and the error returned.
    ///
    /// # Arguments
    ///
    /// * `name` - Step name for logs
    /// * `init` - Setup
    /// * `teardown` - Undo, run on unwind or shutdown
    ///
    /// # Errors
    ///
    /// Whatever `init` returns.
    pub fn step<T>(
        &mut self,
        name: &'static str,
        init: impl FnOnce() -> FusionResult<T>,
        teardown: impl FnOnce() + Send + 'static,
    ) -> FusionResult<T> {
        match init() {
            Ok(value) => {
                tracing::debug!("Init step '{}' done", name);
                self.completed.push((name, Box::new(teardown)));
                Ok(value)
            }
            Err(e) => {
                tracing::error!("Init step '{}' failed: {}", name, e);
                self.shutdown();
                Err(e)
            }
        }
    }

    /// Names of completed steps, in order.
    #[must_use]
    pub fn completed(&self) -> Vec<&'static str> {
        self.completed.iter().map(|(name, _)| *name).collect()
    }

    /// Tears down every completed step in reverse order.
    pub fn shutdown(&mut self) {
        while let Some((name, teardown)) = self.completed.pop() {
            tracing::debug!("Deinit step '{}'", name);
            teardown();
        }
    }
}

impl Drop for InitSequence {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FusionError;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |name: &'static str| {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().push(name)) as Box<dyn FnOnce() + Send>
        };
        (log, make)
    }

    #[test]
    fn test_failure_unwinds_in_reverse() {
        let (log, undo) = recorder();
        let mut seq = InitSequence::new();
        seq.step("a", || Ok(()), undo("a")).unwrap();
        seq.step("b", || Ok(()), undo("b")).unwrap();
        let err = seq
            .step("c", || Err::<(), _>(FusionError::Unimplemented("c")), undo("c"))
            .unwrap_err();
        assert_eq!(err, FusionError::Unimplemented("c"));
        assert_eq!(*log.lock(), vec!["b", "a"]);
        assert!(seq.completed().is_empty());
    }

    #[test]
    fn test_drop_shuts_down() {
        let (log, undo) = recorder();
        {
            let mut seq = InitSequence::new();
            seq.step("config", || Ok(1), undo("config")).unwrap();
            seq.step("shm", || Ok(2), undo("shm")).unwrap();
            assert_eq!(seq.completed(), vec!["config", "shm"]);
        }
        assert_eq!(*log.lock(), vec!["shm", "config"]);
    }
}
