//! Single-request vs. batched execution.
//!
//! Transitions always run stop-loop → reconfigure → start-loop under one lock,
//! so the processing loop never sees a half-reconfigured engine.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::context::ContextId;
use crate::engine::{EngineBinding, EngineHandle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParallelState {
    pub enabled: bool,
    pub n_parallel: u32,
    pub n_batch: u32,
}

pub struct ParallelModeController {
    context_id: ContextId,
    state: Mutex<ParallelState>,
}

impl ParallelModeController {
    pub fn new(context_id: ContextId) -> Self {
        Self {
            context_id,
            state: Mutex::new(ParallelState::default()),
        }
    }

    pub fn state(&self) -> ParallelState {
        *self.state.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Restart the engine in parallel mode. A rejected configuration leaves
    /// the context in single-request mode with the loop stopped.
    pub fn enable(
        &self,
        engine: &dyn EngineBinding,
        handle: EngineHandle,
        n_parallel: u32,
        n_batch: u32,
    ) -> bool {
        let mut state = self.state.lock();
        engine.stop_processing_loop(handle);
        *state = ParallelState::default();

        if !engine.enable_parallel_mode(handle, n_parallel, n_batch) {
            warn!(
                context = %self.context_id,
                n_parallel, n_batch, "engine rejected parallel configuration"
            );
            return false;
        }
        engine.start_processing_loop(handle);
        *state = ParallelState {
            enabled: true,
            n_parallel,
            n_batch,
        };
        info!(context = %self.context_id, n_parallel, n_batch, "parallel mode enabled");
        true
    }

    pub fn disable(&self, engine: &dyn EngineBinding, handle: EngineHandle) {
        let mut state = self.state.lock();
        engine.stop_processing_loop(handle);
        engine.disable_parallel_mode(handle);
        if state.enabled {
            info!(context = %self.context_id, "parallel mode disabled");
        }
        *state = ParallelState::default();
    }

    /// Stop the loop ahead of freeing the handle.
    pub(crate) fn shutdown(&self, engine: &dyn EngineBinding, handle: EngineHandle) {
        let mut state = self.state.lock();
        engine.stop_processing_loop(handle);
        *state = ParallelState::default();
    }
}
