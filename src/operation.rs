//! Step bookkeeping for multi-step operations
//!
//! Inbound setup, port migration and restore cross several process and
//! network boundaries with no rollback. A [`StepLog`] records which steps
//! finished and which stores were touched, so a failure says exactly where
//! it stopped and what is already changed.

use std::fmt;
use tracing::info;

use crate::error::VpnctlError;

#[derive(Debug, Clone)]
pub struct StepLog<S> {
    operation: &'static str,
    completed: Vec<S>,
    mutated: Vec<String>,
}

impl<S: Copy + fmt::Debug> StepLog<S> {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            completed: Vec::new(),
            mutated: Vec::new(),
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Mark a step as done
    pub fn complete(&mut self, step: S) {
        info!("{}: {:?} done", self.operation, step);
        self.completed.push(step);
    }

    /// Remember that a store now differs from its state before the operation
    pub fn mutated(&mut self, store: impl Into<String>) {
        let store = store.into();
        if !self.mutated.contains(&store) {
            self.mutated.push(store);
        }
    }

    pub fn last_completed(&self) -> Option<S> {
        self.completed.last().copied()
    }

    pub fn completed(&self) -> &[S] {
        &self.completed
    }

    pub fn mutated_stores(&self) -> &[String] {
        &self.mutated
    }

    /// Wrap the error of the step that was running
    pub fn fail(&self, step: S, error: VpnctlError) -> VpnctlError {
        VpnctlError::StepFailed {
            operation: self.operation,
            step: format!("{:?}", step),
            last_completed: self.last_completed().map(|s| format!("{:?}", s)),
            mutated: self.mutated.clone(),
            source: Box::new(error),
        }
    }

    pub fn into_completed(self) -> Vec<S> {
        self.completed
    }
}
