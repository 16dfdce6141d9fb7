//! Stateful mock for the shell execution seam.
//!
//! Records every command line so tests assert on the exact kernel mutations
//! a lifecycle operation issues, with scripted exit statuses and stdout.
//!
//! Uses `Arc<Mutex<_>>` for interior mutability in async contexts.

#![cfg(test)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::shell_ops::{Logs, ShellOps};

#[derive(Debug, Default)]
pub struct ShellState {
    /// Every `bash` command line, in issue order.
    pub commands: Vec<String>,
    /// Exit status per exact command line; unlisted commands return 0.
    pub statuses: HashMap<String, i32>,
    /// Every `bash_output` command line, in issue order.
    pub queries: Vec<String>,
    /// Scripted stdout per exact `bash_output` command line.
    pub outputs: HashMap<String, String>,
}

#[derive(Clone)]
pub struct MockShellOps {
    pub state: Arc<Mutex<ShellState>>,
}

impl MockShellOps {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ShellState::default())),
        }
    }

    /// Commands recorded so far.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Recorded commands containing `needle`.
    pub fn commands_containing(&self, needle: &str) -> Vec<String> {
        self.commands().into_iter().filter(|c| c.contains(needle)).collect()
    }

    /// Forget recorded commands and queries; scripted responses stay.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.commands.clear();
        state.queries.clear();
    }

    pub fn set_status(&self, command: &str, status: i32) {
        self.state.lock().unwrap().statuses.insert(command.to_string(), status);
    }

    pub fn set_output(&self, command: &str, output: &str) {
        self.state.lock().unwrap().outputs.insert(command.to_string(), output.to_string());
    }
}

#[async_trait]
impl ShellOps for MockShellOps {
    async fn bash(&self, command: &str, _logs: Logs) -> i32 {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());
        state.statuses.get(command).copied().unwrap_or(0)
    }

    async fn bash_output(&self, command: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(command.to_string());
        state.outputs.get(command).cloned()
    }
}
