//! In-memory engine that records every call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Engine, EngineAssets};
use crate::error::EngineError;
use crate::recipe::{self, Dimensions};

/// Inputs starting with this make `execute` fail like a decoder error.
pub const CORRUPT: &[u8] = b"corrupt";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Clear,
    Write(String),
    Execute(Vec<String>),
    Read(String),
    Delete(String),
}

#[derive(Debug, Default)]
pub struct State {
    pub loaded: bool,
    pub files: HashMap<String, Vec<u8>>,
    pub ops: Vec<Op>,
}

#[derive(Clone, Debug, Default)]
pub struct Shared(Arc<Mutex<State>>);

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.0.lock().unwrap()
    }

    pub fn loaded(&self) -> bool {
        self.lock().loaded
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    pub fn clears(&self) -> usize {
        self.ops().iter().filter(|op| **op == Op::Clear).count()
    }

    pub fn executions(&self) -> Vec<Vec<String>> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Execute(argv) => Some(argv),
                _ => None,
            })
            .collect()
    }

    /// Anything other than a clear.
    pub fn touched(&self) -> bool {
        self.ops().iter().any(|op| *op != Op::Clear)
    }

    pub fn files(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().files.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn plant(&self, name: &str, data: &[u8]) {
        self.lock().files.insert(name.to_string(), data.to_vec());
    }
}

#[derive(Debug, Default)]
pub struct RecordingEngine {
    state: Shared,
    fail_load: bool,
    fail_clear: bool,
    dimensions: Option<Dimensions>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Shared {
        self.state.clone()
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn failing_clear(mut self) -> Self {
        self.fail_clear = true;
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Some(Dimensions { width, height });
        self
    }
}

impl Engine for RecordingEngine {
    async fn load(&mut self, _assets: &EngineAssets) -> Result<(), EngineError> {
        if self.fail_load {
            return Err(EngineError::Unavailable("load refused".into()));
        }
        self.state.lock().loaded = true;
        Ok(())
    }

    async fn execute(&mut self, argv: &[String]) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if argv == recipe::clear().as_slice() {
            state.ops.push(Op::Clear);
            return if self.fail_clear {
                Err(EngineError::Exit {
                    code: Some(1),
                    stderr: "clear refused".into(),
                })
            } else {
                Ok(())
            };
        }
        state.ops.push(Op::Execute(argv.to_vec()));

        let input = argv
            .iter()
            .position(|arg| arg == "-i")
            .and_then(|i| argv.get(i + 1))
            .ok_or_else(|| EngineError::Exit {
                code: Some(1),
                stderr: "no input".into(),
            })?;
        let output = argv.last().cloned().unwrap_or_default();
        let data = state
            .files
            .get(input)
            .cloned()
            .ok_or_else(|| EngineError::Exit {
                code: Some(1),
                stderr: format!("{input}: No such file or directory"),
            })?;
        if data.starts_with(CORRUPT) {
            return Err(EngineError::Exit {
                code: Some(1),
                stderr: "Invalid data found when processing input".into(),
            });
        }
        let mut converted = b"converted:".to_vec();
        converted.extend_from_slice(&data);
        state.files.insert(output, converted);
        Ok(())
    }

    async fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.ops.push(Op::Write(name.to_string()));
        state.files.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn read_file(&mut self, name: &str) -> Result<Vec<u8>, EngineError> {
        let mut state = self.state.lock();
        state.ops.push(Op::Read(name.to_string()));
        state
            .files
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::MissingFile(name.to_string()))
    }

    async fn delete_file(&mut self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.ops.push(Op::Delete(name.to_string()));
        state
            .files
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::MissingFile(name.to_string()))
    }

    async fn probe_dimensions(&mut self, _name: &str) -> Option<Dimensions> {
        self.dimensions
    }
}
