//! Mock transport for testing
//!
//! This transport stands in for a VISA session when no hardware is attached.
//! It provides:
//! - Scripted replies, either one-shot (consumed in order) or persistent
//! - Failure injection by command prefix
//! - Call logging for test verification

use super::ScpiTransport;
use crate::error::{AppResult, ExpError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Default)]
struct MockState {
    queued: HashMap<String, VecDeque<String>>,
    persistent: HashMap<String, String>,
    fail_prefix: Option<String>,
    call_log: Vec<String>,
}

/// Mock SCPI transport
///
/// # Example
///
/// ```
/// use exp_control::adapters::{MockTransport, ScpiTransport};
///
/// # tokio_test_block(async {
/// let mock = MockTransport::new("GPIB0::25::INSTR");
/// mock.set_reply("*IDN?", "KEITHLEY,2400,0,C30");
/// assert_eq!(mock.query("*IDN?").await.unwrap(), "KEITHLEY,2400,0,C30");
/// assert_eq!(mock.call_log(), vec!["query: *IDN?".to_string()]);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone)]
pub struct MockTransport {
    resource: String,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Reply returned for every query equal to `command`.
    pub fn set_reply(&self, command: &str, reply: &str) {
        self.state
            .lock()
            .persistent
            .insert(command.to_string(), reply.to_string());
    }

    /// One-shot reply; queued replies for the same command are returned in
    /// order and take precedence over a persistent reply.
    pub fn push_reply(&self, command: &str, reply: &str) {
        self.state
            .lock()
            .queued
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_string());
    }

    /// Fail every write or query whose command starts with `prefix`.
    pub fn fail_on(&self, prefix: &str) {
        self.state.lock().fail_prefix = Some(prefix.to_string());
    }

    pub fn clear_failure(&self) {
        self.state.lock().fail_prefix = None;
    }

    /// Every call in order, as `"write: CMD"` or `"query: CMD"`.
    pub fn call_log(&self) -> Vec<String> {
        self.state.lock().call_log.clone()
    }

    /// Commands sent with [`ScpiTransport::write`] only.
    pub fn writes(&self) -> Vec<String> {
        self.state
            .lock()
            .call_log
            .iter()
            .filter_map(|entry| entry.strip_prefix("write: ").map(str::to_string))
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().call_log.clear();
    }

    fn check_failure(&self, state: &MockState, command: &str) -> AppResult<()> {
        match &state.fail_prefix {
            Some(prefix) if command.starts_with(prefix.as_str()) => Err(ExpError::instrument(
                &self.resource,
                format!("injected failure for '{}'", command),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ScpiTransport for MockTransport {
    async fn write(&self, command: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        state.call_log.push(format!("write: {}", command));
        self.check_failure(&state, command)
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        let mut state = self.state.lock();
        state.call_log.push(format!("query: {}", command));
        self.check_failure(&state, command)?;

        if let Some(reply) = state.queued.get_mut(command).and_then(VecDeque::pop_front) {
            return Ok(reply);
        }
        state.persistent.get(command).cloned().ok_or_else(|| {
            ExpError::instrument(
                &self.resource,
                format!("timeout waiting for reply to '{}'", command),
            )
        })
    }

    fn resource(&self) -> &str {
        &self.resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_replies_take_precedence_and_drain() {
        let mock = MockTransport::new("mock");
        mock.set_reply("LEV?", "0");
        mock.push_reply("LEV?", "1");
        mock.push_reply("LEV?", "2");

        assert_eq!(mock.query("LEV?").await.unwrap(), "1");
        assert_eq!(mock.query("LEV?").await.unwrap(), "2");
        assert_eq!(mock.query("LEV?").await.unwrap(), "0");
    }

    #[tokio::test]
    async fn unscripted_query_is_an_instrument_fault() {
        let mock = MockTransport::new("mock");
        let err = mock.query("*IDN?").await.unwrap_err();
        assert!(matches!(err, ExpError::InstrumentFault { .. }));
    }

    #[tokio::test]
    async fn failure_injection_by_prefix() {
        let mock = MockTransport::new("mock");
        mock.fail_on("OUTP");
        assert!(mock.write("OUTP ON").await.is_err());
        assert!(mock.write("SOUR:LEV 1").await.is_ok());

        mock.clear_failure();
        assert!(mock.write("OUTP ON").await.is_ok());
    }

    #[tokio::test]
    async fn call_log_separates_writes() {
        let mock = MockTransport::new("mock");
        mock.set_reply("*OPC?", "1");
        mock.write("*RST").await.unwrap();
        mock.query("*OPC?").await.unwrap();

        assert_eq!(mock.call_log(), vec!["write: *RST", "query: *OPC?"]);
        assert_eq!(mock.writes(), vec!["*RST"]);

        mock.clear_log();
        assert!(mock.call_log().is_empty());
    }
}
