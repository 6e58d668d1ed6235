use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::data::Value;
use crate::graph::{InRef, NodeId, SockRef};

/// Observation hook for a single evaluation. All methods may be called from
/// any worker thread.
pub trait EvalLogger: Send + Sync {
    /// A value became visible at one or more sockets along a forwarding path.
    fn log_socket_value(&self, sockets: &[SockRef], value: &Value);
    /// A multi-input became complete; `values` follow the declared origin
    /// order.
    fn log_multi_input(&self, socket: InRef, values: &[&Value]);
    fn log_execution_time(&self, node: NodeId, duration: Duration);
    /// Free-form diagnostics, including every local recovery (type mismatch,
    /// missing user output, unknown node kind).
    fn log_debug_message(&self, node: Option<NodeId>, message: &str);
}

/// Forwards everything to `tracing` at trace level.
#[derive(Default, Debug)]
pub struct TracingLogger;

impl EvalLogger for TracingLogger {
    fn log_socket_value(&self, sockets: &[SockRef], value: &Value) {
        for socket in sockets {
            trace!(socket = %socket, value = ?value, "socket value");
        }
    }

    fn log_multi_input(&self, socket: InRef, values: &[&Value]) {
        trace!(
            socket = %SockRef::Input(socket),
            count = values.len(),
            "multi-input complete"
        );
    }

    fn log_execution_time(&self, node: NodeId, duration: Duration) {
        trace!(node = %node, ?duration, "node executed");
    }

    fn log_debug_message(&self, node: Option<NodeId>, message: &str) {
        match node {
            Some(node) => trace!(node = %node, message),
            None => trace!(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    SocketValue {
        socket: SockRef,
        value: Value,
    },
    MultiInput {
        socket: InRef,
        values: Vec<Value>,
    },
    ExecutionTime {
        node: NodeId,
    },
    DebugMessage {
        node: Option<NodeId>,
        message: String,
    },
}

/// Records every event in memory. Intended for tests and tooling that want
/// to inspect what the evaluator observed.
#[derive(Default, Debug)]
pub struct CaptureLogger {
    events: Mutex<Vec<LogEvent>>,
}

impl CaptureLogger {
    pub fn take(&self) -> Vec<LogEvent> {
        std::mem::take(&mut self.events.lock())
    }

    pub fn socket_values(&self, socket: SockRef) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                LogEvent::SocketValue { socket: s, value } if *s == socket => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn debug_messages(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                LogEvent::DebugMessage { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn execution_count(&self, node: NodeId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, LogEvent::ExecutionTime { node: n } if *n == node))
            .count()
    }
}

impl EvalLogger for CaptureLogger {
    fn log_socket_value(&self, sockets: &[SockRef], value: &Value) {
        let mut events = self.events.lock();
        for socket in sockets {
            events.push(LogEvent::SocketValue {
                socket: *socket,
                value: value.clone(),
            });
        }
    }

    fn log_multi_input(&self, socket: InRef, values: &[&Value]) {
        self.events.lock().push(LogEvent::MultiInput {
            socket,
            values: values.iter().map(|v| (*v).clone()).collect(),
        });
    }

    fn log_execution_time(&self, node: NodeId, _duration: Duration) {
        self.events.lock().push(LogEvent::ExecutionTime { node });
    }

    fn log_debug_message(&self, node: Option<NodeId>, message: &str) {
        self.events.lock().push(LogEvent::DebugMessage {
            node,
            message: message.to_string(),
        });
    }
}
