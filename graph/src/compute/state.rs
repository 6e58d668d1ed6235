use parking_lot::Mutex;

use crate::data::{DataType, Value};
use crate::graph::SockRef;

/// The three monotone usage levels. `Maybe` may transition to either terminal
/// state; `Required` and `Unused` never change again (except that a
/// force-computed output may be promoted from `Unused` to `Required` before
/// scheduling starts).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ValueUsage {
    Required,
    Maybe,
    Unused,
}

/// Scheduling state of a node. A node is never inserted into the task pool
/// twice: scheduling a `Running` node only flips it to
/// `RunningAndRescheduled`, and the finishing task re-schedules it itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ScheduleState {
    NotScheduled,
    Scheduled,
    Running,
    RunningAndRescheduled,
}

/// Values of a multi-input, one cell per declared origin. The same origin can
/// occur multiple times; cells from the same origin hold values that compare
/// equal, so which duplicate cell a delivery lands in is immaterial.
#[derive(Debug)]
pub(crate) struct MultiInput {
    pub origins: Vec<SockRef>,
    pub values: Vec<Option<Value>>,
    pub provided_value_count: usize,
}

/// Value carrier of one input slot.
#[derive(Debug)]
pub(crate) enum InputValue {
    Single(Option<Value>),
    Multi(MultiInput),
}

#[derive(Debug)]
pub(crate) struct InputState {
    /// Type of the socket. `None` means the slot is ignored entirely
    /// (unavailable or control-only sockets).
    pub data_type: Option<DataType>,

    /// Value(s) forwarded into this slot. Lives here until the node consumes
    /// it or the slot is found to be unused.
    pub value: InputValue,

    /// How the node intends to use this input. Starts at `Maybe`; the
    /// evaluator narrows it so values can be freed early.
    pub usage: ValueUsage,

    /// Set while the node lock is held when a run snapshots the slot as
    /// complete. From then until the node finishes, the slot is not mutated
    /// by other threads, which gives the running node a consistent view.
    pub ready_for_execution: bool,

    /// The slot must be materialized for observation even if no output needs
    /// it.
    pub force_compute: bool,
}

#[derive(Debug)]
pub(crate) struct OutputState {
    /// Once true, the value has been computed and forwarded; it is never
    /// computed again.
    pub has_been_computed: bool,

    /// Becomes `Required` when a connected input becomes required, `Unused`
    /// when `potential_users` reaches zero.
    pub usage: ValueUsage,

    /// Snapshot of `usage` taken right before a run starts, so the node sees
    /// a consistent view even if usage changes while it runs.
    pub usage_for_execution: ValueUsage,

    /// How many reachable downstream inputs might still consume this output.
    pub potential_users: usize,
}

/// Mutable node state; every access goes through the owning
/// [`NodeState::sync`] mutex.
#[derive(Debug)]
pub(crate) struct NodeSync {
    pub inputs: Vec<InputState>,
    pub outputs: Vec<OutputState>,

    /// First-run gate: inputs of nodes that don't support laziness are all
    /// required before the first execution attempt.
    pub non_lazy_inputs_handled: bool,

    /// Used to check that nodes that don't support laziness run at most once.
    pub has_been_executed: bool,

    /// Terminal. Once set the node never runs again and its inputs have been
    /// destroyed or marked unused.
    pub node_has_finished: bool,

    /// Number of values still owed to required input slots (multi-input cells
    /// count separately). Keeps nodes from being scheduled before their
    /// inputs can possibly be complete.
    pub missing_required_inputs: usize,

    pub schedule_state: ScheduleState,
}

#[derive(Debug)]
pub(crate) struct NodeState {
    pub sync: Mutex<NodeSync>,
}

impl MultiInput {
    pub fn all_values_available(&self) -> bool {
        self.missing_values() == 0
    }

    pub fn missing_values(&self) -> usize {
        self.values.len() - self.provided_value_count
    }

    /// Deposit a value into the first empty cell recorded for `origin`.
    pub fn add_value(&mut self, origin: SockRef, value: Value) {
        let index = self
            .find_available_index(origin)
            .unwrap_or_else(|| panic!("No empty multi-input cell for origin {}", origin));
        self.values[index] = Some(value);
        self.provided_value_count += 1;
    }

    fn find_available_index(&self, origin: SockRef) -> Option<usize> {
        self.origins
            .iter()
            .enumerate()
            .position(|(i, o)| self.values[i].is_none() && *o == origin)
    }

    /// The provided values in origin order. Only meaningful once
    /// [`MultiInput::all_values_available`] returns true.
    pub fn provided_values(&self) -> Vec<&Value> {
        self.values.iter().filter_map(|v| v.as_ref()).collect()
    }
}

impl InputValue {
    pub fn is_complete(&self) -> bool {
        match self {
            InputValue::Single(value) => value.is_some(),
            InputValue::Multi(multi) => multi.all_values_available(),
        }
    }

    pub fn missing_values(&self) -> usize {
        match self {
            InputValue::Single(value) => usize::from(value.is_none()),
            InputValue::Multi(multi) => multi.missing_values(),
        }
    }

    /// Destroy any values held by the slot.
    pub fn clear(&mut self) {
        match self {
            InputValue::Single(value) => *value = None,
            InputValue::Multi(multi) => {
                multi.values.iter_mut().for_each(|value| *value = None);
                multi.provided_value_count = 0;
            }
        }
    }
}

impl InputState {
    /// An ignored slot for sockets that carry no data.
    pub fn ignored() -> InputState {
        InputState {
            data_type: None,
            value: InputValue::Single(None),
            usage: ValueUsage::Unused,
            ready_for_execution: false,
            force_compute: false,
        }
    }
}

impl NodeState {
    pub fn new(inputs: Vec<InputState>, outputs: Vec<OutputState>) -> NodeState {
        NodeState {
            sync: Mutex::new(NodeSync {
                inputs,
                outputs,
                non_lazy_inputs_handled: false,
                has_been_executed: false,
                node_has_finished: false,
                missing_required_inputs: 0,
                schedule_state: ScheduleState::NotScheduled,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InRef, NodeId, OutRef, SockRef};

    fn out_sock(node: NodeId, output_idx: usize) -> SockRef {
        SockRef::Output(OutRef { node, output_idx })
    }

    #[test]
    fn multi_input_fills_duplicate_origins_in_order() {
        let producer = NodeId::unique();
        let other = NodeId::unique();
        let o = out_sock(producer, 0);
        let p = out_sock(other, 0);

        let mut multi = MultiInput {
            origins: vec![o, o, p],
            values: vec![None, None, None],
            provided_value_count: 0,
        };
        assert_eq!(multi.missing_values(), 3);

        multi.add_value(o, Value::Int(7));
        multi.add_value(p, Value::Int(9));
        multi.add_value(o, Value::Int(7));
        assert!(multi.all_values_available());

        let values: Vec<i64> = multi.provided_values().iter().map(|v| v.as_int()).collect();
        assert_eq!(values, [7, 7, 9]);
    }

    #[test]
    #[should_panic]
    fn multi_input_rejects_unknown_origin() {
        let node = NodeId::unique();
        let mut multi = MultiInput {
            origins: vec![out_sock(node, 0)],
            values: vec![None],
            provided_value_count: 0,
        };
        multi.add_value(
            SockRef::Input(InRef {
                node,
                input_idx: 1,
            }),
            Value::Int(0),
        );
    }

    #[test]
    fn input_value_clear_resets_counts() {
        let node = NodeId::unique();
        let origin = out_sock(node, 0);
        let mut value = InputValue::Multi(MultiInput {
            origins: vec![origin, origin],
            values: vec![Some(Value::Int(1)), None],
            provided_value_count: 1,
        });
        assert!(!value.is_complete());
        assert_eq!(value.missing_values(), 1);

        value.clear();
        assert_eq!(value.missing_values(), 2);
    }
}
