//! The locked-node discipline. Every mutation of node state happens inside
//! [`Compute::with_locked_node`]; cross-node effects are buffered on the
//! [`LockedNode`] and dispatched after the lock is released, so a thread
//! never holds two node locks at once.

use super::state::{InputValue, NodeState, NodeSync, ScheduleState, ValueUsage};
use super::{Compute, NextNode, TaskCtx};
use crate::graph::{InRef, NodeId, OutRef, SockRef};

pub(crate) struct LockedNode<'g> {
    pub node_id: NodeId,
    pub sync: &'g mut NodeSync,

    /// Notifications delayed until this node's lock is released. Locking the
    /// target nodes while still holding this one could deadlock.
    pub delayed_required_outputs: Vec<OutRef>,
    pub delayed_unused_outputs: Vec<OutRef>,
    pub delayed_scheduled_nodes: Vec<NodeId>,
}

impl Compute<'_> {
    pub(crate) fn with_locked_node<R>(
        &self,
        node_id: NodeId,
        state: &NodeState,
        ctx: &TaskCtx<'_, '_>,
        mut run_state: Option<&mut NextNode>,
        f: impl FnOnce(&mut LockedNode) -> R,
    ) -> R {
        let mut guard = state.sync.lock();
        let mut locked_node = LockedNode {
            node_id,
            sync: &mut *guard,
            delayed_required_outputs: vec![],
            delayed_unused_outputs: vec![],
            delayed_scheduled_nodes: vec![],
        };
        let result = f(&mut locked_node);

        let LockedNode {
            delayed_required_outputs,
            delayed_unused_outputs,
            delayed_scheduled_nodes,
            ..
        } = locked_node;
        drop(guard);

        for socket in delayed_required_outputs {
            self.send_output_required_notification(socket, ctx, run_state.as_deref_mut());
        }
        for socket in delayed_unused_outputs {
            self.send_output_unused_notification(socket, ctx, run_state.as_deref_mut());
        }
        for node_to_schedule in delayed_scheduled_nodes {
            match run_state.as_deref_mut() {
                // Run the first newly-scheduled node on this worker for cache
                // locality; everything else goes through the pool.
                Some(next) if self.settings.chain_tasks && next.0.is_none() => {
                    next.0 = Some(node_to_schedule);
                }
                _ => self.add_node_to_task_pool(ctx, node_to_schedule),
            }
        }

        result
    }

    /// Transition the node toward execution. The actual pool insert is
    /// delayed until the lock is released; scheduling a running node only
    /// marks it for a re-run.
    pub(crate) fn schedule_node(&self, locked_node: &mut LockedNode) {
        match locked_node.sync.schedule_state {
            ScheduleState::NotScheduled => {
                locked_node.sync.schedule_state = ScheduleState::Scheduled;
                locked_node.delayed_scheduled_nodes.push(locked_node.node_id);
            }
            ScheduleState::Scheduled => {}
            ScheduleState::Running => {
                locked_node.sync.schedule_state = ScheduleState::RunningAndRescheduled;
            }
            ScheduleState::RunningAndRescheduled => {}
        }
    }

    fn send_output_required_notification(
        &self,
        socket: OutRef,
        ctx: &TaskCtx<'_, '_>,
        run_state: Option<&mut NextNode>,
    ) {
        let state = self.state(socket.node);
        self.with_locked_node(socket.node, state, ctx, run_state, |locked_node| {
            let output_state = &mut locked_node.sync.outputs[socket.output_idx];
            if output_state.usage == ValueUsage::Required {
                // Required already means the producer is scheduled already.
                return;
            }
            output_state.usage = ValueUsage::Required;
            self.schedule_node(locked_node);
        });
    }

    fn send_output_unused_notification(
        &self,
        socket: OutRef,
        ctx: &TaskCtx<'_, '_>,
        run_state: Option<&mut NextNode>,
    ) {
        let state = self.state(socket.node);
        self.with_locked_node(socket.node, state, ctx, run_state, |locked_node| {
            let output_state = &mut locked_node.sync.outputs[socket.output_idx];
            output_state.potential_users = output_state
                .potential_users
                .checked_sub(1)
                .expect("potential_users underflow");
            if output_state.potential_users == 0 {
                // A forced output stays required even with no users left.
                if output_state.usage != ValueUsage::Required {
                    output_state.usage = ValueUsage::Unused;
                    // Give the producer a chance to mark its own inputs
                    // unused in turn.
                    self.schedule_node(locked_node);
                }
            }
        });
    }

    /// Mark `input_socket` as required, loading literals for unlinked origins
    /// and requesting outputs from producing nodes.
    ///
    /// Returns true when another node will re-trigger this one once the value
    /// arrives; false when the input was satisfied synchronously.
    pub(crate) fn set_input_required(
        &self,
        locked_node: &mut LockedNode,
        input_socket: InRef,
    ) -> bool {
        assert_eq!(locked_node.node_id, input_socket.node);
        let input_state = &mut locked_node.sync.inputs[input_socket.input_idx];

        assert_ne!(
            input_state.usage,
            ValueUsage::Unused,
            "An unused input cannot become required"
        );

        if input_state.ready_for_execution {
            return false;
        }
        if input_state.usage == ValueUsage::Required {
            // Not ready yet but already required: the node will be triggered
            // again once the value has been computed.
            return true;
        }
        input_state.usage = ValueUsage::Required;

        let missing_values = input_state.value.missing_values();
        if missing_values == 0 {
            return false;
        }
        // Ensures the node is scheduled exactly when the last owed value is
        // provided.
        locked_node.sync.missing_required_inputs += missing_values;

        let mut origin_sockets: Vec<SockRef> = Vec::new();
        self.graph
            .for_each_origin(input_socket, |origin| origin_sockets.push(origin));

        if origin_sockets.is_empty() {
            // Unlinked: the socket's own literal is the value.
            self.load_unlinked_input_value(locked_node, input_socket, SockRef::Input(input_socket));
            locked_node.sync.missing_required_inputs -= 1;
            return false;
        }

        let mut requested_from_other_node = false;
        for origin_socket in origin_sockets {
            match origin_socket {
                SockRef::Input(_) => {
                    // Typically an unlinked passthrough; read the literal
                    // directly.
                    self.load_unlinked_input_value(locked_node, input_socket, origin_socket);
                    locked_node.sync.missing_required_inputs -= 1;
                }
                SockRef::Output(output) => {
                    // The producing node delivers the value later and
                    // triggers this node again.
                    requested_from_other_node = true;
                    locked_node.delayed_required_outputs.push(output);
                }
            }
        }
        requested_from_other_node
    }

    /// Mark `socket` as unused, destroying any value it already holds and
    /// notifying origin nodes that they may have lost their last user.
    pub(crate) fn set_input_unused(&self, locked_node: &mut LockedNode, socket: InRef) {
        let input_state = &mut locked_node.sync.inputs[socket.input_idx];

        assert_ne!(
            input_state.usage,
            ValueUsage::Required,
            "A required input cannot become unused"
        );
        if input_state.usage == ValueUsage::Unused {
            return;
        }
        input_state.usage = ValueUsage::Unused;
        input_state.value.clear();

        if input_state.ready_for_execution {
            // The value was computed and observed already; origins were paid
            // in full.
            return;
        }

        let delayed_unused = &mut locked_node.delayed_unused_outputs;
        self.graph.for_each_origin(socket, |origin| {
            if let SockRef::Output(output) = origin {
                delayed_unused.push(output);
            }
        });
    }

    /// Destroy any value the slot holds without changing its usage.
    pub(crate) fn destruct_input_value_if_exists(locked_node: &mut LockedNode, input_idx: usize) {
        locked_node.sync.inputs[input_idx].value.clear();
    }

    /// Deposit a freshly forwarded value into an input slot, scheduling the
    /// node when the last owed required value arrives.
    pub(crate) fn add_value_to_input_socket(
        &self,
        socket: InRef,
        origin: SockRef,
        value: crate::data::Value,
        ctx: &TaskCtx<'_, '_>,
        run_state: Option<&mut NextNode>,
    ) {
        let state = self.state(socket.node);
        self.with_locked_node(socket.node, state, ctx, run_state, |locked_node| {
            let input_state = &mut locked_node.sync.inputs[socket.input_idx];
            match &mut input_state.value {
                InputValue::Multi(multi) => {
                    multi.add_value(origin, value);
                    if multi.all_values_available() {
                        self.log_multi_input(socket, multi);
                    }
                }
                InputValue::Single(single) => {
                    assert!(
                        single.is_none(),
                        "Single input received a second value at {}",
                        SockRef::Input(socket)
                    );
                    *single = Some(value);
                }
            }

            if input_state.usage == ValueUsage::Required {
                locked_node.sync.missing_required_inputs = locked_node
                    .sync
                    .missing_required_inputs
                    .checked_sub(1)
                    .expect("missing_required_inputs underflow");
                if locked_node.sync.missing_required_inputs == 0 {
                    self.schedule_node(locked_node);
                }
            }
        });
    }
}
