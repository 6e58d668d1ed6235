//! One task = one node run: preprocessing under the node lock, execution
//! without it, postprocessing under it again.

use std::sync::Arc;
use std::time::Instant;

use common::is_debug;

use super::locked::LockedNode;
use super::state::{InputValue, NodeState, ScheduleState, ValueUsage};
use super::{Compute, NextNode, TaskCtx};
use crate::data::{DataType, Value};
use crate::field::{Field, FieldOperation};
use crate::function::{ExecCtx, FuncExec};
use crate::graph::{InRef, NodeId, NodeKind, OutRef};

impl Compute<'_> {
    /// Entry point of a pool task. Runs the given node, then chains to at
    /// most one follow-up node scheduled during the run.
    pub(crate) fn node_task(&self, first_node: NodeId, ctx: &TaskCtx<'_, '_>) {
        let mut next_node = Some(first_node);
        while let Some(node_id) = next_node {
            let mut run_state = NextNode(None);
            self.node_task_run(node_id, ctx, &mut run_state);
            next_node = run_state.0;
        }
    }

    fn node_task_run(&self, node_id: NodeId, ctx: &TaskCtx<'_, '_>, run_state: &mut NextNode) {
        // Group sockets are filled and read by the driver, never executed.
        let node = self.node(node_id);
        if matches!(node.kind, NodeKind::GroupInput | NodeKind::GroupOutput) {
            return;
        }

        let state = self.state(node_id);
        let do_execute_node = self.node_task_preprocessing(node_id, state, ctx, run_state);
        if do_execute_node {
            self.execute_node(node_id, ctx, run_state);
        }
        self.node_task_postprocessing(node_id, state, do_execute_node, ctx, run_state);
    }

    fn node_task_preprocessing(
        &self,
        node_id: NodeId,
        state: &NodeState,
        ctx: &TaskCtx<'_, '_>,
        run_state: &mut NextNode,
    ) -> bool {
        let mut do_execute_node = false;
        self.with_locked_node(node_id, state, ctx, Some(run_state), |locked_node| {
            assert_eq!(locked_node.sync.schedule_state, ScheduleState::Scheduled);
            locked_node.sync.schedule_state = ScheduleState::Running;

            if locked_node.sync.node_has_finished {
                return;
            }
            // A forced input can be the node's only remaining obligation.
            // Snapshot it even when no output requires a run, so the node
            // can still finish and release its other inputs.
            snapshot_force_compute_inputs(locked_node);
            if !prepare_node_outputs_for_execution(locked_node) {
                return;
            }
            // Requiring all inputs of eager nodes here, after at least one
            // output is known to be needed, saves a scheduling round trip
            // for most nodes.
            if !locked_node.sync.non_lazy_inputs_handled {
                self.require_non_lazy_inputs(locked_node);
                locked_node.sync.non_lazy_inputs_handled = true;
            }
            if !prepare_node_inputs_for_execution(locked_node) {
                return;
            }
            do_execute_node = true;
        });
        do_execute_node
    }

    fn require_non_lazy_inputs(&self, locked_node: &mut LockedNode) {
        if self.node_supports_laziness(self.node(locked_node.node_id)) {
            // Lazy nodes request inputs themselves while running.
            return;
        }
        for input_idx in 0..locked_node.sync.inputs.len() {
            if locked_node.sync.inputs[input_idx].data_type.is_none() {
                continue;
            }
            self.set_input_required(
                locked_node,
                InRef {
                    node: locked_node.node_id,
                    input_idx,
                },
            );
        }
    }

    fn execute_node(&self, node_id: NodeId, ctx: &TaskCtx<'_, '_>, run_state: &mut NextNode) {
        let compute = ctx.compute;
        let node = compute.node(node_id);
        let state = compute.state(node_id);
        {
            let mut sync = state.sync.lock();
            if sync.has_been_executed {
                assert!(
                    compute.node_supports_laziness(node),
                    "Node {} does not support laziness but was executed twice",
                    node.name
                );
            }
            sync.has_been_executed = true;
        }

        let func = match node.kind {
            NodeKind::Function => compute.func_lib.func_by_id(node.func_id),
            _ => None,
        };
        match func.map(|func| &func.exec) {
            Some(FuncExec::Callback(callback)) => {
                self.execute_callback_node(node_id, callback.clone(), ctx, run_state);
            }
            Some(FuncExec::MultiFn(multi_fn)) => {
                self.execute_multi_fn_node(node_id, multi_fn.clone(), ctx, run_state);
            }
            Some(FuncExec::Unknown) | None => {
                self.execute_unknown_node(node_id, ctx, run_state);
            }
        }
    }

    fn execute_callback_node(
        &self,
        node_id: NodeId,
        callback: Arc<crate::function::Callback>,
        ctx: &TaskCtx<'_, '_>,
        run_state: &mut NextNode,
    ) {
        let compute = ctx.compute;
        let mut node_run = NodeRun {
            compute,
            node_id,
            state: compute.state(node_id),
            ctx,
            run_state,
        };

        let start = Instant::now();
        (callback)(&mut node_run);
        compute.log_execution_time(node_id, start.elapsed());

        // Eager nodes never run again, so outputs they failed to produce are
        // reconciled with defaults right away. Lazy nodes may legitimately
        // yield without outputs.
        if !compute.node_supports_laziness(compute.node(node_id)) {
            node_run.set_default_remaining_outputs();
        }
    }

    fn execute_multi_fn_node(
        &self,
        node_id: NodeId,
        multi_fn: Arc<dyn crate::field::MultiFn>,
        ctx: &TaskCtx<'_, '_>,
        run_state: &mut NextNode,
    ) {
        let compute = ctx.compute;
        let node = compute.node(node_id);
        let state = compute.state(node_id);

        let mut input_values: Vec<Value> = Vec::new();
        {
            let sync = state.sync.lock();
            for (input_idx, socket) in node.inputs.iter().enumerate() {
                if !socket.available {
                    continue;
                }
                let input_state = &sync.inputs[input_idx];
                if input_state.data_type.is_none() {
                    continue;
                }
                assert!(
                    !socket.multi,
                    "Multi-input sockets are not supported on multi-function nodes"
                );
                assert!(input_state.ready_for_execution);
                let InputValue::Single(Some(value)) = &input_state.value else {
                    panic!("Missing input value on multi-function node {}", node.name);
                };
                input_values.push(value.clone());
            }
        }

        let output_decl: Vec<(usize, DataType)> = node
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, socket)| socket.available)
            .filter_map(|(output_idx, socket)| {
                socket.data_type.clone().map(|data_type| (output_idx, data_type))
            })
            .collect();

        let any_input_is_field = input_values.iter().any(Value::is_field);
        if any_input_is_field {
            // Lift the whole node into a deferred field operation; outputs
            // become fields over the same operation.
            let input_fields: Vec<Field> =
                input_values.into_iter().map(Value::into_field).collect();
            let output_types: Vec<DataType> =
                output_decl.iter().map(|(_, data_type)| data_type.clone()).collect();
            let operation = Arc::new(FieldOperation::new(multi_fn, input_fields, output_types));
            for (op_output_idx, (output_idx, _)) in output_decl.iter().enumerate() {
                let field = Field::operation(operation.clone(), op_output_idx);
                compute.forward_output(
                    OutRef {
                        node: node_id,
                        output_idx: *output_idx,
                    },
                    Value::Field(field),
                    ctx,
                    Some(run_state),
                );
                state.sync.lock().outputs[*output_idx].has_been_computed = true;
            }
        } else {
            // All scalar: call eagerly on single elements.
            let mut outputs: Vec<Value> = output_decl
                .iter()
                .map(|(_, data_type)| Value::from(data_type))
                .collect();
            multi_fn.call(&input_values, &mut outputs);
            for ((output_idx, _), value) in output_decl.iter().zip(outputs) {
                compute.forward_output(
                    OutRef {
                        node: node_id,
                        output_idx: *output_idx,
                    },
                    value,
                    ctx,
                    Some(run_state),
                );
                state.sync.lock().outputs[*output_idx].has_been_computed = true;
            }
        }
    }

    fn execute_unknown_node(
        &self,
        node_id: NodeId,
        ctx: &TaskCtx<'_, '_>,
        run_state: &mut NextNode,
    ) {
        let compute = ctx.compute;
        let node = compute.node(node_id);
        let state = compute.state(node_id);

        compute.log_recovery(
            Some(node_id),
            &format!("node {} has no implementation; forwarding defaults", node.name),
        );
        for (output_idx, socket) in node.outputs.iter().enumerate() {
            if !socket.available {
                continue;
            }
            let Some(data_type) = &socket.data_type else {
                continue;
            };
            state.sync.lock().outputs[output_idx].has_been_computed = true;
            compute.forward_output(
                OutRef {
                    node: node_id,
                    output_idx,
                },
                Value::from(data_type),
                ctx,
                Some(run_state),
            );
        }
    }

    fn node_task_postprocessing(
        &self,
        node_id: NodeId,
        state: &NodeState,
        was_executed: bool,
        ctx: &TaskCtx<'_, '_>,
        run_state: &mut NextNode,
    ) {
        self.with_locked_node(node_id, state, ctx, Some(run_state), |locked_node| {
            let node_has_finished = self.finish_node_if_possible(locked_node);
            let reschedule_requested =
                locked_node.sync.schedule_state == ScheduleState::RunningAndRescheduled;
            locked_node.sync.schedule_state = ScheduleState::NotScheduled;
            if reschedule_requested && !node_has_finished {
                // Someone requested this node while it ran, or the node
                // rescheduled itself.
                self.schedule_node(locked_node);
            }
            if was_executed {
                self.assert_expected_outputs_have_been_computed(locked_node);
            }
        });
    }

    /// A node is finished when every output that may be used has been
    /// computed and no input still has to be materialized for observation.
    /// Finishing destroys or un-uses its inputs, which can cascade leftward.
    fn finish_node_if_possible(&self, locked_node: &mut LockedNode) -> bool {
        if locked_node.sync.node_has_finished {
            return true;
        }

        for output_state in &locked_node.sync.outputs {
            if !output_state.has_been_computed && output_state.usage != ValueUsage::Unused {
                return false;
            }
        }
        for input_state in &locked_node.sync.inputs {
            if input_state.force_compute && !input_state.ready_for_execution {
                return false;
            }
        }

        for input_idx in 0..locked_node.sync.inputs.len() {
            match locked_node.sync.inputs[input_idx].usage {
                ValueUsage::Maybe => {
                    let socket = InRef {
                        node: locked_node.node_id,
                        input_idx,
                    };
                    self.set_input_unused(locked_node, socket);
                }
                ValueUsage::Required => {
                    // Required usage is terminal, but the value itself is no
                    // longer observable.
                    Self::destruct_input_value_if_exists(locked_node, input_idx);
                }
                ValueUsage::Unused => {}
            }
        }
        locked_node.sync.node_has_finished = true;
        true
    }

    fn assert_expected_outputs_have_been_computed(&self, locked_node: &mut LockedNode) {
        if !is_debug() {
            return;
        }
        // Outputs can only exist once all required inputs were provided.
        if locked_node.sync.missing_required_inputs > 0 {
            return;
        }
        // A still-scheduled node will produce its outputs on a later run.
        if locked_node.sync.schedule_state == ScheduleState::Scheduled {
            return;
        }

        let supports_laziness = self.node_supports_laziness(self.node(locked_node.node_id));
        for output_state in &locked_node.sync.outputs {
            if supports_laziness {
                // A lazy node runs again when more outputs become required.
                if output_state.usage_for_execution == ValueUsage::Required {
                    assert!(output_state.has_been_computed);
                }
            } else if output_state.usage_for_execution != ValueUsage::Unused {
                assert!(output_state.has_been_computed);
            }
        }
    }
}

/// Mark complete force-compute slots as ready. Runs on every scheduled run
/// attempt, including ones that skip execution because no output is needed;
/// a node with nothing but forced inputs must still be able to finish.
fn snapshot_force_compute_inputs(locked_node: &mut LockedNode) {
    for input_state in locked_node.sync.inputs.iter_mut() {
        if !input_state.force_compute || input_state.ready_for_execution {
            continue;
        }
        if input_state.value.is_complete() {
            input_state.ready_for_execution = true;
        }
    }
}

fn prepare_node_outputs_for_execution(locked_node: &mut LockedNode) -> bool {
    let mut execution_is_necessary = false;
    for output_state in locked_node.sync.outputs.iter_mut() {
        // Snapshot the usage so the run sees a consistent view.
        output_state.usage_for_execution = output_state.usage;
        if !output_state.has_been_computed && output_state.usage == ValueUsage::Required {
            execution_is_necessary = true;
        }
    }
    execution_is_necessary
}

/// Snapshot which inputs are complete. Values arriving after this moment are
/// invisible to the current run. Returns false when a required input is
/// still incomplete, in which case the node cannot execute.
fn prepare_node_inputs_for_execution(locked_node: &mut LockedNode) -> bool {
    for input_state in locked_node.sync.inputs.iter_mut() {
        if input_state.data_type.is_none() {
            continue;
        }
        if input_state.ready_for_execution {
            continue;
        }
        if input_state.value.is_complete() {
            input_state.ready_for_execution = true;
        } else if input_state.usage == ValueUsage::Required {
            return false;
        }
    }
    true
}

/// The [`ExecCtx`] handed to node callbacks. Accessors take the node's own
/// lock only for the duration of a field read or write; no lock is held
/// while foreign code (forwarding, conversions) runs.
struct NodeRun<'r, 's, 'e> {
    compute: &'e Compute<'e>,
    node_id: NodeId,
    state: &'e NodeState,
    ctx: &'r TaskCtx<'s, 'e>,
    run_state: &'r mut NextNode,
}

impl ExecCtx for NodeRun<'_, '_, '_> {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn can_get_input(&self, input_idx: usize) -> bool {
        let sync = self.state.sync.lock();
        let input_state = &sync.inputs[input_idx];
        input_state.ready_for_execution && input_state.value.is_complete()
    }

    fn get_input(&self, input_idx: usize) -> Value {
        let sync = self.state.sync.lock();
        let input_state = &sync.inputs[input_idx];
        assert!(input_state.ready_for_execution);
        match &input_state.value {
            InputValue::Single(Some(value)) => value.clone(),
            InputValue::Single(None) => panic!("Input {} holds no value", input_idx),
            InputValue::Multi(_) => panic!("get_input on multi-input {}", input_idx),
        }
    }

    fn extract_input(&mut self, input_idx: usize) -> Value {
        let mut sync = self.state.sync.lock();
        let input_state = &mut sync.inputs[input_idx];
        assert!(input_state.ready_for_execution);
        match &mut input_state.value {
            InputValue::Single(value) => value
                .take()
                .unwrap_or_else(|| panic!("Input {} holds no value", input_idx)),
            InputValue::Multi(_) => panic!("extract_input on multi-input {}", input_idx),
        }
    }

    fn extract_multi_input(&mut self, input_idx: usize) -> Vec<Value> {
        let mut sync = self.state.sync.lock();
        let input_state = &mut sync.inputs[input_idx];
        assert!(input_state.ready_for_execution);
        match &mut input_state.value {
            InputValue::Multi(multi) => multi
                .values
                .iter_mut()
                .map(|value| {
                    value
                        .take()
                        .expect("Multi-input cell holds no value")
                })
                .collect(),
            InputValue::Single(_) => panic!("extract_multi_input on single input {}", input_idx),
        }
    }

    fn set_input_unused(&mut self, input_idx: usize) {
        let compute = self.compute;
        let socket = InRef {
            node: self.node_id,
            input_idx,
        };
        compute.with_locked_node(
            self.node_id,
            self.state,
            self.ctx,
            Some(&mut *self.run_state),
            |locked_node| {
                compute.set_input_unused(locked_node, socket);
            },
        );
    }

    fn output_is_required(&self, output_idx: usize) -> bool {
        let sync = self.state.sync.lock();
        let output_state = &sync.outputs[output_idx];
        !output_state.has_been_computed
            && output_state.usage_for_execution != ValueUsage::Unused
    }

    fn set_output(&mut self, output_idx: usize, value: Value) {
        {
            let mut sync = self.state.sync.lock();
            let output_state = &mut sync.outputs[output_idx];
            assert!(
                !output_state.has_been_computed,
                "Output {} was set twice",
                output_idx
            );
            output_state.has_been_computed = true;
        }
        self.compute.forward_output(
            OutRef {
                node: self.node_id,
                output_idx,
            },
            value,
            self.ctx,
            Some(&mut *self.run_state),
        );
    }

    fn lazy_require_input(&mut self, input_idx: usize) -> bool {
        debug_assert!(self
            .compute
            .node_supports_laziness(self.compute.node(self.node_id)));
        {
            let sync = self.state.sync.lock();
            if sync.inputs[input_idx].ready_for_execution {
                return false;
            }
        }
        let compute = self.compute;
        let socket = InRef {
            node: self.node_id,
            input_idx,
        };
        compute.with_locked_node(
            self.node_id,
            self.state,
            self.ctx,
            Some(&mut *self.run_state),
            |locked_node| {
                if !compute.set_input_required(locked_node, socket) {
                    // The value is available now but was not snapshotted for
                    // this run; run again to pick it up.
                    compute.schedule_node(locked_node);
                }
            },
        );
        true
    }

    fn lazy_output_is_required(&self, output_idx: usize) -> bool {
        let sync = self.state.sync.lock();
        let output_state = &sync.outputs[output_idx];
        !output_state.has_been_computed
            && output_state.usage_for_execution == ValueUsage::Required
    }

    fn set_default_remaining_outputs(&mut self) {
        let node = self.compute.node(self.node_id);
        for (output_idx, socket) in node.outputs.iter().enumerate() {
            if !socket.available {
                continue;
            }
            let Some(data_type) = &socket.data_type else {
                continue;
            };
            {
                let mut sync = self.state.sync.lock();
                let output_state = &mut sync.outputs[output_idx];
                if output_state.has_been_computed
                    || output_state.usage_for_execution == ValueUsage::Unused
                {
                    continue;
                }
                output_state.has_been_computed = true;
            }
            self.compute.log_recovery(
                Some(self.node_id),
                &format!("output {} was not set; forwarding default", socket.name),
            );
            self.compute.forward_output(
                OutRef {
                    node: self.node_id,
                    output_idx,
                },
                Value::from(data_type),
                self.ctx,
                Some(&mut *self.run_state),
            );
        }
    }
}
