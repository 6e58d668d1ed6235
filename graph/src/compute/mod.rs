//! Lazy, parallel, pull-based evaluation of a [`Graph`].
//!
//! The caller names input sockets whose values it wants materialized; the
//! evaluator walks the reachable part of the graph, schedules node runs on
//! the rayon pool and propagates usage both ways so that values that can
//! never be observed are neither computed nor kept alive.

mod forward;
mod locked;
mod run;
mod state;

use std::mem::take;

use hashbrown::{HashMap, HashSet};
use rayon::Scope;

use common::{is_debug, parallel};

use crate::data::{DataType, Value};
use crate::function::FuncLib;
use crate::graph::{Graph, InRef, Node, NodeId, NodeKind, OutRef, SockRef};
use crate::logger::EvalLogger;
use state::{InputState, InputValue, MultiInput, NodeState, OutputState, ValueUsage};

#[derive(Clone, Debug)]
pub struct ComputeSettings {
    /// Let a worker run one newly-scheduled node directly after the current
    /// one instead of going through the pool. Observable only through
    /// performance; tests disable it to prove that.
    pub chain_tasks: bool,
}

impl Default for ComputeSettings {
    fn default() -> Self {
        ComputeSettings { chain_tasks: true }
    }
}

pub struct ComputeParams<'a> {
    pub graph: &'a Graph,
    pub func_lib: &'a FuncLib,
    /// Input sockets whose values the caller wants back, in return order.
    /// Must be available, typed, single-value sockets.
    pub requested_sockets: Vec<InRef>,
    /// Sockets that must be materialized for observation even if nothing
    /// downstream needs them.
    pub force_compute_sockets: Vec<SockRef>,
    /// Starting values for group-input outputs.
    pub input_values: Vec<(OutRef, Value)>,
    pub logger: Option<&'a dyn EvalLogger>,
    pub settings: ComputeSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputedValue {
    pub data_type: DataType,
    pub value: Value,
}

impl<'a> ComputeParams<'a> {
    pub fn new(graph: &'a Graph, func_lib: &'a FuncLib) -> ComputeParams<'a> {
        ComputeParams {
            graph,
            func_lib,
            requested_sockets: vec![],
            force_compute_sockets: vec![],
            input_values: vec![],
            logger: None,
            settings: ComputeSettings::default(),
        }
    }
}

/// Evaluate the graph and return one value per requested socket, in request
/// order. Runs until the task pool is quiescent.
pub fn compute(params: ComputeParams<'_>) -> Vec<ComputedValue> {
    validate_compute_params(&params);
    Compute::new(params).run()
}

/// One follow-up node a worker may chain to after its current node, instead
/// of a round trip through the pool.
#[derive(Default)]
pub(crate) struct NextNode(pub Option<NodeId>);

pub(crate) struct TaskCtx<'s, 'e> {
    pub compute: &'e Compute<'e>,
    pub scope: &'s Scope<'e>,
}

pub(crate) struct Compute<'a> {
    graph: &'a Graph,
    func_lib: &'a FuncLib,
    requested_sockets: Vec<InRef>,
    force_compute_sockets: Vec<SockRef>,
    input_values: Vec<(OutRef, Value)>,
    logger: Option<&'a dyn EvalLogger>,
    settings: ComputeSettings,

    /// One state per reachable node. Read-only after initialization, so
    /// lookups from worker threads need no lock; all mutation goes through
    /// the per-node mutex inside [`NodeState`].
    node_states: HashMap<NodeId, NodeState>,
    node_idx_by_id: HashMap<NodeId, usize>,
}

impl<'a> Compute<'a> {
    fn new(params: ComputeParams<'a>) -> Compute<'a> {
        Compute {
            graph: params.graph,
            func_lib: params.func_lib,
            requested_sockets: params.requested_sockets,
            force_compute_sockets: params.force_compute_sockets,
            input_values: params.input_values,
            logger: params.logger,
            settings: params.settings,
            node_states: HashMap::new(),
            node_idx_by_id: HashMap::new(),
        }
    }

    fn run(mut self) -> Vec<ComputedValue> {
        self.node_idx_by_id = self.graph.node_index_by_id();
        self.create_states_for_reachable_nodes();

        let input_values = take(&mut self.input_values);
        let this = &self;
        // The scope is the task pool: it blocks until every spawned node task
        // has completed, which is exactly quiescence.
        rayon::in_place_scope(|scope| {
            let ctx = TaskCtx {
                compute: this,
                scope,
            };
            this.forward_group_inputs(input_values, &ctx);
            this.schedule_initial_nodes(&ctx);
        });

        let outputs = self.extract_requested_values();
        self.destruct_node_states();
        outputs
    }

    fn create_states_for_reachable_nodes(&mut self) {
        // Depth-first over origin edges, starting from everything the caller
        // asked for.
        let mut nodes_to_check: Vec<NodeId> = Vec::new();
        nodes_to_check.extend(self.requested_sockets.iter().map(|socket| socket.node));
        nodes_to_check.extend(self.force_compute_sockets.iter().map(SockRef::node));

        let mut reachable: HashSet<NodeId> = HashSet::new();
        while let Some(node_id) = nodes_to_check.pop() {
            if !reachable.insert(node_id) {
                continue;
            }
            let node = self.node(node_id);
            for input_idx in 0..node.inputs.len() {
                self.graph.for_each_origin(node.in_ref(input_idx), |origin| {
                    nodes_to_check.push(origin.node());
                });
            }
        }

        // The set no longer changes, so the heavier per-node setup can run in
        // parallel.
        let node_ids: Vec<NodeId> = reachable.iter().copied().collect();
        let this = &*self;
        let states = parallel::par_map(node_ids, |node_id| {
            (node_id, this.initialize_node_state(node_id, &reachable))
        });
        self.node_states = states.into_iter().collect();

        for socket in &self.force_compute_sockets {
            if let SockRef::Input(input) = socket {
                let state = self
                    .node_states
                    .get_mut(&input.node)
                    .expect("Force-compute socket on unreachable node");
                state.sync.get_mut().inputs[input.input_idx].force_compute = true;
            }
        }
    }

    fn initialize_node_state(&self, node_id: NodeId, reachable: &HashSet<NodeId>) -> NodeState {
        let node = self.node(node_id);

        let inputs = node
            .inputs
            .iter()
            .enumerate()
            .map(|(input_idx, socket)| {
                if !socket.available || socket.data_type.is_none() {
                    return InputState::ignored();
                }
                let value = if socket.multi {
                    let mut origins: Vec<SockRef> = Vec::new();
                    self.graph
                        .for_each_origin(node.in_ref(input_idx), |origin| origins.push(origin));
                    if origins.is_empty() {
                        // With no links the socket's own literal fills the
                        // one cell.
                        origins.push(SockRef::Input(node.in_ref(input_idx)));
                    }
                    InputValue::Multi(MultiInput {
                        values: vec![None; origins.len()],
                        origins,
                        provided_value_count: 0,
                    })
                } else {
                    InputValue::Single(None)
                };
                InputState {
                    data_type: socket.data_type.clone(),
                    value,
                    usage: ValueUsage::Maybe,
                    ready_for_execution: false,
                    force_compute: false,
                }
            })
            .collect();

        let outputs = node
            .outputs
            .iter()
            .enumerate()
            .map(|(output_idx, socket)| {
                let mut output_state = OutputState {
                    has_been_computed: false,
                    usage: ValueUsage::Maybe,
                    usage_for_execution: ValueUsage::Maybe,
                    potential_users: 0,
                };
                if !socket.available || socket.data_type.is_none() {
                    output_state.usage = ValueUsage::Unused;
                    return output_state;
                }
                self.graph
                    .for_each_target(node.out_ref(output_idx), |target, _path| {
                        if reachable.contains(&target.node) {
                            output_state.potential_users += 1;
                        }
                    });
                if output_state.potential_users == 0 {
                    // Might still become required again through a
                    // force-compute socket when scheduling starts.
                    output_state.usage = ValueUsage::Unused;
                }
                output_state
            })
            .collect();

        NodeState::new(inputs, outputs)
    }

    fn forward_group_inputs(&self, input_values: Vec<(OutRef, Value)>, ctx: &TaskCtx<'_, '_>) {
        for (socket, value) in input_values {
            if !self.node_states.contains_key(&socket.node) {
                // The socket feeds nothing that is being computed.
                self.log_value(&[SockRef::Output(socket)], &value);
                continue;
            }
            self.forward_output(socket, value, ctx, None);
        }
    }

    fn schedule_initial_nodes(&self, ctx: &TaskCtx<'_, '_>) {
        for socket in &self.requested_sockets {
            let state = self.state(socket.node);
            self.with_locked_node(socket.node, state, ctx, None, |ln| {
                // Requiring the input schedules any linked producer.
                self.set_input_required(ln, *socket);
            });
        }
        for socket in &self.force_compute_sockets {
            let node_id = socket.node();
            let state = self.state(node_id);
            self.with_locked_node(node_id, state, ctx, None, |ln| match socket {
                SockRef::Input(input) => {
                    if !self.set_input_required(ln, *input) {
                        // Satisfied synchronously; run the node once anyway
                        // so the forced slot is snapshotted and the node can
                        // finish.
                        self.schedule_node(ln);
                    }
                }
                SockRef::Output(output) => {
                    // Forced even without downstream users.
                    ln.sync.outputs[output.output_idx].usage = ValueUsage::Required;
                    self.schedule_node(ln);
                }
            });
        }
    }

    fn extract_requested_values(&self) -> Vec<ComputedValue> {
        self.requested_sockets
            .iter()
            .map(|socket| {
                let state = self.state(socket.node);
                let mut sync = state.sync.lock();
                let input_state = &mut sync.inputs[socket.input_idx];
                let data_type = input_state
                    .data_type
                    .clone()
                    .expect("Requested socket has no data type");
                let value = match &mut input_state.value {
                    InputValue::Single(value) => value
                        .take()
                        .expect("Requested socket value was never computed"),
                    InputValue::Multi(_) => {
                        panic!("Requested socket must not be a multi-input")
                    }
                };
                ComputedValue { data_type, value }
            })
            .collect()
    }

    fn destruct_node_states(&mut self) {
        let states: Vec<NodeState> = self
            .node_states
            .drain()
            .map(|(_node_id, state)| state)
            .collect();
        parallel::par_for_each(states, drop);
    }

    pub(crate) fn add_node_to_task_pool(&self, ctx: &TaskCtx<'_, '_>, node_id: NodeId) {
        let compute = ctx.compute;
        ctx.scope.spawn(move |scope| {
            compute.node_task(node_id, &TaskCtx { compute, scope });
        });
    }

    pub(crate) fn node(&self, node_id: NodeId) -> &Node {
        let index = *self
            .node_idx_by_id
            .get(&node_id)
            .unwrap_or_else(|| panic!("Unknown node {}", node_id));
        &self.graph.nodes[index]
    }

    pub(crate) fn state(&self, node_id: NodeId) -> &NodeState {
        self.node_states
            .get(&node_id)
            .unwrap_or_else(|| panic!("No state for node {}", node_id))
    }

    pub(crate) fn has_state(&self, node_id: NodeId) -> bool {
        self.node_states.contains_key(&node_id)
    }

    pub(crate) fn node_supports_laziness(&self, node: &Node) -> bool {
        node.kind == NodeKind::Function
            && self
                .func_lib
                .func_by_id(node.func_id)
                .is_some_and(|func| func.lazy)
    }

    pub(crate) fn log_value(&self, sockets: &[SockRef], value: &Value) {
        if let Some(logger) = self.logger {
            logger.log_socket_value(sockets, value);
        }
    }

    pub(crate) fn log_multi_input(&self, socket: InRef, multi: &MultiInput) {
        if let Some(logger) = self.logger {
            logger.log_multi_input(socket, &multi.provided_values());
        }
    }

    pub(crate) fn log_execution_time(&self, node_id: NodeId, duration: std::time::Duration) {
        if let Some(logger) = self.logger {
            logger.log_execution_time(node_id, duration);
        }
    }

    pub(crate) fn log_recovery(&self, node_id: Option<NodeId>, message: &str) {
        tracing::debug!(node = ?node_id, message, "recovered");
        if let Some(logger) = self.logger {
            logger.log_debug_message(node_id, message);
        }
    }
}

fn validate_compute_params(params: &ComputeParams<'_>) {
    if !is_debug() {
        return;
    }

    params
        .graph
        .validate()
        .expect("Graph failed validation before compute");

    for socket in &params.requested_sockets {
        let node = params
            .graph
            .node_by_id(socket.node)
            .expect("Requested socket references missing node");
        // An executing node destroys its input values when it finishes, so
        // only sockets of group-output nodes can be extracted afterwards.
        assert_eq!(
            node.kind,
            NodeKind::GroupOutput,
            "Requested sockets must sit on group-output nodes"
        );
        let input = &node.inputs[socket.input_idx];
        assert!(input.available, "Requested socket must be available");
        assert!(!input.multi, "Requested socket must be a single-input");
        assert!(
            input.data_type.is_some(),
            "Requested socket must carry data"
        );
    }

    for (socket, _value) in &params.input_values {
        let node = params
            .graph
            .node_by_id(socket.node)
            .expect("Input value references missing node");
        assert_eq!(
            node.kind,
            NodeKind::GroupInput,
            "Input values can only be injected at group-input outputs"
        );
        assert!(socket.output_idx < node.outputs.len());
    }
}
