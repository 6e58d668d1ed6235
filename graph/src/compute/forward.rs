//! Routing of freshly produced values through the graph's fan-out.

use super::locked::LockedNode;
use super::state::{InputValue, ValueUsage};
use super::{Compute, NextNode, TaskCtx};
use crate::data::{self, DataType, Value};
use crate::graph::{InRef, NodeId, NodeKind, OutRef, SockRef};

impl Compute<'_> {
    /// Move a just-computed value from `from_socket` into every input that
    /// might need it. Takes ownership; the value is destroyed when no target
    /// survives. Conversions happen at path boundaries, copies are made
    /// before any consumer can observe the original.
    pub(crate) fn forward_output(
        &self,
        from_socket: OutRef,
        value_to_forward: Value,
        ctx: &TaskCtx<'_, '_>,
        run_state: Option<&mut NextNode>,
    ) {
        let mut run_state = run_state;
        let value_type = value_to_forward.data_type();

        let mut log_original_value_sockets: Vec<SockRef> = vec![SockRef::Output(from_socket)];
        let mut forward_original_value_sockets: Vec<InRef> = Vec::new();

        self.graph.for_each_target(from_socket, |to_socket, path| {
            if !self.should_forward_to_socket(to_socket) {
                return;
            }
            // `None` means the original value is still flowing along this
            // path; a conversion replaces it with an owned value.
            let mut current_value: Option<Value> = None;
            for (step, socket) in path.iter().enumerate() {
                let is_last_socket = step + 1 == path.len();
                let do_conversion_if_necessary = is_last_socket
                    || self.node(socket.node()).kind == NodeKind::GroupOutput;
                if do_conversion_if_necessary {
                    let next_type = self
                        .socket_data_type(*socket)
                        .expect("Forwarding path crossed a socket without data");
                    let current_type = current_value
                        .as_ref()
                        .map_or_else(|| value_type.clone(), Value::data_type);
                    if current_type != next_type {
                        let source = current_value.as_ref().unwrap_or(&value_to_forward);
                        current_value =
                            Some(self.convert_value(source, &next_type, Some(socket.node())));
                    }
                }
                match &current_value {
                    None => log_original_value_sockets.push(*socket),
                    Some(converted) => {
                        // Multi-inputs are logged once all values arrived.
                        if !self.is_multi_input_socket(*socket) {
                            self.log_value(&[*socket], converted);
                        }
                    }
                }
            }
            match current_value {
                None => forward_original_value_sockets.push(to_socket),
                Some(converted) => self.add_value_to_input_socket(
                    to_socket,
                    SockRef::Output(from_socket),
                    converted,
                    ctx,
                    run_state.as_deref_mut(),
                ),
            }
        });

        self.log_value(&log_original_value_sockets, &value_to_forward);
        self.forward_to_sockets_with_same_type(
            forward_original_value_sockets,
            value_to_forward,
            from_socket,
            ctx,
            run_state,
        );
    }

    fn should_forward_to_socket(&self, socket: InRef) -> bool {
        // A node without state is not being computed at all.
        if !self.has_state(socket.node) {
            return false;
        }
        let state = self.state(socket.node);
        let sync = state.sync.lock();
        // Never deliver into a slot whose value cannot be observed anymore.
        sync.inputs[socket.input_idx].usage != ValueUsage::Unused
    }

    fn forward_to_sockets_with_same_type(
        &self,
        to_sockets: Vec<InRef>,
        value_to_forward: Value,
        from_socket: OutRef,
        ctx: &TaskCtx<'_, '_>,
        mut run_state: Option<&mut NextNode>,
    ) {
        let origin = SockRef::Output(from_socket);
        match to_sockets.len() {
            0 => {
                // Nobody needs it; destroy it.
                drop(value_to_forward);
            }
            1 => {
                self.add_value_to_input_socket(
                    to_sockets[0],
                    origin,
                    value_to_forward,
                    ctx,
                    run_state,
                );
            }
            _ => {
                // Copy for all targets but one before the original moves, so
                // no consumer can start mutating it while copies are pending.
                for &to_socket in &to_sockets[1..] {
                    self.add_value_to_input_socket(
                        to_socket,
                        origin,
                        value_to_forward.clone(),
                        ctx,
                        run_state.as_deref_mut(),
                    );
                }
                self.add_value_to_input_socket(
                    to_sockets[0],
                    origin,
                    value_to_forward,
                    ctx,
                    run_state,
                );
            }
        }
    }

    /// Load the literal of a socket that no other node computes, converting
    /// it to the slot's declared type, and deposit it.
    pub(crate) fn load_unlinked_input_value(
        &self,
        locked_node: &mut LockedNode,
        input_socket: InRef,
        origin_socket: SockRef,
    ) {
        let SockRef::Input(origin_input) = origin_socket else {
            unreachable!("Literal origins are always input sockets");
        };
        let required_type = locked_node.sync.inputs[input_socket.input_idx]
            .data_type
            .clone()
            .expect("Literal load into untyped slot");
        let value = self.load_socket_value(origin_input, &required_type, locked_node.node_id);

        let input_state = &mut locked_node.sync.inputs[input_socket.input_idx];
        match &mut input_state.value {
            InputValue::Multi(multi) => {
                multi.add_value(origin_socket, value);
                if multi.all_values_available() {
                    self.log_multi_input(input_socket, multi);
                }
            }
            InputValue::Single(single) => {
                let mut sockets_to_log = vec![SockRef::Input(input_socket)];
                if origin_socket != SockRef::Input(input_socket) {
                    sockets_to_log.push(origin_socket);
                }
                self.log_value(&sockets_to_log, &value);
                *single = Some(value);
            }
        }
    }

    fn load_socket_value(
        &self,
        socket: InRef,
        required_type: &DataType,
        consumer: NodeId,
    ) -> Value {
        let node = self.node(socket.node);
        let input = &node.inputs[socket.input_idx];
        let socket_type = input.data_type.as_ref().unwrap_or(required_type);
        let value: Value = match &input.const_value {
            Some(literal) => literal.into(),
            None => Value::from(socket_type),
        };
        if value.data_type() == *required_type {
            value
        } else {
            self.convert_value(&value, required_type, Some(consumer))
        }
    }

    /// Convert with local recovery: an unconvertible pair degrades to the
    /// target default and is reported through the logger.
    pub(crate) fn convert_value(
        &self,
        value: &Value,
        to_type: &DataType,
        node_id: Option<NodeId>,
    ) -> Value {
        match data::try_convert(value, to_type) {
            Some(converted) => converted,
            None => {
                self.log_recovery(
                    node_id,
                    &format!(
                        "cannot convert {} to {}; using default value",
                        value.data_type(),
                        to_type
                    ),
                );
                Value::from(to_type)
            }
        }
    }

    fn socket_data_type(&self, socket: SockRef) -> Option<DataType> {
        let node = self.node(socket.node());
        match socket {
            SockRef::Input(input) => node.inputs[input.input_idx].data_type.clone(),
            SockRef::Output(output) => node.outputs[output.output_idx].data_type.clone(),
        }
    }

    fn is_multi_input_socket(&self, socket: SockRef) -> bool {
        match socket {
            SockRef::Input(input) => self.node(input.node).inputs[input.input_idx].multi,
            SockRef::Output(_) => false,
        }
    }
}
