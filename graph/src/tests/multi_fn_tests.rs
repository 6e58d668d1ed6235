use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::compute::{compute, ComputeParams};
use crate::data::{DataType, StaticValue, Value};
use crate::field::{Field, MultiFn};
use crate::function::{Func, FuncId, FuncLib};
use crate::graph::{Graph, Node};

use super::{int_in, int_out};

struct AddOne {
    calls: Arc<AtomicUsize>,
}

impl MultiFn for AddOne {
    fn name(&self) -> &str {
        "add_one"
    }
    fn call(&self, inputs: &[Value], outputs: &mut [Value]) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        outputs[0] = Value::Int(inputs[0].as_int() + 1);
    }
}

struct TimesTwo {
    calls: Arc<AtomicUsize>,
}

impl MultiFn for TimesTwo {
    fn name(&self) -> &str {
        "times_two"
    }
    fn call(&self, inputs: &[Value], outputs: &mut [Value]) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        outputs[0] = Value::Int(inputs[0].as_int() * 2);
    }
}

struct Sum;

impl MultiFn for Sum {
    fn name(&self) -> &str {
        "sum"
    }
    fn call(&self, inputs: &[Value], outputs: &mut [Value]) {
        outputs[0] = Value::Int(inputs[0].as_int() + inputs[1].as_int());
    }
}

struct NegateFloat;

impl MultiFn for NegateFloat {
    fn name(&self) -> &str {
        "negate"
    }
    fn call(&self, inputs: &[Value], outputs: &mut [Value]) {
        outputs[0] = Value::Float(-inputs[0].as_float());
    }
}

fn unary_mf_func(name: &str, multi_fn: impl MultiFn + 'static) -> Func {
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        lazy: false,
        inputs: vec![int_in("x")],
        outputs: vec![int_out("value")],
        ..Default::default()
    }
    .with_multi_fn(multi_fn)
}

/// seed -> add_one -> times_two -> group output.
fn mf_chain(
    add_calls: Arc<AtomicUsize>,
    times_calls: Arc<AtomicUsize>,
) -> (Graph, FuncLib, crate::graph::OutRef, crate::graph::InRef) {
    let func_add = unary_mf_func("add_one", AddOne { calls: add_calls });
    let func_times = unary_mf_func("times_two", TimesTwo { calls: times_calls });

    let gi = Node::group_input([("seed", DataType::Int)]);
    let add = Node::from_func(&func_add);
    let times = Node::from_func(&func_times);
    let go = Node::group_output([("result", DataType::Int)]);

    let mut graph = Graph::default();
    graph.connect(gi.out_ref(0), add.in_ref(0));
    graph.connect(add.out_ref(0), times.in_ref(0));
    graph.connect(times.out_ref(0), go.in_ref(0));
    let seed = gi.out_ref(0);
    let requested = go.in_ref(0);
    graph.add_node(gi);
    graph.add_node(add);
    graph.add_node(times);
    graph.add_node(go);

    (graph, FuncLib::from([func_add, func_times]), seed, requested)
}

#[test]
fn scalar_inputs_evaluate_eagerly() {
    let add_calls = Arc::new(AtomicUsize::new(0));
    let times_calls = Arc::new(AtomicUsize::new(0));
    let (graph, func_lib, seed, requested) = mf_chain(add_calls.clone(), times_calls.clone());

    let mut params = ComputeParams::new(&graph, &func_lib);
    params.requested_sockets.push(requested);
    params.input_values.push((seed, Value::Int(4)));
    let outputs = compute(params);

    assert_eq!(outputs[0].value, Value::Int(10));
    assert!(!outputs[0].value.is_field());
    assert_eq!(add_calls.load(Ordering::Relaxed), 1);
    assert_eq!(times_calls.load(Ordering::Relaxed), 1);
}

#[test]
fn field_input_lifts_the_whole_chain() {
    let add_calls = Arc::new(AtomicUsize::new(0));
    let times_calls = Arc::new(AtomicUsize::new(0));
    let (graph, func_lib, seed, requested) = mf_chain(add_calls.clone(), times_calls.clone());

    let mut params = ComputeParams::new(&graph, &func_lib);
    params.requested_sockets.push(requested);
    params
        .input_values
        .push((seed, Value::Field(Field::constant(Value::Int(4)))));
    let outputs = compute(params);

    // Nothing ran during evaluation; the result is a deferred expression.
    assert!(outputs[0].value.is_field());
    assert_eq!(add_calls.load(Ordering::Relaxed), 0);
    assert_eq!(times_calls.load(Ordering::Relaxed), 0);

    let result = outputs[0].value.as_field().evaluate();
    assert_eq!(result, Value::Int(10));
    assert_eq!(add_calls.load(Ordering::Relaxed), 1);
    assert_eq!(times_calls.load(Ordering::Relaxed), 1);
}

#[test]
fn mixed_scalar_and_field_inputs_lift() {
    let func_sum = Func {
        id: FuncId::unique(),
        name: "sum".to_string(),
        lazy: false,
        inputs: vec![int_in("a"), int_in("b")],
        outputs: vec![int_out("value")],
        ..Default::default()
    }
    .with_multi_fn(Sum);

    let gi = Node::group_input([("field_seed", DataType::Int)]);
    let mut sum = Node::from_func(&func_sum);
    sum.inputs[1].const_value = Some(StaticValue::Int(10));
    let go = Node::group_output([("result", DataType::Int)]);

    let mut graph = Graph::default();
    graph.connect(gi.out_ref(0), sum.in_ref(0));
    graph.connect(sum.out_ref(0), go.in_ref(0));
    let seed = gi.out_ref(0);
    let requested = go.in_ref(0);
    graph.add_node(gi);
    graph.add_node(sum);
    graph.add_node(go);

    let func_lib = FuncLib::from([func_sum]);

    let mut params = ComputeParams::new(&graph, &func_lib);
    params.requested_sockets.push(requested);
    params
        .input_values
        .push((seed, Value::Field(Field::constant(Value::Int(7)))));
    let outputs = compute(params);

    assert!(outputs[0].value.is_field());
    assert_eq!(outputs[0].value.as_field().evaluate(), Value::Int(17));
}

#[test]
fn field_conversion_between_base_types_is_lifted() {
    let func_add = unary_mf_func(
        "add_one",
        AddOne {
            calls: Arc::new(AtomicUsize::new(0)),
        },
    );
    let func_negate = Func {
        id: FuncId::unique(),
        name: "negate".to_string(),
        lazy: false,
        inputs: vec![crate::function::InputInfo {
            name: "x".to_string(),
            data_type: Some(DataType::Float),
            multi: false,
            default_value: None,
        }],
        outputs: vec![crate::function::OutputInfo {
            name: "value".to_string(),
            data_type: Some(DataType::Float),
        }],
        ..Default::default()
    }
    .with_multi_fn(NegateFloat);

    let gi = Node::group_input([("seed", DataType::Int)]);
    let add = Node::from_func(&func_add);
    let negate = Node::from_func(&func_negate);
    let go = Node::group_output([("result", DataType::Float)]);

    let mut graph = Graph::default();
    graph.connect(gi.out_ref(0), add.in_ref(0));
    // Int output feeding a Float input: the conversion is lifted over the
    // field.
    graph.connect(add.out_ref(0), negate.in_ref(0));
    graph.connect(negate.out_ref(0), go.in_ref(0));
    let seed = gi.out_ref(0);
    let requested = go.in_ref(0);
    graph.add_node(gi);
    graph.add_node(add);
    graph.add_node(negate);
    graph.add_node(go);

    let func_lib = FuncLib::from([func_add, func_negate]);

    let mut params = ComputeParams::new(&graph, &func_lib);
    params.requested_sockets.push(requested);
    params
        .input_values
        .push((seed, Value::Field(Field::constant(Value::Int(4)))));
    let outputs = compute(params);

    assert!(outputs[0].value.is_field());
    let field = outputs[0].value.as_field();
    assert_eq!(*field.base(), DataType::Float);
    assert_eq!(field.evaluate(), Value::Float(-5.0));
}
