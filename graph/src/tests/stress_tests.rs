use common::log_setup;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::compute::{compute, ComputeParams, ComputeSettings, ComputedValue};
use crate::data::{DataType, StaticValue, Value};
use crate::field::MultiFn;
use crate::function::{ExecCtx, Func, FuncId, FuncLib};
use crate::graph::{Graph, InRef, Node, OutRef};

use super::{concat_func, count, int_in, int_out, new_counter, unary_int_func};

struct BinOp {
    name: &'static str,
    op: fn(i64, i64) -> i64,
}

impl MultiFn for BinOp {
    fn name(&self) -> &str {
        self.name
    }
    fn call(&self, inputs: &[Value], outputs: &mut [Value]) {
        outputs[0] = Value::Int((self.op)(inputs[0].as_int(), inputs[1].as_int()));
    }
}

fn wide_fan_graph(width: usize) -> (Graph, FuncLib, InRef) {
    let mut func_lib = FuncLib::default();
    let mut graph = Graph::default();

    let func_src = unary_int_func("source", new_counter(), |x| x);
    let mut src = Node::from_func(&func_src);
    src.inputs[0].const_value = Some(StaticValue::Int(100));
    let src_out = src.out_ref(0);
    graph.add_node(src);
    func_lib.add(func_src);

    let func_collect = concat_func("collect", new_counter());
    let collect = Node::from_func(&func_collect);
    let collect_in = collect.in_ref(0);
    let collect_out = collect.out_ref(0);

    for i in 0..width {
        let offset = i as i64;
        let func = unary_int_func(&format!("consumer_{}", i), new_counter(), move |x| x + offset);
        let node = Node::from_func(&func);
        graph.connect(src_out, node.in_ref(0));
        graph.connect(node.out_ref(0), collect_in);
        graph.add_node(node);
        func_lib.add(func);
    }

    let go = Node::group_output([("result", DataType::String)]);
    graph.connect(collect_out, go.in_ref(0));
    let requested = go.in_ref(0);
    graph.add_node(collect);
    graph.add_node(go);
    func_lib.add(func_collect);

    (graph, func_lib, requested)
}

#[test]
fn wide_fan_out_fills_multi_input_in_declared_order() {
    let width = 32;
    let (graph, func_lib, requested) = wide_fan_graph(width);

    let mut params = ComputeParams::new(&graph, &func_lib);
    params.requested_sockets.push(requested);
    let outputs = compute(params);

    let expected = (0..width as i64)
        .map(|i| (100 + i).to_string())
        .collect::<Vec<_>>()
        .join(",");
    assert_eq!(outputs[0].value, Value::String(expected));
}

#[test]
fn wide_fan_out_is_equivalent_without_chaining() {
    let width = 32;
    let (graph, func_lib, requested) = wide_fan_graph(width);

    let run = |chain_tasks: bool| {
        let mut params = ComputeParams::new(&graph, &func_lib);
        params.requested_sockets.push(requested);
        params.settings = ComputeSettings { chain_tasks };
        compute(params)
    };

    assert_eq!(run(true), run(false));
}

#[test]
fn deep_chain_runs_every_node_once() {
    let depth = 128;
    let mut func_lib = FuncLib::default();
    let mut graph = Graph::default();
    let mut counters = vec![];

    let mut prev_out: Option<OutRef> = None;
    for i in 0..depth {
        let runs = new_counter();
        counters.push(runs.clone());
        let func = unary_int_func(&format!("step_{}", i), runs, |x| x + 1);
        let mut node = Node::from_func(&func);
        if let Some(prev) = prev_out {
            graph.connect(prev, node.in_ref(0));
        } else {
            node.inputs[0].const_value = Some(StaticValue::Int(0));
        }
        prev_out = Some(node.out_ref(0));
        graph.add_node(node);
        func_lib.add(func);
    }

    let go = Node::group_output([("result", DataType::Int)]);
    graph.connect(prev_out.unwrap(), go.in_ref(0));
    let requested = go.in_ref(0);
    graph.add_node(go);

    let mut params = ComputeParams::new(&graph, &func_lib);
    params.requested_sockets.push(requested);
    let outputs = compute(params);

    assert_eq!(outputs[0].value, Value::Int(depth as i64));
    assert!(counters.iter().all(|counter| count(counter) == 1));
}

fn random_dag(seed: u64) -> (Graph, FuncLib, Vec<InRef>) {
    const LAYERS: usize = 5;
    const LAYER_WIDTH: usize = 8;
    const TERMINALS: usize = 8;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut func_lib = FuncLib::default();
    let mut graph = Graph::default();
    let mut produced: Vec<OutRef> = vec![];

    for layer in 0..LAYERS {
        let mut layer_outputs = vec![];
        for i in 0..LAYER_WIDTH {
            if layer == 0 {
                let literal: i64 = rng.gen_range(0..100);
                let func = Func {
                    id: FuncId::unique(),
                    name: format!("seed_{}", i),
                    lazy: false,
                    inputs: vec![],
                    outputs: vec![int_out("value")],
                    ..Default::default()
                }
                .with_callback(move |ctx: &mut dyn ExecCtx| {
                    ctx.set_output(0, Value::Int(literal));
                });
                let node = Node::from_func(&func);
                layer_outputs.push(node.out_ref(0));
                graph.add_node(node);
                func_lib.add(func);
            } else {
                let op = match rng.gen_range(0..3) {
                    0 => BinOp {
                        name: "add",
                        op: |a, b| a.wrapping_add(b),
                    },
                    1 => BinOp {
                        name: "mul",
                        op: |a, b| a.wrapping_mul(b),
                    },
                    _ => BinOp {
                        name: "sub",
                        op: |a, b| a.wrapping_sub(b),
                    },
                };
                let func = Func {
                    id: FuncId::unique(),
                    name: format!("op_{}_{}", layer, i),
                    lazy: false,
                    inputs: vec![int_in("a"), int_in("b")],
                    outputs: vec![int_out("value")],
                    ..Default::default()
                }
                .with_multi_fn(op);
                let node = Node::from_func(&func);
                let left = produced[rng.gen_range(0..produced.len())];
                let right = produced[rng.gen_range(0..produced.len())];
                graph.connect(left, node.in_ref(0));
                graph.connect(right, node.in_ref(1));
                layer_outputs.push(node.out_ref(0));
                graph.add_node(node);
                func_lib.add(func);
            }
        }
        produced.extend(layer_outputs);
    }

    let go = Node::group_output(
        (0..TERMINALS)
            .map(|_| ("result", DataType::Int))
            .collect::<Vec<_>>(),
    );
    let mut requested = vec![];
    for terminal_idx in 0..TERMINALS {
        let source = produced[rng.gen_range(0..produced.len())];
        graph.connect(source, go.in_ref(terminal_idx));
        requested.push(go.in_ref(terminal_idx));
    }
    graph.add_node(go);

    (graph, func_lib, requested)
}

#[test]
fn identical_runs_produce_identical_outputs() {
    log_setup::init_test_logging();

    let (graph, func_lib, requested) = random_dag(42);

    let run = || {
        let mut params = ComputeParams::new(&graph, &func_lib);
        params.requested_sockets = requested.clone();
        compute(params)
    };

    let first: Vec<ComputedValue> = run();
    let second: Vec<ComputedValue> = run();
    assert_eq!(first.len(), requested.len());
    assert_eq!(first, second);
}

#[test]
fn random_dags_are_chaining_invariant() {
    for seed in [7, 21, 1234] {
        let (graph, func_lib, requested) = random_dag(seed);

        let run = |chain_tasks: bool| {
            let mut params = ComputeParams::new(&graph, &func_lib);
            params.requested_sockets = requested.clone();
            params.settings = ComputeSettings { chain_tasks };
            compute(params)
        };

        assert_eq!(run(true), run(false));
    }
}
