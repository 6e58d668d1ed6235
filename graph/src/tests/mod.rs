mod multi_fn_tests;
mod stress_tests;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::data::{DataType, Value};
use crate::function::{ExecCtx, Func, FuncId, InputInfo, OutputInfo};

pub(crate) fn int_in(name: &str) -> InputInfo {
    InputInfo {
        name: name.to_string(),
        data_type: Some(DataType::Int),
        multi: false,
        default_value: None,
    }
}

pub(crate) fn int_multi_in(name: &str) -> InputInfo {
    InputInfo {
        name: name.to_string(),
        data_type: Some(DataType::Int),
        multi: true,
        default_value: None,
    }
}

pub(crate) fn int_out(name: &str) -> OutputInfo {
    OutputInfo {
        name: name.to_string(),
        data_type: Some(DataType::Int),
    }
}

pub(crate) fn string_in(name: &str) -> InputInfo {
    InputInfo {
        name: name.to_string(),
        data_type: Some(DataType::String),
        multi: false,
        default_value: None,
    }
}

pub(crate) fn string_out(name: &str) -> OutputInfo {
    OutputInfo {
        name: name.to_string(),
        data_type: Some(DataType::String),
    }
}

/// An eager func with one int input and one int output applying `f`, counting
/// executions in `runs`.
pub(crate) fn unary_int_func(
    name: &str,
    runs: Arc<AtomicUsize>,
    f: impl Fn(i64) -> i64 + Send + Sync + 'static,
) -> Func {
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        lazy: false,
        inputs: vec![int_in("x")],
        outputs: vec![int_out("value")],
        ..Default::default()
    }
    .with_callback(move |ctx: &mut dyn ExecCtx| {
        runs.fetch_add(1, Ordering::Relaxed);
        let x = ctx.extract_input(0).as_int();
        ctx.set_output(0, Value::Int(f(x)));
    })
}

/// An eager func joining its int multi-input into a comma-separated string.
pub(crate) fn concat_func(name: &str, runs: Arc<AtomicUsize>) -> Func {
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        lazy: false,
        inputs: vec![int_multi_in("values")],
        outputs: vec![string_out("joined")],
        ..Default::default()
    }
    .with_callback(move |ctx: &mut dyn ExecCtx| {
        runs.fetch_add(1, Ordering::Relaxed);
        let values = ctx.extract_multi_input(0);
        let joined = values
            .iter()
            .map(|value| value.as_int().to_string())
            .collect::<Vec<_>>()
            .join(",");
        ctx.set_output(0, Value::String(joined));
    })
}

pub(crate) fn new_counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

pub(crate) fn count(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::Relaxed)
}
