pub mod compute;
pub mod data;
pub mod field;
pub mod function;
pub mod graph;
pub mod logger;

#[cfg(test)]
mod tests;

pub mod prelude {
    pub use crate::compute::{compute, ComputeParams, ComputeSettings, ComputedValue};
    pub use crate::data::{DataType, StaticValue, Value};
    pub use crate::field::{Field, FieldOperation, MultiFn};
    pub use crate::function::{ExecCtx, Func, FuncExec, FuncId, FuncLib, InputInfo, OutputInfo};
    pub use crate::graph::{
        Graph, GraphError, InRef, Link, Node, NodeId, NodeKind, OutRef, Passthrough, SockRef,
    };
    pub use crate::logger::{CaptureLogger, EvalLogger, LogEvent, TracingLogger};
}
