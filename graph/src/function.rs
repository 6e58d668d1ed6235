use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use hashbrown::hash_map::Entry;
use serde::{Deserialize, Serialize};

use common::id_type;

use crate::data::{DataType, StaticValue, Value};
use crate::field::MultiFn;
use crate::graph::NodeId;

id_type!(FuncId);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputInfo {
    pub name: String,
    /// `None` marks a control-only socket that carries no data.
    pub data_type: Option<DataType>,
    #[serde(default)]
    pub multi: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<StaticValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputInfo {
    pub name: String,
    pub data_type: Option<DataType>,
}

/// The surface a node callback executes against. Implemented by the compute
/// core; all sockets are addressed by index.
///
/// `extract_*` take ownership of input values and may be called once per
/// value. The `lazy_*` methods are only meaningful on funcs with
/// `lazy == true`; a lazy callback may return without producing outputs
/// after requesting more inputs via [`ExecCtx::lazy_require_input`].
pub trait ExecCtx {
    fn node_id(&self) -> NodeId;

    fn can_get_input(&self, input_idx: usize) -> bool;
    fn get_input(&self, input_idx: usize) -> Value;
    fn extract_input(&mut self, input_idx: usize) -> Value;
    fn extract_multi_input(&mut self, input_idx: usize) -> Vec<Value>;
    fn set_input_unused(&mut self, input_idx: usize);

    fn output_is_required(&self, output_idx: usize) -> bool;
    fn set_output(&mut self, output_idx: usize, value: Value);

    /// Request an input that was not available for this run. Returns true
    /// when the node will be re-scheduled once the value arrives; the
    /// callback should then yield.
    fn lazy_require_input(&mut self, input_idx: usize) -> bool;
    fn lazy_output_is_required(&self, output_idx: usize) -> bool;

    /// Forward default values for every output that is still expected but
    /// was not produced by the callback.
    fn set_default_remaining_outputs(&mut self);
}

pub type Callback = dyn Fn(&mut dyn ExecCtx) + Send + Sync;

/// How a func executes.
#[derive(Clone, Default)]
pub enum FuncExec {
    /// Arbitrary node callback with full access to the [`ExecCtx`] surface.
    Callback(Arc<Callback>),
    /// Pure columnar function, lifted over fields when any input is a field.
    MultiFn(Arc<dyn MultiFn>),
    /// No implementation; outputs are filled with defaults.
    #[default]
    Unknown,
}

#[derive(Clone, Default, Debug)]
pub struct Func {
    pub id: FuncId,
    pub name: String,
    /// Lazy funcs decide at run time which inputs they need and may execute
    /// multiple times; non-lazy funcs require all data inputs up front and
    /// execute at most once.
    pub lazy: bool,
    pub inputs: Vec<InputInfo>,
    pub outputs: Vec<OutputInfo>,
    pub exec: FuncExec,
}

#[derive(Default, Debug)]
pub struct FuncLib {
    funcs: hashbrown::HashMap<FuncId, Func>,
}

impl Func {
    pub fn with_callback<F>(mut self, callback: F) -> Func
    where
        F: Fn(&mut dyn ExecCtx) + Send + Sync + 'static,
    {
        self.exec = FuncExec::Callback(Arc::new(callback));
        self
    }

    pub fn with_multi_fn<F>(mut self, func: F) -> Func
    where
        F: MultiFn + 'static,
    {
        self.exec = FuncExec::MultiFn(Arc::new(func));
        self
    }
}

impl FuncLib {
    pub fn func_by_id(&self, id: FuncId) -> Option<&Func> {
        self.funcs.get(&id)
    }
    pub fn func_by_id_mut(&mut self, id: FuncId) -> Option<&mut Func> {
        self.funcs.get_mut(&id)
    }
    pub fn func_by_name(&self, name: &str) -> Option<&Func> {
        self.funcs.values().find(|func| func.name == name)
    }

    pub fn add(&mut self, func: Func) {
        match self.funcs.entry(func.id) {
            Entry::Occupied(_) => {
                panic!("Func {}:{} already exists", func.id, func.name);
            }
            Entry::Vacant(entry) => {
                entry.insert(func);
            }
        }
    }

    pub fn merge(&mut self, other: FuncLib) {
        for (_id, func) in other.funcs {
            self.add(func);
        }
    }

    pub fn iter(&self) -> hashbrown::hash_map::Iter<'_, FuncId, Func> {
        self.funcs.iter()
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

impl<It> From<It> for FuncLib
where
    It: IntoIterator<Item = Func>,
{
    fn from(iter: It) -> Self {
        let mut func_lib = FuncLib::default();
        for func in iter {
            func_lib.add(func);
        }
        func_lib
    }
}

impl Debug for FuncExec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FuncExec::Callback(_) => write!(f, "Callback"),
            FuncExec::MultiFn(func) => write!(f, "MultiFn({})", func.name()),
            FuncExec::Unknown => write!(f, "Unknown"),
        }
    }
}
