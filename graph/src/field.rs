use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::data::{self, DataType, Value};

/// A pure columnar function. Implementations must be deterministic: the
/// evaluator may call them eagerly on single elements or defer them inside a
/// field expression.
pub trait MultiFn: Send + Sync {
    fn name(&self) -> &str;

    /// Evaluate one element. `inputs` holds one scalar per declared input,
    /// `outputs` one pre-initialized scalar per declared output.
    fn call(&self, inputs: &[Value], outputs: &mut [Value]);
}

/// A deferred multi-function application over field inputs. Shared by every
/// output field of the node that produced it.
pub struct FieldOperation {
    func: Arc<dyn MultiFn>,
    inputs: Vec<Field>,
    output_types: Vec<DataType>,
}

#[derive(Clone)]
enum FieldNode {
    Constant(Arc<Value>),
    Operation {
        operation: Arc<FieldOperation>,
        output_index: usize,
    },
}

/// A lazy value carrier: either a constant or one output of a deferred
/// [`FieldOperation`]. Cloning is cheap; the expression tree is shared.
#[derive(Clone)]
pub struct Field {
    base: DataType,
    node: FieldNode,
}

impl FieldOperation {
    pub fn new(func: Arc<dyn MultiFn>, inputs: Vec<Field>, output_types: Vec<DataType>) -> Self {
        Self {
            func,
            inputs,
            output_types,
        }
    }

    pub fn output_type(&self, output_index: usize) -> &DataType {
        &self.output_types[output_index]
    }

    pub fn inputs(&self) -> &[Field] {
        &self.inputs
    }
}

impl Field {
    pub fn constant(value: Value) -> Field {
        debug_assert!(!value.is_field(), "constant fields wrap scalars only");
        Field {
            base: value.data_type(),
            node: FieldNode::Constant(Arc::new(value)),
        }
    }

    pub fn operation(operation: Arc<FieldOperation>, output_index: usize) -> Field {
        let base = operation.output_type(output_index).clone();
        Field {
            base,
            node: FieldNode::Operation {
                operation,
                output_index,
            },
        }
    }

    pub fn base(&self) -> &DataType {
        &self.base
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.node, FieldNode::Constant(_))
    }

    /// Lift a scalar conversion over this field.
    pub fn convert(self, to: DataType) -> Field {
        let func = Arc::new(ConvertFn { to: to.clone() });
        let operation = Arc::new(FieldOperation::new(func, vec![self], vec![to]));
        Field::operation(operation, 0)
    }

    /// Collapse the expression to a single scalar.
    pub fn evaluate(&self) -> Value {
        match &self.node {
            FieldNode::Constant(value) => (**value).clone(),
            FieldNode::Operation {
                operation,
                output_index,
            } => {
                let inputs: Vec<Value> = operation.inputs.iter().map(Field::evaluate).collect();
                let mut outputs: Vec<Value> =
                    operation.output_types.iter().map(Value::from).collect();
                operation.func.call(&inputs, &mut outputs);
                outputs.swap_remove(*output_index)
            }
        }
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        if self.base != other.base {
            return false;
        }
        match (&self.node, &other.node) {
            (FieldNode::Constant(left), FieldNode::Constant(right)) => left == right,
            (
                FieldNode::Operation {
                    operation: left_op,
                    output_index: left_idx,
                },
                FieldNode::Operation {
                    operation: right_op,
                    output_index: right_idx,
                },
            ) => Arc::ptr_eq(left_op, right_op) && left_idx == right_idx,
            _ => false,
        }
    }
}

impl Debug for Field {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.node {
            FieldNode::Constant(value) => f
                .debug_struct("Field")
                .field("base", &self.base)
                .field("constant", value)
                .finish(),
            FieldNode::Operation {
                operation,
                output_index,
            } => f
                .debug_struct("Field")
                .field("base", &self.base)
                .field("operation", &operation.func.name())
                .field("output_index", output_index)
                .finish(),
        }
    }
}

impl Debug for FieldOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldOperation")
            .field("func", &self.func.name())
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.output_types)
            .finish()
    }
}

/// Scalar conversion lifted into a field operation. Unconvertible elements
/// collapse to the target default, matching eager conversion behavior.
struct ConvertFn {
    to: DataType,
}

impl MultiFn for ConvertFn {
    fn name(&self) -> &str {
        "convert"
    }

    fn call(&self, inputs: &[Value], outputs: &mut [Value]) {
        outputs[0] =
            data::try_convert(&inputs[0], &self.to).unwrap_or_else(|| Value::from(&self.to));
    }
}
