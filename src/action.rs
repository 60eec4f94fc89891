//! Actions: named units of work with explicitly declared inputs and outputs

use crate::error::ActionError;
use crate::value::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A unit of work.
///
/// Inputs and outputs are declared up front; the executor hashes the inputs,
/// binds the outputs to their cache entry and only then calls
/// [`Action::execute`]. Outputs must be created through
/// `Dispatcher::output_file` / `Dispatcher::output_dir`.
pub trait Action: Send + Sync {
    fn inputs(&self) -> Vec<Value>;

    fn outputs(&self) -> Vec<Value>;

    fn execute(&self) -> Result<(), ActionError>;
}

type ExecuteFn = dyn Fn(&[Value], &[Value]) -> Result<(), ActionError> + Send + Sync;

/// An action assembled from value lists and a closure.
///
/// The closure receives the declared inputs and outputs in order.
pub struct FnAction {
    inputs: Vec<Value>,
    outputs: Vec<Value>,
    run: Box<ExecuteFn>,
}

impl FnAction {
    pub fn new<F>(inputs: Vec<Value>, outputs: Vec<Value>, run: F) -> Self
    where
        F: Fn(&[Value], &[Value]) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        Self {
            inputs,
            outputs,
            run: Box::new(run),
        }
    }

    /// First declared output, the common case for single-output steps
    pub fn output(&self) -> Option<&Value> {
        self.outputs.first()
    }
}

impl fmt::Debug for FnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAction")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl Action for FnAction {
    fn inputs(&self) -> Vec<Value> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<Value> {
        self.outputs.clone()
    }

    fn execute(&self) -> Result<(), ActionError> {
        (self.run)(&self.inputs, &self.outputs)
    }
}

/// A registered action together with the value lists captured at registration
pub struct Registration {
    pub name: String,
    pub inputs: Vec<Value>,
    pub outputs: Vec<Value>,
    pub(crate) action: Arc<dyn Action>,
    pub(crate) any: Arc<dyn Any + Send + Sync>,
}

impl Registration {
    pub(crate) fn new<T: Action + 'static>(name: String, action: Arc<T>) -> Self {
        Self {
            name,
            inputs: action.inputs(),
            outputs: action.outputs(),
            action: action.clone(),
            any: action,
        }
    }

    pub fn produces(&self, value: &Value) -> bool {
        self.outputs.contains(value)
    }

    pub(crate) fn execute(&self) -> Result<(), ActionError> {
        self.action.execute()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}
