//! Task units and the task registry.
//!
//! A task crosses the process boundary as a stable name plus a JSON argument
//! payload. The parent process and every worker build the same
//! [`TaskRegistry`], so the name resolves to the same function on both sides.

use std::collections::HashMap;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Keyword arguments applied uniformly to every unit of a batch.
pub type Kwargs = Map<String, Value>;

type TaskFn = dyn Fn(Value, &Kwargs) -> std::result::Result<Value, TaskFailure> + Send + Sync;

/// Failure produced by a registered function, before an index is attached.
enum TaskFailure {
    Arguments(String),
    Failed(String),
    Encode(String),
}

/// One invocation of a task: name, positional arguments and keyword arguments.
///
/// Units are immutable once built; executors move them into a worker or call
/// them in-process and never touch them again.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUnit {
    /// Position of the unit in its batch.
    pub index: usize,
    /// Registered task name.
    pub task: Arc<str>,
    /// Positional arguments, always a JSON array.
    pub args: Value,
    /// Keyword arguments shared by the whole batch.
    pub kwargs: Arc<Kwargs>,
}

impl TaskUnit {
    /// Build a unit from any serializable argument tuple.
    pub fn new(
        index: usize,
        task: Arc<str>,
        args: &impl Serialize,
        kwargs: Arc<Kwargs>,
    ) -> Result<Self> {
        Ok(Self {
            index,
            task,
            args: encode_args(args)?,
            kwargs,
        })
    }
}

/// Encode positional arguments. They must serialize to a JSON array, which
/// tuples such as `(3,)` or `(1, "a")` do.
pub fn encode_args(args: &impl Serialize) -> Result<Value> {
    let value = serde_json::to_value(args)
        .map_err(|e| Error::InvalidArguments(format!("failed to encode arguments: {}", e)))?;
    match value {
        Value::Array(_) => Ok(value),
        other => Err(Error::InvalidArguments(format!(
            "positional arguments must encode as an array (use a tuple), got {}",
            other
        ))),
    }
}

/// Encode keyword arguments. They must serialize to a JSON object.
pub fn encode_kwargs(kwargs: &impl Serialize) -> Result<Kwargs> {
    match serde_json::to_value(kwargs) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::InvalidArguments(format!(
            "keyword arguments must encode as an object, got {}",
            other
        ))),
        Err(e) => Err(Error::InvalidArguments(format!(
            "failed to encode keyword arguments: {}",
            e
        ))),
    }
}

/// Named task functions callable from any process that builds the same registry.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<TaskFn>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an infallible function taking a positional argument tuple.
    pub fn register<A, R, F>(&mut self, name: &str, func: F) -> &mut Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        self.register_fallible(name, move |args: A| {
            Ok::<R, std::convert::Infallible>(func(args))
        })
    }

    /// Register a function that can fail; its error is reported as a task error.
    pub fn register_fallible<A, R, E, F>(&mut self, name: &str, func: F) -> &mut Self
    where
        A: DeserializeOwned,
        R: Serialize,
        E: Display,
        F: Fn(A) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let task_name = name.to_string();
        let wrapped = move |args: Value, kwargs: &Kwargs| {
            if !kwargs.is_empty() {
                return Err(TaskFailure::Arguments(format!(
                    "task '{}' does not accept keyword arguments",
                    task_name
                )));
            }
            let args: A = decode(&task_name, args)?;
            let output = func(args).map_err(|e| TaskFailure::Failed(e.to_string()))?;
            serde_json::to_value(output).map_err(|e| TaskFailure::Encode(e.to_string()))
        };
        self.tasks.insert(name.to_string(), Arc::new(wrapped));
        self
    }

    /// Register a function that also receives the batch keyword arguments.
    ///
    /// `K` is deserialized from the keyword object, so a struct with
    /// `#[serde(default)]` fields works for optional keywords.
    pub fn register_with_kwargs<A, K, R, E, F>(&mut self, name: &str, func: F) -> &mut Self
    where
        A: DeserializeOwned,
        K: DeserializeOwned,
        R: Serialize,
        E: Display,
        F: Fn(A, K) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let task_name = name.to_string();
        let wrapped = move |args: Value, kwargs: &Kwargs| {
            let args: A = decode(&task_name, args)?;
            let kwargs: K = decode(&task_name, Value::Object(kwargs.clone()))?;
            let output = func(args, kwargs).map_err(|e| TaskFailure::Failed(e.to_string()))?;
            serde_json::to_value(output).map_err(|e| TaskFailure::Encode(e.to_string()))
        };
        self.tasks.insert(name.to_string(), Arc::new(wrapped));
        self
    }

    /// Check whether a task is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Fail with [`Error::UnknownTask`] unless `name` is registered.
    pub fn require(&self, name: &str) -> Result<()> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(Error::UnknownTask(name.to_string()))
        }
    }

    /// Run a unit in the current process.
    pub fn call(&self, unit: &TaskUnit) -> Result<Value> {
        self.call_raw(&unit.task, unit.args.clone(), &unit.kwargs, unit.index)
    }

    /// Run a task by name. Panics inside the task are caught and reported as
    /// [`Error::TaskPanicked`].
    pub fn call_raw(
        &self,
        task: &str,
        args: Value,
        kwargs: &Kwargs,
        index: usize,
    ) -> Result<Value> {
        let func = self
            .tasks
            .get(task)
            .ok_or_else(|| Error::UnknownTask(task.to_string()))?;

        match panic::catch_unwind(AssertUnwindSafe(|| func(args, kwargs))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(TaskFailure::Arguments(message))) => Err(Error::InvalidArguments(message)),
            Ok(Err(TaskFailure::Failed(message))) => Err(Error::Task { index, message }),
            Ok(Err(TaskFailure::Encode(message))) => Err(Error::Serialization(format!(
                "task '{}' returned an unencodable value: {}",
                task, message
            ))),
            Err(payload) => Err(Error::TaskPanicked {
                index,
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

fn decode<T: DeserializeOwned>(task: &str, value: Value) -> std::result::Result<T, TaskFailure> {
    serde_json::from_value(value).map_err(|e| {
        TaskFailure::Arguments(format!("arguments do not match task '{}': {}", task, e))
    })
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn registry() -> TaskRegistry {
        #[derive(Deserialize)]
        struct Scale {
            #[serde(default = "one")]
            factor: i64,
        }
        fn one() -> i64 {
            1
        }

        let mut registry = TaskRegistry::new();
        registry
            .register("square", |(x,): (i64,)| x * x)
            .register_fallible("checked_div", |(a, b): (i64, i64)| {
                a.checked_div(b).ok_or("division by zero")
            })
            .register_with_kwargs("scale", |(x,): (i64,), kw: Scale| {
                Ok::<_, String>(x * kw.factor)
            })
            .register("explode", |(_,): (i64,)| -> i64 { panic!("kaboom") });
        registry
    }

    fn unit(task: &str, args: Value) -> TaskUnit {
        TaskUnit {
            index: 4,
            task: Arc::from(task),
            args,
            kwargs: Arc::new(Kwargs::new()),
        }
    }

    #[test]
    fn test_call_registered_task() {
        let registry = registry();
        let value = registry.call(&unit("square", json!([7]))).unwrap();
        assert_eq!(value, json!(49));
    }

    #[test]
    fn test_task_error_carries_index() {
        let registry = registry();
        let err = registry.call(&unit("checked_div", json!([1, 0]))).unwrap_err();
        match err {
            Error::Task { index, message } => {
                assert_eq!(index, 4);
                assert_eq!(message, "division by zero");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_panic_is_caught() {
        let registry = registry();
        let err = registry.call(&unit("explode", json!([1]))).unwrap_err();
        match err {
            Error::TaskPanicked { index, message } => {
                assert_eq!(index, 4);
                assert!(message.contains("kaboom"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_kwargs() {
        let registry = registry();
        let kwargs = encode_kwargs(&json!({ "factor": 3 })).unwrap();
        let value = registry.call_raw("scale", json!([5]), &kwargs, 0).unwrap();
        assert_eq!(value, json!(15));

        let value = registry.call_raw("scale", json!([5]), &Kwargs::new(), 0).unwrap();
        assert_eq!(value, json!(5));

        let err = registry.call_raw("square", json!([5]), &kwargs, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArguments(_)));
    }

    #[test]
    fn test_unknown_task_and_bad_arguments() {
        let registry = registry();
        assert!(matches!(
            registry.call(&unit("missing", json!([]))),
            Err(Error::UnknownTask(_))
        ));
        assert!(matches!(
            registry.call(&unit("square", json!(["seven"]))),
            Err(Error::InvalidArguments(_))
        ));
        assert!(registry.require("square").is_ok());
        assert!(registry.require("missing").is_err());
    }

    #[test]
    fn test_encode_args_requires_array() {
        assert_eq!(encode_args(&(1, "a")).unwrap(), json!([1, "a"]));
        assert!(matches!(encode_args(&5), Err(Error::InvalidArguments(_))));
        assert!(matches!(encode_kwargs(&(1,)), Err(Error::InvalidArguments(_))));
    }

    #[test]
    fn test_names_sorted() {
        let registry = registry();
        assert_eq!(registry.names(), vec!["checked_div", "explode", "scale", "square"]);
    }
}
