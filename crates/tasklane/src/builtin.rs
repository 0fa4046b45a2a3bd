//! Built-in task library.
//!
//! The `tasklane` CLI and the `tasklane-worker` binary both build their
//! registry from [`registry`], so every task listed here can run on either
//! side of the pipe.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tasklane_core::{TaskRegistry, in_worker_process};

/// Exit status of a worker killed by `exit_in_worker`.
pub const WORKER_EXIT_CODE: i32 = 3;

/// Keyword arguments of `scale`.
#[derive(Debug, Deserialize)]
struct ScaleKwargs {
    #[serde(default = "default_factor")]
    factor: f64,
}

fn default_factor() -> f64 {
    1.0
}

/// Registry holding every built-in task.
pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register("square", |(x,): (i64,)| x * x)
        .register("add", |(a, b): (i64, i64)| a + b)
        .register("is_prime", |(n,): (u64,)| is_prime(n))
        .register("sleep_ms", |(ms,): (u64,)| {
            std::thread::sleep(Duration::from_millis(ms));
            ms
        })
        .register_with_kwargs("scale", |(x,): (f64,), kwargs: ScaleKwargs| {
            Ok::<_, String>(x * kwargs.factor)
        })
        .register_fallible("fail_on", |(x, bad): (i64, i64)| {
            if x == bad {
                Err(format!("refusing to process {}", x))
            } else {
                Ok(x)
            }
        })
        .register("exit_in_worker", |(x,): (i64,)| {
            if in_worker_process() {
                std::process::exit(WORKER_EXIT_CODE);
            }
            x
        })
        .register_fallible("write_file", |(path, contents, delay_ms): (String, String, u64)| {
            std::thread::sleep(Duration::from_millis(delay_ms));
            std::fs::write(&path, contents.as_bytes())
                .map(|_| contents.len())
                .map_err(|e| format!("could not write {}: {}", path, e))
        });
    registry
}

/// Arguments the CLI feeds to task `name` for input `i`.
///
/// `None` for tasks that need arguments the CLI cannot invent.
pub fn sample_args(name: &str, i: u64, fail_on: i64) -> Option<Value> {
    let i_signed = i as i64;
    let args = match name {
        "square" | "exit_in_worker" => json!([i_signed]),
        "add" => json!([i_signed, i_signed]),
        "is_prime" | "sleep_ms" => json!([i]),
        "scale" => json!([i as f64]),
        "fail_on" => json!([i_signed, fail_on]),
        _ => return None,
    };
    Some(args)
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut divisor = 3;
    while divisor * divisor <= n {
        if n % divisor == 0 {
            return false;
        }
        divisor += 2;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tasklane_core::{Error, Kwargs, TaskUnit};

    fn call(name: &str, args: Value, kwargs: Kwargs) -> tasklane_core::Result<Value> {
        let unit = TaskUnit::new(0, Arc::from(name), &args, Arc::new(kwargs))?;
        registry().call(&unit)
    }

    #[test]
    fn test_registry_names() {
        assert_eq!(
            registry().names(),
            vec![
                "add",
                "exit_in_worker",
                "fail_on",
                "is_prime",
                "scale",
                "sleep_ms",
                "square",
                "write_file"
            ]
        );
    }

    #[test]
    fn test_is_prime() {
        let primes: Vec<u64> = (0..30).filter(|&n| is_prime(n)).collect();
        assert_eq!(primes, vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
    }

    #[test]
    fn test_scale_kwargs() {
        assert_eq!(call("scale", json!([2.0]), Kwargs::new()).unwrap(), json!(2.0));

        let mut kwargs = Kwargs::new();
        kwargs.insert("factor".to_string(), json!(2.5));
        assert_eq!(call("scale", json!([2.0]), kwargs).unwrap(), json!(5.0));
    }

    #[test]
    fn test_fail_on() {
        assert_eq!(call("fail_on", json!([1, 2]), Kwargs::new()).unwrap(), json!(1));
        let err = call("fail_on", json!([2, 2]), Kwargs::new()).unwrap_err();
        assert!(matches!(err, Error::Task { .. }));
    }

    #[test]
    fn test_exit_in_worker_is_identity_in_parent() {
        assert_eq!(call("exit_in_worker", json!([7]), Kwargs::new()).unwrap(), json!(7));
    }

    #[test]
    fn test_write_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("out.txt");
        let args = json!([path.to_string_lossy(), "hello", 0]);
        assert_eq!(call("write_file", args, Kwargs::new()).unwrap(), json!(5));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn test_sample_args() {
        assert_eq!(sample_args("add", 3, 0), Some(json!([3, 3])));
        assert_eq!(sample_args("fail_on", 1, 4), Some(json!([1, 4])));
        assert_eq!(sample_args("write_file", 1, 0), None);
    }
}
