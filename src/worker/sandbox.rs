//! Evaluates one payload in an embedded `rhai` engine.
//!
//! The engine starts empty and is granted an explicit list of
//! [`Capability`] values. Module imports and `eval` are always off, and the
//! configured limits bound operations, nesting, and collection sizes.

use std::time::Instant;

use rhai::module_resolvers::DummyModuleResolver;
use rhai::packages::{Package, StandardPackage};
use rhai::{Dynamic, Engine, EvalAltResult, Position, Scope};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::tasks::TaskType;
use crate::worker::paths::resolve_data_path;
use crate::worker::protocol::{Outcome, TaskFailure};

/// Scope variable a payload may assign to report its value.
pub const RESULT_VAR: &str = "result";

/// How often (in engine operations) the deadline is checked.
const DEADLINE_CHECK_EVERY: u64 = 1024;

/// A host facility a payload may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Arithmetic, strings, arrays, maps, and math helpers.
    Core,
    /// `print` and `debug` forwarded to the worker log.
    Log,
    /// `read_data(name)` for files under the data directory.
    DataRead,
}

impl Capability {
    /// Capabilities granted to a task of the given type.
    pub fn for_task(task_type: TaskType) -> &'static [Capability] {
        match task_type {
            TaskType::Code => &[Capability::Core, Capability::Log],
            TaskType::File => &[Capability::Core, Capability::Log, Capability::DataRead],
        }
    }
}

/// What one evaluation produced.
#[derive(Debug)]
pub struct Evaluation {
    pub value: Result<Value, SandboxError>,
    /// Value assigned to `result` before a failure, if any.
    pub partial: Option<Value>,
}

impl Evaluation {
    pub fn into_outcome(self) -> Outcome {
        match self.value {
            Ok(value) => Outcome::Success { value },
            Err(e) => Outcome::Failure {
                error: TaskFailure::from(&e),
                partial: self.partial,
            },
        }
    }
}

/// Per-attempt script evaluator.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
    capabilities: Vec<Capability>,
}

impl Sandbox {
    /// Create a sandbox with only the `Core` capability.
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            capabilities: vec![Capability::Core],
        }
    }

    /// Replace the granted capabilities.
    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = capabilities.to_vec();
        self
    }

    /// Evaluate `source` to completion, blocking the calling thread.
    pub fn evaluate(&self, source: &str) -> Evaluation {
        let deadline = Instant::now() + self.config.timeout;
        let engine = self.build_engine(deadline);

        let mut scope = Scope::new();
        scope.push_dynamic(RESULT_VAR, Dynamic::UNIT);

        let evaluated = engine
            .compile(source)
            .map_err(|e| SandboxError::Execution {
                message: format!("syntax error: {e}"),
            })
            .and_then(|ast| {
                engine
                    .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
                    .map_err(|e| self.map_eval_error(*e))
            });

        let assigned = scope
            .get_value::<Dynamic>(RESULT_VAR)
            .filter(|v| !v.is_unit());

        match evaluated {
            Ok(last) => Evaluation {
                value: Ok(to_json(&assigned.unwrap_or(last))),
                partial: None,
            },
            Err(e) => Evaluation {
                value: Err(e),
                partial: assigned.as_ref().map(to_json),
            },
        }
    }

    fn build_engine(&self, deadline: Instant) -> Engine {
        let mut engine = Engine::new_raw();
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");

        engine.set_max_operations(self.config.max_operations);
        engine.set_max_call_levels(self.config.max_call_levels);
        engine.set_max_expr_depths(self.config.max_expr_depth, self.config.max_expr_depth);
        engine.set_max_string_size(self.config.max_string_size);
        engine.set_max_array_size(self.config.max_array_size);
        engine.set_max_map_size(self.config.max_map_size);

        engine.on_progress(move |ops| {
            if ops % DEADLINE_CHECK_EVERY == 0 && Instant::now() >= deadline {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });

        for capability in &self.capabilities {
            match capability {
                Capability::Core => {
                    engine.register_global_module(StandardPackage::new().as_shared_module());
                }
                Capability::Log => {
                    engine.on_print(|text| info!(target: "taskq::payload", "{text}"));
                    engine.on_debug(|text, _source, pos: Position| {
                        debug!(target: "taskq::payload", position = %pos, "{text}");
                    });
                }
                Capability::DataRead => {
                    let data_dir = self.config.data_dir.clone();
                    engine.register_fn(
                        "read_data",
                        move |name: &str| -> Result<String, Box<EvalAltResult>> {
                            let path =
                                resolve_data_path(&data_dir, name).map_err(|e| e.to_string())?;
                            std::fs::read_to_string(&path)
                                .map_err(|e| format!("read_data({name}): {e}").into())
                        },
                    );
                }
            }
        }

        engine
    }

    fn map_eval_error(&self, err: EvalAltResult) -> SandboxError {
        match err {
            EvalAltResult::ErrorTerminated(..) => SandboxError::Timeout {
                after: self.config.timeout,
            },
            other => SandboxError::Execution {
                message: other.to_string(),
            },
        }
    }
}

/// Convert a script value to JSON, falling back to its display form.
fn to_json(value: &Dynamic) -> Value {
    rhai::serde::from_dynamic::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::worker::protocol::FailureKind;

    fn sandbox() -> Sandbox {
        Sandbox::new(SandboxConfig {
            timeout: Duration::from_millis(300),
            ..SandboxConfig::default()
        })
    }

    #[test]
    fn evaluates_last_expression() {
        let eval = sandbox().evaluate("1+1");
        assert_eq!(eval.value.unwrap(), json!(2));
    }

    #[test]
    fn assigned_result_wins_over_last_expression() {
        let eval = sandbox().evaluate("result = #{answer: 42}; 7");
        assert_eq!(eval.value.unwrap(), json!({"answer": 42}));
    }

    #[test]
    fn unit_result_is_null() {
        let eval = sandbox().evaluate("let x = 1;");
        assert_eq!(eval.value.unwrap(), Value::Null);
    }

    #[test]
    fn runtime_error_is_execution_failure_with_partial() {
        let eval = sandbox().evaluate(r#"result = [1, 2]; throw "boom";"#);
        assert_eq!(eval.partial, Some(json!([1, 2])));

        match eval.into_outcome() {
            Outcome::Failure { error, partial } => {
                assert_eq!(error.kind, FailureKind::Execution);
                assert!(error.message.contains("boom"));
                assert_eq!(partial, Some(json!([1, 2])));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn syntax_error_is_execution_failure() {
        let eval = sandbox().evaluate("let = ;");
        assert!(matches!(eval.value, Err(SandboxError::Execution { .. })));
    }

    #[test]
    fn infinite_loop_times_out() {
        let started = Instant::now();
        let eval = sandbox().evaluate("while (true) {}");
        assert!(matches!(eval.value, Err(SandboxError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn operation_budget_is_enforced() {
        let sandbox = Sandbox::new(SandboxConfig {
            max_operations: 1_000,
            ..SandboxConfig::default()
        });
        let eval = sandbox.evaluate("let n = 0; loop { n += 1; }");
        assert!(matches!(eval.value, Err(SandboxError::Execution { .. })));
    }

    #[test]
    fn eval_and_imports_are_unavailable() {
        assert!(sandbox().evaluate(r#"eval("1")"#).value.is_err());
        assert!(sandbox().evaluate(r#"import "os" as os; 1"#).value.is_err());
    }

    #[test]
    fn read_data_requires_capability() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("input.txt"), "hello").unwrap();
        let config = SandboxConfig {
            data_dir: dir.path().to_path_buf(),
            ..SandboxConfig::default()
        };

        let denied = Sandbox::new(config.clone())
            .with_capabilities(Capability::for_task(TaskType::Code))
            .evaluate(r#"read_data("input.txt")"#);
        assert!(denied.value.is_err());

        let granted = Sandbox::new(config)
            .with_capabilities(Capability::for_task(TaskType::File))
            .evaluate(r#"read_data("input.txt").len()"#);
        assert_eq!(granted.value.unwrap(), json!(5));
    }

    #[test]
    fn read_data_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let eval = Sandbox::new(SandboxConfig {
            data_dir: dir.path().to_path_buf(),
            ..SandboxConfig::default()
        })
        .with_capabilities(&[Capability::Core, Capability::DataRead])
        .evaluate(r#"read_data("../../etc/passwd")"#);

        let err = eval.value.unwrap_err();
        assert!(err.to_string().contains("escapes the data directory"));
    }

    #[test]
    fn string_size_limit_applies() {
        let sandbox = Sandbox::new(SandboxConfig {
            max_string_size: 16,
            ..SandboxConfig::default()
        });
        let eval = sandbox.evaluate(r#"let s = "x"; for i in 0..10 { s += s; } s"#);
        assert!(eval.value.is_err());
    }
}
