//! Restricted expression language for callback tools
//!
//! The agent never runs host code. It sends expression text, which is parsed
//! and evaluated here against the live [`ContextTable`]. The language covers
//! what inspection needs and nothing more:
//!
//! ```text
//! context['user']['email']             field and index access
//! len(context.items) > 0 and not done  arithmetic, comparison, boolean logic
//! {sorted: sort(input_array, true)}    object and list literals
//! lookup_user(42)                      calls into registered host callables
//! print(x); set('retries', 3); x       statements; the last value is returned
//! lambda context: context['x']         optional lambda prefix, bound to the table
//! ```
//!
//! There is no assignment, no loops, and no access to anything outside the
//! table and the builtin list in [`builtins::BUILTINS`].

pub mod builtins;
pub mod interpreter;
pub mod lexer;
pub mod parser;

use serde_json::Value;

use crate::context::ContextTable;
use interpreter::Interpreter;
use lexer::Lexer;
use parser::{Parser, Program};

// ═══════════════════════════════════════════════════════════════════════════
// EvalError
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    /// The source text could not be parsed
    Syntax { message: String, column: usize },
    /// Evaluation failed (unknown name, bad operand types, ...)
    Runtime { message: String, column: usize },
    /// A builtin or host callable returned an error
    Call { function: String, message: String },
}

impl EvalError {
    pub fn syntax(message: impl Into<String>, column: usize) -> Self {
        EvalError::Syntax {
            message: message.into(),
            column,
        }
    }

    pub fn runtime(message: impl Into<String>, column: usize) -> Self {
        EvalError::Runtime {
            message: message.into(),
            column,
        }
    }

    pub fn call(function: impl Into<String>, message: impl Into<String>) -> Self {
        EvalError::Call {
            function: function.into(),
            message: message.into(),
        }
    }

    /// Source column the error points at, when known
    pub fn column(&self) -> Option<usize> {
        match self {
            EvalError::Syntax { column, .. } | EvalError::Runtime { column, .. } => Some(*column),
            EvalError::Call { .. } => None,
        }
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalError::Syntax { message, column } => write!(f, "syntax error at column {}: {}", column, message),
            EvalError::Runtime { message, column } => write!(f, "{} (at column {})", message, column),
            EvalError::Call { function, message } => write!(f, "{}() failed: {}", function, message),
        }
    }
}

impl std::error::Error for EvalError {}

/// Value and captured `print` output of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: Value,
    pub output: String,
}

/// Parse expression source
pub fn parse(source: &str) -> Result<Program, EvalError> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse_program()
}

/// Parse and evaluate `source` against `table`
///
/// `set(...)` calls mutate the table even when a later statement fails.
pub async fn evaluate(source: &str, table: &mut ContextTable) -> Result<Evaluation, EvalError> {
    let program = parse(source)?;
    let mut interpreter = Interpreter::new(table);
    let value = interpreter.run(&program).await?;
    Ok(Evaluation {
        value,
        output: interpreter.into_output(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{serialize_context, CapturedError, Context, ContextCallable, ContextValue};
    use serde_json::json;

    fn table() -> ContextTable {
        let context = Context::new()
            .with_value("x", &5)
            .with_value("y", &0)
            .with_value("input_array", &vec![64, 34, 25, 12, 22, 11, 90])
            .with_value("cfg", &json!({"retries": 3, "hosts": ["a", "b"]}))
            .with("error", CapturedError::new("ZeroDivisionError", "division by zero"))
            .with(
                "double",
                ContextCallable::new(|args| {
                    let n = args.first().and_then(Value::as_i64).ok_or("double() expects a number")?;
                    Ok(Value::from(n * 2))
                }),
            )
            .with(
                "fetch",
                ContextCallable::new_async(|args| async move {
                    tokio::task::yield_now().await;
                    Ok::<_, String>(json!({"id": args.first().cloned().unwrap_or(Value::Null)}))
                }),
            );
        serialize_context(&context).0
    }

    async fn run(source: &str) -> Result<Evaluation, EvalError> {
        let mut table = table();
        evaluate(source, &mut table).await
    }

    #[tokio::test]
    async fn test_reads_context() {
        assert_eq!(run("context['x'] + x").await.unwrap().value, json!(10));
        assert_eq!(run("cfg.hosts[-1]").await.unwrap().value, json!("b"));
        assert_eq!(run("len(context)").await.unwrap().value, json!(7));
        assert_eq!(run("error.message").await.unwrap().value, json!("division by zero"));
    }

    #[tokio::test]
    async fn test_division_by_zero_is_an_error() {
        let err = run("x / y").await.unwrap_err();
        assert!(err.to_string().contains("division by zero"));
        assert_eq!(err.column(), Some(3));
    }

    #[tokio::test]
    async fn test_calls_sync_and_async_callables() {
        assert_eq!(run("double(21)").await.unwrap().value, json!(42));
        assert_eq!(run("context.double(x)").await.unwrap().value, json!(10));
        assert_eq!(run("context['fetch'](7).id").await.unwrap().value, json!(7));
        let err = run("double('a')").await.unwrap_err();
        assert!(matches!(err, EvalError::Call { ref function, .. } if function == "double"));
    }

    #[tokio::test]
    async fn test_print_is_captured() {
        let evaluation = run("print('x is', x); print(cfg.retries); x * 2").await.unwrap();
        assert_eq!(evaluation.value, json!(10));
        assert_eq!(evaluation.output, "x is 5\n3\n");
    }

    #[tokio::test]
    async fn test_set_mutates_table() {
        let mut table = table();
        evaluate("set('y', 2)", &mut table).await.unwrap();
        let evaluation = evaluate("x / y", &mut table).await.unwrap();
        assert_eq!(evaluation.value, json!(2.5));
        assert!(matches!(table.get("y"), Some(ContextValue::Data(v)) if *v == json!(2)));
        assert!(evaluate("set('context', 1)", &mut table).await.is_err());
    }

    #[tokio::test]
    async fn test_lambda_prefix() {
        let evaluation = run("lambda ctx: {sorted: sort(ctx['input_array'], true)}").await.unwrap();
        assert_eq!(evaluation.value, json!({"sorted": [90, 64, 34, 25, 22, 12, 11]}));
        assert_eq!(run("lambda: x").await.unwrap().value, json!(5));
    }

    #[tokio::test]
    async fn test_short_circuit() {
        assert_eq!(run("y != 0 and x / y > 1").await.unwrap().value, json!(false));
        assert_eq!(run("y or 'fallback'").await.unwrap().value, json!("fallback"));
    }

    #[tokio::test]
    async fn test_deep_expressions_fail_cleanly() {
        let parens = format!("{}1{}", "(".repeat(5_000), ")".repeat(5_000));
        let err = run(&parens).await.unwrap_err();
        assert!(matches!(err, EvalError::Syntax { .. }));
        assert!(err.to_string().contains("nested too deeply"));

        // Each level stays under the parser bound but the tree grows past the evaluator's
        let mut layered = "1".to_string();
        for _ in 0..5 {
            layered = format!("({}){}", layered, " + 1".repeat(100));
        }
        let err = run(&layered).await.unwrap_err();
        assert!(matches!(err, EvalError::Runtime { .. }));
        assert!(err.to_string().contains("nested too deeply"));

        assert_eq!(run(&vec!["1"; 100].join(" + ")).await.unwrap().value, json!(100));
    }

    #[tokio::test]
    async fn test_unknown_names() {
        let err = run("missing + 1").await.unwrap_err();
        assert!(err.to_string().contains("name 'missing' is not defined"));
        assert!(run("nope(1)").await.is_err());
        assert!(run("x(1)").await.is_err());
        assert!(run("len").await.is_err());
    }
}
