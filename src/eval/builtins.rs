//! Value operations and the builtin function table
//!
//! Everything here is pure over `serde_json::Value`. The two builtins with side
//! effects (`print`, `set`) are handled by the interpreter itself.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use super::parser::BinaryOp;
use crate::context::json_type_name;

/// Names callable without a context entry of the same name
pub const BUILTINS: &[&str] = &[
    "len", "keys", "values", "sort", "reverse", "sum", "min", "max", "str", "int", "float", "contains",
    "type", "print", "set",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Text form used by `print` and `str`; strings are not quoted
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn float_value(f: f64) -> Result<Value, String> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| "numeric result is not finite".to_string())
}

fn int_pair(left: &Value, right: &Value) -> Option<(i64, i64)> {
    Some((left.as_i64()?, right.as_i64()?))
}

fn float_pair(left: &Value, right: &Value) -> Option<(f64, f64)> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => Some((l.as_f64()?, r.as_f64()?)),
        _ => None,
    }
}

fn type_error(op: &str, left: &Value, right: &Value) -> String {
    format!(
        "unsupported operand types for {}: '{}' and '{}'",
        op,
        json_type_name(left),
        json_type_name(right)
    )
}

/// Equality where `1 == 1.0`
pub fn values_equal(left: &Value, right: &Value) -> bool {
    if let Some((l, r)) = int_pair(left, right) {
        return l == r;
    }
    if let Some((l, r)) = float_pair(left, right) {
        return l == r;
    }
    left == right
}

pub fn compare(left: &Value, right: &Value) -> Result<Ordering, String> {
    if let Some((l, r)) = int_pair(left, right) {
        return Ok(l.cmp(&r));
    }
    if let Some((l, r)) = float_pair(left, right) {
        return l.partial_cmp(&r).ok_or_else(|| "cannot compare NaN".to_string());
    }
    match (left, right) {
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Ok(l.cmp(r)),
        (Value::Array(l), Value::Array(r)) => {
            for (a, b) in l.iter().zip(r) {
                match compare(a, b)? {
                    Ordering::Equal => continue,
                    other => return Ok(other),
                }
            }
            Ok(l.len().cmp(&r.len()))
        }
        _ => Err(type_error("comparison", left, right)),
    }
}

pub fn contains(container: &Value, item: &Value) -> Result<bool, String> {
    match (container, item) {
        (Value::Array(items), _) => Ok(items.iter().any(|v| values_equal(v, item))),
        (Value::String(s), Value::String(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        _ => Err(format!(
            "'in' is not supported between '{}' and '{}'",
            json_type_name(item),
            json_type_name(container)
        )),
    }
}

pub fn negate(value: &Value) -> Result<Value, String> {
    if let Some(n) = value.as_i64() {
        return n
            .checked_neg()
            .map(Value::from)
            .ok_or_else(|| "integer overflow".to_string());
    }
    match value {
        Value::Number(n) => float_value(-n.as_f64().unwrap_or_default()),
        other => Err(format!("bad operand type for unary -: '{}'", json_type_name(other))),
    }
}

pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, String> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt => Ok(Value::Bool(compare(left, right)? == Ordering::Less)),
        BinaryOp::Le => Ok(Value::Bool(compare(left, right)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(compare(left, right)? == Ordering::Greater)),
        BinaryOp::Ge => Ok(Value::Bool(compare(left, right)? != Ordering::Less)),
        BinaryOp::In => Ok(Value::Bool(contains(right, left)?)),
        BinaryOp::NotIn => Ok(Value::Bool(!contains(right, left)?)),
        BinaryOp::Add => match (left, right) {
            (Value::String(l), Value::String(r)) => Ok(Value::String(format!("{}{}", l, r))),
            (Value::Array(l), Value::Array(r)) => Ok(Value::Array(l.iter().chain(r).cloned().collect())),
            _ => arithmetic(op, left, right),
        },
        _ => arithmetic(op, left, right),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, String> {
    let symbol = match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        _ => "%",
    };

    if let Some((l, r)) = int_pair(left, right) {
        let result = match op {
            BinaryOp::Add => l.checked_add(r),
            BinaryOp::Sub => l.checked_sub(r),
            BinaryOp::Mul => l.checked_mul(r),
            BinaryOp::Div | BinaryOp::Rem if r == 0 => return Err("division by zero".to_string()),
            BinaryOp::Div if l.checked_rem(r).is_some_and(|rem| rem != 0) => return float_value(l as f64 / r as f64),
            BinaryOp::Div => l.checked_div(r),
            _ => l.checked_rem(r),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| "integer overflow".to_string());
    }

    let (l, r) = float_pair(left, right).ok_or_else(|| type_error(symbol, left, right))?;
    let result = match op {
        BinaryOp::Add => l + r,
        BinaryOp::Sub => l - r,
        BinaryOp::Mul => l * r,
        BinaryOp::Div | BinaryOp::Rem if r == 0.0 => return Err("division by zero".to_string()),
        BinaryOp::Div => l / r,
        _ => l % r,
    };
    float_value(result)
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), String> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{} to {}", min, max)
        };
        return Err(format!("{}() takes {} arguments, got {}", name, expected, args.len()));
    }
    Ok(())
}

fn as_array<'v>(name: &str, value: &'v Value) -> Result<&'v Vec<Value>, String> {
    value
        .as_array()
        .ok_or_else(|| format!("{}() expects an array, got '{}'", name, json_type_name(value)))
}

fn as_object<'v>(name: &str, value: &'v Value) -> Result<&'v Map<String, Value>, String> {
    value
        .as_object()
        .ok_or_else(|| format!("{}() expects an object, got '{}'", name, json_type_name(value)))
}

fn extreme(name: &str, args: &[Value], want: Ordering) -> Result<Value, String> {
    let items: &[Value] = match args {
        [Value::Array(items)] => items,
        _ => args,
    };
    let mut best: Option<&Value> = None;
    for item in items {
        let replace = match best {
            Some(current) => compare(item, current)? == want,
            None => true,
        };
        if replace {
            best = Some(item);
        }
    }
    best.cloned()
        .ok_or_else(|| format!("{}() of an empty sequence", name))
}

/// Call a side-effect-free builtin
pub fn call_pure(name: &str, args: &[Value]) -> Result<Value, String> {
    match name {
        "len" => {
            arity(name, args, 1, 1)?;
            let len = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => return Err(format!("object of type '{}' has no len()", json_type_name(other))),
            };
            Ok(Value::from(len))
        }
        "keys" => {
            arity(name, args, 1, 1)?;
            let map = as_object(name, &args[0])?;
            Ok(Value::Array(map.keys().cloned().map(Value::String).collect()))
        }
        "values" => {
            arity(name, args, 1, 1)?;
            let map = as_object(name, &args[0])?;
            Ok(Value::Array(map.values().cloned().collect()))
        }
        "sort" => {
            arity(name, args, 1, 2)?;
            let mut items = as_array(name, &args[0])?.clone();
            let descending = args.get(1).map_or(false, truthy);
            let mut failure = None;
            items.sort_by(|a, b| match compare(a, b) {
                Ok(order) => order,
                Err(e) => {
                    failure.get_or_insert(e);
                    Ordering::Equal
                }
            });
            if let Some(e) = failure {
                return Err(e);
            }
            if descending {
                items.reverse();
            }
            Ok(Value::Array(items))
        }
        "reverse" => {
            arity(name, args, 1, 1)?;
            match &args[0] {
                Value::String(s) => Ok(Value::String(s.chars().rev().collect())),
                other => {
                    let mut items = as_array(name, other)?.clone();
                    items.reverse();
                    Ok(Value::Array(items))
                }
            }
        }
        "sum" => {
            arity(name, args, 1, 1)?;
            as_array(name, &args[0])?
                .iter()
                .try_fold(Value::from(0), |acc, item| binary(BinaryOp::Add, &acc, item))
        }
        "min" => extreme(name, args, Ordering::Less),
        "max" => extreme(name, args, Ordering::Greater),
        "str" => {
            arity(name, args, 1, 1)?;
            Ok(Value::String(display(&args[0])))
        }
        "int" => {
            arity(name, args, 1, 1)?;
            match &args[0] {
                Value::Bool(b) => Ok(Value::from(i64::from(*b))),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => Ok(Value::from(i)),
                    None => {
                        let f = n.as_f64().unwrap_or_default().trunc();
                        if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                            Ok(Value::from(f as i64))
                        } else {
                            Err("int() argument out of range".to_string())
                        }
                    }
                },
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| format!("invalid literal for int(): '{}'", s)),
                other => Err(format!("int() cannot convert '{}'", json_type_name(other))),
            }
        }
        "float" => {
            arity(name, args, 1, 1)?;
            match &args[0] {
                Value::Bool(b) => float_value(if *b { 1.0 } else { 0.0 }),
                Value::Number(n) => float_value(n.as_f64().unwrap_or_default()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| format!("could not convert string to float: '{}'", s))
                    .and_then(float_value),
                other => Err(format!("float() cannot convert '{}'", json_type_name(other))),
            }
        }
        "contains" => {
            arity(name, args, 2, 2)?;
            Ok(Value::Bool(contains(&args[0], &args[1])?))
        }
        "type" => {
            arity(name, args, 1, 1)?;
            Ok(Value::String(json_type_name(&args[0]).to_string()))
        }
        other => Err(format!("unknown function '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_division() {
        assert_eq!(binary(BinaryOp::Div, &json!(10), &json!(2)).unwrap(), json!(5));
        assert_eq!(binary(BinaryOp::Div, &json!(5), &json!(2)).unwrap(), json!(2.5));
        assert!(binary(BinaryOp::Div, &json!(5), &json!(0)).is_err());
        assert!(binary(BinaryOp::Rem, &json!(5.0), &json!(0.0)).is_err());
    }

    #[test]
    fn test_mixed_arithmetic_and_concat() {
        assert_eq!(binary(BinaryOp::Add, &json!(1), &json!(0.5)).unwrap(), json!(1.5));
        assert_eq!(binary(BinaryOp::Add, &json!("a"), &json!("b")).unwrap(), json!("ab"));
        assert_eq!(binary(BinaryOp::Add, &json!([1]), &json!([2])).unwrap(), json!([1, 2]));
        let err = binary(BinaryOp::Sub, &json!("a"), &json!(1)).unwrap_err();
        assert!(err.contains("'string' and 'integer'"));
        assert!(binary(BinaryOp::Mul, &json!(i64::MAX), &json!(2)).is_err());
    }

    #[test]
    fn test_integer_overflow_is_an_error() {
        for op in [BinaryOp::Div, BinaryOp::Rem] {
            let err = binary(op, &json!(i64::MIN), &json!(-1)).unwrap_err();
            assert_eq!(err, "integer overflow");
        }
        assert_eq!(binary(BinaryOp::Div, &json!(i64::MIN), &json!(1)).unwrap(), json!(i64::MIN));
        assert_eq!(binary(BinaryOp::Div, &json!(-7), &json!(2)).unwrap(), json!(-3.5));
        assert!(negate(&json!(i64::MIN)).is_err());
    }

    #[test]
    fn test_equality_and_membership() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert_eq!(binary(BinaryOp::In, &json!(2), &json!([1, 2])).unwrap(), json!(true));
        assert_eq!(binary(BinaryOp::In, &json!("k"), &json!({"k": 1})).unwrap(), json!(true));
        assert_eq!(binary(BinaryOp::NotIn, &json!("z"), &json!("abc")).unwrap(), json!(true));
        assert!(binary(BinaryOp::In, &json!(1), &json!(2)).is_err());
    }

    #[test]
    fn test_sort_and_extremes() {
        let input = json!([64, 34, 25, 12, 22, 11, 90]);
        assert_eq!(
            call_pure("sort", &[input.clone(), json!(true)]).unwrap(),
            json!([90, 64, 34, 25, 22, 12, 11])
        );
        assert_eq!(call_pure("max", &[input.clone()]).unwrap(), json!(90));
        assert_eq!(call_pure("min", &[json!(3), json!(1), json!(2)]).unwrap(), json!(1));
        assert!(call_pure("sort", &[json!([1, "a"])]).is_err());
        assert!(call_pure("max", &[json!([])]).is_err());
    }

    #[test]
    fn test_conversions() {
        assert_eq!(call_pure("int", &[json!("42")]).unwrap(), json!(42));
        assert_eq!(call_pure("int", &[json!(3.9)]).unwrap(), json!(3));
        assert_eq!(call_pure("float", &[json!("2.5")]).unwrap(), json!(2.5));
        assert_eq!(call_pure("str", &[json!([1, 2])]).unwrap(), json!("[1,2]"));
        assert_eq!(call_pure("type", &[json!({})]).unwrap(), json!("object"));
    }

    #[test]
    fn test_sum() {
        assert_eq!(call_pure("sum", &[json!([1, 2, 3])]).unwrap(), json!(6));
        assert_eq!(call_pure("sum", &[json!([1, 2.5])]).unwrap(), json!(3.5));
    }

    #[test]
    fn test_arity_errors() {
        let err = call_pure("len", &[]).unwrap_err();
        assert!(err.contains("takes 1 arguments"));
        assert!(call_pure("len", &[json!(5)]).is_err());
    }
}
