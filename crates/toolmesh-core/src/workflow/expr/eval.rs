use serde_json::{Map, Value};

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::ExprError;

/// Evaluate against a context object. Top-level identifiers must exist in
/// the context; missing fields and out-of-range indexes yield `null`.
pub fn evaluate(expr: &Expr, ctx: &Map<String, Value>) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Array(items) => items
            .iter()
            .map(|item| evaluate(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Ident(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownIdentifier(name.clone())),
        Expr::Field(target, field) => Ok(field_of(&evaluate(target, ctx)?, field)),
        Expr::Index(target, index) => {
            let target = evaluate(target, ctx)?;
            let index = evaluate(index, ctx)?;
            index_of(&target, &index)
        }
        Expr::Unary(op, operand) => {
            let value = evaluate(operand, ctx)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => number(-as_number(&value, "-")?),
            }
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            let left = evaluate(lhs, ctx)?;
            if !truthy(&left) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&evaluate(rhs, ctx)?)))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            let left = evaluate(lhs, ctx)?;
            if truthy(&left) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&evaluate(rhs, ctx)?)))
        }
        Expr::Binary(op, lhs, rhs) => {
            let left = evaluate(lhs, ctx)?;
            let right = evaluate(rhs, ctx)?;
            binary(*op, &left, &right)
        }
        Expr::Ternary(cond, then, otherwise) => {
            if truthy(&evaluate(cond, ctx)?) {
                evaluate(then, ctx)
            } else {
                evaluate(otherwise, ctx)
            }
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|a| evaluate(a, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &args)
        }
    }
}

/// `null`, `false`, `0`, `""` are false; everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Text form used when splicing into templates: strings verbatim, `null` as
/// empty, everything else as JSON.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

fn field_of(target: &Value, field: &str) -> Value {
    match target {
        Value::Object(map) => map.get(field).cloned().unwrap_or(Value::Null),
        Value::Array(items) if field == "length" => Value::from(items.len()),
        _ => Value::Null,
    }
}

fn index_of(target: &Value, index: &Value) -> Result<Value, ExprError> {
    match (target, index) {
        (Value::Array(items), Value::Number(n)) => {
            let i = n
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .ok_or_else(|| ExprError::Type(format!("array index must be an integer, got {}", n)))?;
            let i = if i < 0.0 { items.len() as f64 + i } else { i };
            if i < 0.0 {
                return Ok(Value::Null);
            }
            Ok(items.get(i as usize).cloned().unwrap_or(Value::Null))
        }
        (Value::Object(map), Value::String(key)) => Ok(map.get(key).cloned().unwrap_or(Value::Null)),
        (Value::String(s), Value::Number(n)) => {
            let i = n.as_u64().ok_or_else(|| ExprError::Type(format!("string index must be a non-negative integer, got {}", n)))?;
            Ok(s.chars()
                .nth(i as usize)
                .map(|c| Value::String(c.to_string()))
                .unwrap_or(Value::Null))
        }
        (Value::Null, _) => Ok(Value::Null),
        (target, index) => Err(ExprError::Type(format!(
            "cannot index {} with {}",
            type_name(target),
            type_name(index)
        ))),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Add => match (left, right) {
            (Value::Number(_), Value::Number(_)) => number(as_number(left, "+")? + as_number(right, "+")?),
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", to_text(left), to_text(right))))
            }
            (Value::Array(a), Value::Array(b)) => Ok(Value::Array(a.iter().chain(b).cloned().collect())),
            _ => Err(type_error("+", left, right)),
        },
        BinaryOp::Sub => {
            let (a, b) = numeric(left, right, "-")?;
            number(a - b)
        }
        BinaryOp::Mul => {
            let (a, b) = numeric(left, right, "*")?;
            number(a * b)
        }
        BinaryOp::Div => {
            let (a, b) = numeric(left, right, "/")?;
            if b == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            number(a / b)
        }
        BinaryOp::Rem => {
            let (a, b) = numeric(left, right, "%")?;
            if b == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            number(a % b)
        }
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(_), Value::Number(_)) => {
                    let (a, b) = numeric(left, right, "compare")?;
                    a.partial_cmp(&b)
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => return Err(type_error(op_symbol(op), left, right)),
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(match op {
            BinaryOp::And => truthy(left) && truthy(right),
            _ => truthy(left) || truthy(right),
        })),
    }
}

fn call(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    let arity = |expected: usize| {
        if args.len() == expected {
            Ok(())
        } else {
            Err(ExprError::Arity {
                name: name.to_string(),
                expected,
                got: args.len(),
            })
        }
    };

    match name {
        "len" => {
            arity(1)?;
            match &args[0] {
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Array(a) => Ok(Value::from(a.len())),
                Value::Object(o) => Ok(Value::from(o.len())),
                Value::Null => Ok(Value::from(0)),
                other => Err(ExprError::Type(format!("len() of {}", type_name(other)))),
            }
        }
        "contains" => {
            arity(2)?;
            match (&args[0], &args[1]) {
                (Value::String(s), needle) => Ok(Value::Bool(s.contains(&to_text(needle)))),
                (Value::Array(items), needle) => Ok(Value::Bool(items.iter().any(|i| values_equal(i, needle)))),
                (Value::Object(map), Value::String(key)) => Ok(Value::Bool(map.contains_key(key))),
                (Value::Null, _) => Ok(Value::Bool(false)),
                (hay, _) => Err(ExprError::Type(format!("contains() on {}", type_name(hay)))),
            }
        }
        "starts_with" | "ends_with" => {
            arity(2)?;
            let s = as_str(&args[0], name)?;
            let affix = as_str(&args[1], name)?;
            Ok(Value::Bool(if name == "starts_with" {
                s.starts_with(affix)
            } else {
                s.ends_with(affix)
            }))
        }
        "lower" => {
            arity(1)?;
            Ok(Value::String(as_str(&args[0], name)?.to_lowercase()))
        }
        "upper" => {
            arity(1)?;
            Ok(Value::String(as_str(&args[0], name)?.to_uppercase()))
        }
        "keys" => {
            arity(1)?;
            match &args[0] {
                Value::Object(map) => Ok(Value::Array(map.keys().cloned().map(Value::String).collect())),
                other => Err(ExprError::Type(format!("keys() of {}", type_name(other)))),
            }
        }
        "default" => {
            arity(2)?;
            Ok(if args[0].is_null() {
                args[1].clone()
            } else {
                args[0].clone()
            })
        }
        "string" => {
            arity(1)?;
            Ok(Value::String(to_text(&args[0])))
        }
        "number" => {
            arity(1)?;
            match &args[0] {
                Value::Number(_) => Ok(args[0].clone()),
                Value::Bool(b) => Ok(Value::from(u8::from(*b))),
                Value::Null => Ok(Value::from(0)),
                Value::String(s) => {
                    let parsed = s
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| ExprError::Type(format!("cannot convert \"{}\" to a number", s)))?;
                    number(parsed)
                }
                other => Err(ExprError::Type(format!("number() of {}", type_name(other)))),
            }
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

/// Integral results stay integers on the wire.
fn number(n: f64) -> Result<Value, ExprError> {
    if !n.is_finite() {
        return Err(ExprError::Type(format!("arithmetic produced {}", n)));
    }
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Ok(Value::from(n as i64))
    } else {
        Ok(Value::from(n))
    }
}

fn as_number(value: &Value, op: &str) -> Result<f64, ExprError> {
    value
        .as_f64()
        .ok_or_else(|| ExprError::Type(format!("'{}' expects a number, got {}", op, type_name(value))))
}

fn numeric(left: &Value, right: &Value, op: &str) -> Result<(f64, f64), ExprError> {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(type_error(op, left, right)),
    }
}

fn as_str<'a>(value: &'a Value, func: &str) -> Result<&'a str, ExprError> {
    value
        .as_str()
        .ok_or_else(|| ExprError::Type(format!("{}() expects a string, got {}", func, type_name(value))))
}

fn type_error(op: &str, left: &Value, right: &Value) -> ExprError {
    ExprError::Type(format!(
        "unsupported operands for '{}': {} and {}",
        op,
        type_name(left),
        type_name(right)
    ))
}

fn op_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        _ => ">=",
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
