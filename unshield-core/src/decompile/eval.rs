//! Just enough evaluation of script expressions to read the arguments of the
//! editor's placement calls.

use std::collections::HashMap;

use super::Miss;
use crate::jass::{walk, BinaryOp, Expr, Statement, UnaryOp};
use crate::sections::ObjectId;

const NEUTRAL_AGGRESSIVE_OLD: i32 = 12;
const NEUTRAL_PASSIVE_OLD: i32 = 15;
const NEUTRAL_AGGRESSIVE_NEW: i32 = 24;
const NEUTRAL_PASSIVE_NEW: i32 = 27;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Real(f64),
    Str(String),
    Bool(bool),
    Null,
    Player(i32),
    /// Something an extractor created, by its index in the extractor's table.
    Object(usize),
    Function(String),
    /// A name with no known value, usually a global handle.
    Handle(String),
    /// A native whose result is not modelled.
    Call(String, Vec<Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        self.as_f64().map(|v| v as f32)
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v as i32),
            Value::Real(v) => Some(*v as i32),
            Value::Player(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<usize> {
        match self {
            Value::Object(i) => Some(*i),
            _ => None,
        }
    }

    /// Rawcodes evaluate to their big-endian integer value.
    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Value::Int(v) => Some((*v as u32).to_be_bytes()),
            Value::Str(s) => crate::sections::object_id(s),
            _ => None,
        }
    }

    pub fn as_player(&self) -> Option<i32> {
        match self {
            Value::Player(n) => Some(*n),
            Value::Int(n) => i32::try_from(*n).ok(),
            _ => None,
        }
    }
}

fn parse_integer(raw: &str) -> Option<i64> {
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else if let Some(hex) = raw.strip_prefix('$') {
        i64::from_str_radix(hex, 16).ok()
    } else if raw.len() > 1 && raw.starts_with('0') {
        i64::from_str_radix(&raw[1..], 8).ok()
    } else {
        raw.parse().ok()
    }
}

fn rawcode(text: &str) -> i64 {
    text.bytes().fold(0i64, |acc, b| (acc << 8) | b as i64)
}

/// Local and global bindings seen so far while walking a statement list.
#[derive(Debug, Default)]
pub struct Scope {
    values: HashMap<String, Value>,
    new_format: bool,
}

impl Scope {
    pub fn new(new_format: bool) -> Self {
        Self {
            values: HashMap::new(),
            new_format,
        }
    }

    pub fn neutral_passive(&self) -> i32 {
        if self.new_format {
            NEUTRAL_PASSIVE_NEW
        } else {
            NEUTRAL_PASSIVE_OLD
        }
    }

    pub fn neutral_aggressive(&self) -> i32 {
        if self.new_format {
            NEUTRAL_AGGRESSIVE_NEW
        } else {
            NEUTRAL_AGGRESSIVE_OLD
        }
    }

    pub fn bind(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    pub fn eval(&self, expr: &Expr) -> Value {
        match expr {
            Expr::Integer(raw) => parse_integer(raw).map_or(Value::Null, Value::Int),
            Expr::Real(raw) => raw.parse().map_or(Value::Null, Value::Real),
            Expr::FourCC(raw) => Value::Int(rawcode(raw)),
            Expr::Str(_) => expr.string_value().map_or(Value::Null, Value::Str),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Null => Value::Null,
            Expr::Var(name) => self.variable(name),
            Expr::ArrayRef(name, _) => Value::Handle(name.clone()),
            Expr::FunctionRef(name) => Value::Function(name.clone()),
            Expr::Paren(inner) => self.eval(inner),
            Expr::Unary(op, operand) => {
                let value = self.eval(operand);
                match (op, value) {
                    (UnaryOp::Neg, Value::Int(v)) => Value::Int(-v),
                    (UnaryOp::Neg, Value::Real(v)) => Value::Real(-v),
                    (UnaryOp::Plus, v @ (Value::Int(_) | Value::Real(_))) => v,
                    (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
                    _ => Value::Null,
                }
            }
            Expr::Binary(op, left, right) => binary(*op, self.eval(left), self.eval(right)),
            Expr::Call(name, args) => self.call(name, args),
        }
    }

    fn variable(&self, name: &str) -> Value {
        if let Some(value) = self.values.get(name) {
            return value.clone();
        }
        match name {
            "PLAYER_NEUTRAL_PASSIVE" => Value::Int(self.neutral_passive() as i64),
            "PLAYER_NEUTRAL_AGGRESSIVE" => Value::Int(self.neutral_aggressive() as i64),
            "bj_DEGTORAD" => Value::Real(std::f64::consts::PI / 180.0),
            "bj_RADTODEG" => Value::Real(180.0 / std::f64::consts::PI),
            "bj_PI" => Value::Real(std::f64::consts::PI),
            _ => Value::Handle(name.to_string()),
        }
    }

    fn call(&self, name: &str, args: &[Expr]) -> Value {
        let args: Vec<Value> = args.iter().map(|a| self.eval(a)).collect();
        let first = args.first();
        match name {
            "Player" => first
                .and_then(Value::as_i32)
                .map_or(Value::Null, Value::Player),
            "GetPlayerNeutralPassive" => Value::Player(self.neutral_passive()),
            "GetPlayerNeutralAggressive" => Value::Player(self.neutral_aggressive()),
            "ConvertPlayerColor" => first.and_then(Value::as_i32).map_or(Value::Null, |n| {
                Value::Int(n as i64)
            }),
            "I2R" => first.and_then(Value::as_f64).map_or(Value::Null, Value::Real),
            "R2I" => first
                .and_then(Value::as_f64)
                .map_or(Value::Null, |v| Value::Int(v as i64)),
            "Deg2Rad" => first
                .and_then(Value::as_f64)
                .map_or(Value::Null, |v| Value::Real(v.to_radians())),
            "Rad2Deg" => first
                .and_then(Value::as_f64)
                .map_or(Value::Null, |v| Value::Real(v.to_degrees())),
            _ => Value::Call(name.to_string(), args),
        }
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Value {
    use Value::{Bool, Int, Real, Str};

    match (op, &left, &right) {
        (BinaryOp::Add, Str(a), Str(b)) => return Str(format!("{a}{b}")),
        (BinaryOp::And, Bool(a), Bool(b)) => return Bool(*a && *b),
        (BinaryOp::Or, Bool(a), Bool(b)) => return Bool(*a || *b),
        (BinaryOp::Eq, _, _) => return Bool(left == right),
        (BinaryOp::Ne, _, _) => return Bool(left != right),
        _ => {}
    }

    if let (Int(a), Int(b)) = (&left, &right) {
        let (a, b) = (*a, *b);
        return match op {
            BinaryOp::Add => Int(a.wrapping_add(b)),
            BinaryOp::Sub => Int(a.wrapping_sub(b)),
            BinaryOp::Mul => Int(a.wrapping_mul(b)),
            BinaryOp::Div if b != 0 => Int(a / b),
            BinaryOp::Lt => Bool(a < b),
            BinaryOp::Le => Bool(a <= b),
            BinaryOp::Gt => Bool(a > b),
            BinaryOp::Ge => Bool(a >= b),
            _ => Value::Null,
        };
    }

    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Value::Null;
    };
    match op {
        BinaryOp::Add => Real(a + b),
        BinaryOp::Sub => Real(a - b),
        BinaryOp::Mul => Real(a * b),
        BinaryOp::Div if b != 0.0 => Real(a / b),
        BinaryOp::Lt => Bool(a < b),
        BinaryOp::Le => Bool(a <= b),
        BinaryOp::Gt => Bool(a > b),
        BinaryOp::Ge => Bool(a >= b),
        _ => Value::Null,
    }
}

/// One thing a statement does that extractors care about.
#[derive(Debug, Clone, Copy)]
pub enum Step<'a> {
    Assign { target: &'a str, value: &'a Expr },
    Call { name: &'a str, args: &'a [Expr] },
}

/// Assignments and calls of `body` in execution order, nested blocks included.
pub fn steps(body: &[Statement]) -> Vec<Step<'_>> {
    let mut out = Vec::new();
    walk::visit_statements(body, &mut |stmt| match stmt {
        Statement::Local {
            name,
            init: Some(value),
            ..
        } => out.push(Step::Assign {
            target: name,
            value,
        }),
        Statement::Set { name, value, .. } => out.push(Step::Assign {
            target: name,
            value,
        }),
        Statement::Call { name, args } => out.push(Step::Call { name, args }),
        _ => {}
    });
    out
}

/// What [`interpret`] reports for each step of the program.
#[derive(Debug)]
pub enum Event<'e> {
    /// A native call with evaluated arguments. `target` is set when the result is
    /// assigned.
    Call {
        name: &'e str,
        args: &'e [Value],
        target: Option<&'e str>,
    },
    /// An assignment of anything other than a native call.
    Assign { target: &'e str, value: &'e Value },
}

/// Walks `body` keeping `scope` current and hands every call and assignment to
/// `visit`. A value returned by `visit` is bound to the assignment target in place
/// of the evaluated one.
pub fn interpret(
    body: &[Statement],
    scope: &mut Scope,
    visit: &mut dyn FnMut(&Scope, Event<'_>) -> Result<Option<Value>, Miss>,
) -> Result<(), Miss> {
    for step in steps(body) {
        match step {
            Step::Assign { target, value } => {
                let value = scope.eval(value);
                let event = match &value {
                    Value::Call(name, args) => Event::Call {
                        name,
                        args,
                        target: Some(target),
                    },
                    other => Event::Assign {
                        target,
                        value: other,
                    },
                };
                let replaced = visit(scope, event)?;
                scope.bind(target, replaced.unwrap_or(value));
            }
            Step::Call { name, args } => {
                let args: Vec<Value> = args.iter().map(|a| scope.eval(a)).collect();
                visit(
                    scope,
                    Event::Call {
                        name,
                        args: &args,
                        target: None,
                    },
                )?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jass::parse_expr;

    fn eval(scope: &Scope, src: &str) -> Value {
        scope.eval(&parse_expr(src).unwrap())
    }

    #[test]
    fn literals_and_arithmetic() {
        let scope = Scope::new(false);
        assert_eq!(eval(&scope, "0x10 + $10 + 010 + 10"), Value::Int(16 + 16 + 8 + 10));
        assert_eq!(eval(&scope, "-(2 * 3)"), Value::Int(-6));
        assert_eq!(eval(&scope, "1 + 0.5"), Value::Real(1.5));
        assert_eq!(eval(&scope, "7 / 2"), Value::Int(3));
        assert_eq!(eval(&scope, "\"a\" + \"b\""), Value::Str("ab".to_string()));
        assert_eq!(eval(&scope, "1 < 2 and not false"), Value::Bool(true));
        assert_eq!(eval(&scope, "1 / 0"), Value::Null);
    }

    #[test]
    fn rawcodes_round_trip_to_ids() {
        let scope = Scope::new(false);
        let value = eval(&scope, "'hfoo'");
        assert_eq!(value, Value::Int(0x6866_6F6F));
        assert_eq!(value.as_object_id(), Some(*b"hfoo"));
    }

    #[test]
    fn neutral_players_depend_on_format() {
        let old = Scope::new(false);
        let new = Scope::new(true);
        assert_eq!(eval(&old, "Player(PLAYER_NEUTRAL_PASSIVE)"), Value::Player(15));
        assert_eq!(eval(&new, "Player(PLAYER_NEUTRAL_PASSIVE)"), Value::Player(27));
        assert_eq!(eval(&old, "GetPlayerNeutralAggressive()"), Value::Player(12));
        assert_eq!(eval(&new, "GetPlayerNeutralAggressive()"), Value::Player(24));
    }

    #[test]
    fn bindings_shadow_handles() {
        let mut scope = Scope::new(false);
        assert_eq!(eval(&scope, "p"), Value::Handle("p".to_string()));
        scope.bind("p", Value::Player(3));
        assert_eq!(eval(&scope, "p").as_player(), Some(3));
    }
}
