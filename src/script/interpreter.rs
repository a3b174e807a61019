//! Script interpreter.
//!
//! Values are strings, as in macro text; arithmetic applies when both sides
//! parse as numbers. Side effects go through a [`ScriptHost`].

use std::cmp::Ordering;
use std::collections::HashMap;

use super::parser::{BinaryOperator, Expr, GameQuery, Stmt};
use super::ScriptError;

/// What a running script can reach outside itself.
pub trait ScriptHost {
    type Error: From<ScriptError>;

    /// Run one macro command line to completion before returning.
    fn yield_command(&mut self, command: &str) -> Result<(), Self::Error>;
    fn log(&mut self, message: &str);
    fn query(&mut self, query: &GameQuery) -> String;
}

#[derive(Debug, Default)]
pub struct Interpreter {
    pub variables: HashMap<String, String>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run<H: ScriptHost>(&mut self, program: &[Stmt], host: &mut H) -> Result<(), H::Error> {
        for stmt in program {
            self.exec(stmt, host)?;
        }
        Ok(())
    }

    fn exec<H: ScriptHost>(&mut self, stmt: &Stmt, host: &mut H) -> Result<(), H::Error> {
        match stmt {
            Stmt::Yield { line, command } => {
                let command = self.eval_expr(command)?;
                tracing::debug!(line, command = %command, "script yield");
                host.yield_command(&command)?;
            }

            Stmt::Log(expr) => {
                let msg = self.eval_expr(expr)?;
                host.log(&msg);
            }

            Stmt::SetVar(name, expr) => {
                let val = self.eval_expr(expr)?.trim().to_string();
                self.variables.insert(name.clone(), val);
            }

            Stmt::SetVarFromGame(name, query) => {
                let val = host.query(query);
                self.variables.insert(name.clone(), val);
            }

            Stmt::If {
                condition,
                body,
                elif_blocks,
                else_body,
            } => {
                if truthy(&self.eval_expr(condition)?) {
                    self.run(body, host)?;
                } else {
                    let mut done = false;
                    for (cond, block) in elif_blocks {
                        if truthy(&self.eval_expr(cond)?) {
                            self.run(block, host)?;
                            done = true;
                            break;
                        }
                    }
                    if !done {
                        if let Some(block) = else_body {
                            self.run(block, host)?;
                        }
                    }
                }
            }

            Stmt::Repeat { line, count, body } => {
                let raw = self.eval_expr(count)?;
                let n = repeat_count(&raw).ok_or_else(|| ScriptError::BadRepeatCount {
                    line: *line,
                    value: raw.clone(),
                })?;
                for _ in 0..n {
                    self.run(body, host)?;
                }
            }
        }
        Ok(())
    }

    /*---------------------- eval_expr ---------------------*/
    pub fn eval_expr(&self, expr: &Expr) -> Result<String, ScriptError> {
        match expr {
            Expr::Str(s) => Ok(s.clone()),
            Expr::Number(n) => Ok(n.clone()),
            Expr::Var(v) => {
                if let Some(val) = self.variables.get(v) {
                    return Ok(val.clone());
                }
                match v.to_ascii_lowercase().as_str() {
                    "true" | "false" | "none" => Ok(v.to_ascii_lowercase()),
                    _ => Err(ScriptError::UndefinedVariable(v.clone())),
                }
            }

            Expr::Binary(lhs, BinaryOperator::And, rhs) => {
                Ok((truthy(&self.eval_expr(lhs)?) && truthy(&self.eval_expr(rhs)?)).to_string())
            }
            Expr::Binary(lhs, BinaryOperator::Or, rhs) => {
                Ok((truthy(&self.eval_expr(lhs)?) || truthy(&self.eval_expr(rhs)?)).to_string())
            }

            Expr::Binary(lhs, op, rhs) => {
                let l_raw = self.eval_expr(lhs)?;
                let r_raw = self.eval_expr(rhs)?;
                let l = l_raw.trim();
                let r = r_raw.trim();
                let nums = match (l.parse::<f64>(), r.parse::<f64>()) {
                    (Ok(a), Ok(b)) => Some((a, b)),
                    _ => None,
                };
                let arith = |f: fn(f64, f64) -> Option<f64>, what: &str| -> Result<String, ScriptError> {
                    let (a, b) = nums.ok_or_else(|| {
                        ScriptError::Runtime(format!("{what} needs numbers, got {l:?} and {r:?}"))
                    })?;
                    f(a, b)
                        .map(|x| format!("{x}"))
                        .ok_or_else(|| ScriptError::Runtime(format!("{what} by zero")))
                };

                match op {
                    BinaryOperator::Add => match nums {
                        Some((a, b)) => Ok(format!("{}", a + b)),
                        None => Ok(format!("{l_raw}{r_raw}")),
                    },
                    BinaryOperator::Sub => arith(|a, b| Some(a - b), "subtraction"),
                    BinaryOperator::Mul => arith(|a, b| Some(a * b), "multiplication"),
                    BinaryOperator::Div => arith(|a, b| (b != 0.0).then(|| a / b), "division"),
                    BinaryOperator::Mod => arith(|a, b| (b != 0.0).then(|| a % b), "modulo"),
                    BinaryOperator::Gt => Ok((compare(l, r) == Ordering::Greater).to_string()),
                    BinaryOperator::Lt => Ok((compare(l, r) == Ordering::Less).to_string()),
                    BinaryOperator::Ge => Ok((compare(l, r) != Ordering::Less).to_string()),
                    BinaryOperator::Le => Ok((compare(l, r) != Ordering::Greater).to_string()),
                    BinaryOperator::Eq => Ok((compare(l, r) == Ordering::Equal).to_string()),
                    BinaryOperator::Ne => Ok((compare(l, r) != Ordering::Equal).to_string()),
                    BinaryOperator::And => Ok((truthy(l) && truthy(r)).to_string()),
                    BinaryOperator::Or => Ok((truthy(l) || truthy(r)).to_string()),
                }
            }
        }
    }
}

/* ----------------------------- Helpers ------------------------------- */

/// Numeric when both sides parse, otherwise case-insensitive text.
fn compare(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.to_lowercase().cmp(&b.to_lowercase()),
    }
}

fn truthy(value: &str) -> bool {
    let v = value.trim().to_ascii_lowercase();
    match v.as_str() {
        "" | "false" | "none" => false,
        _ => v.parse::<f64>().map_or(true, |n| n != 0.0),
    }
}

fn repeat_count(raw: &str) -> Option<u64> {
    let n = raw.trim().parse::<f64>().ok()?;
    (n.is_finite() && n >= 0.0 && n.fract() == 0.0).then_some(n as u64)
}
