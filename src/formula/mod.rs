//! The small numeric formula language used by message templates and channel
//! acceptance patterns.
//!
//! A formula is compiled once into a [`Processor`] and evaluated many times
//! against an input value and a [`Context`] of named parameters. Evaluation
//! never fails: `NaN` is the sentinel for "rejected/undefined", which lets
//! the same language both gate values (acceptance patterns) and compute them
//! (message data bytes).
//!
//! Grammar:
//!
//! ```text
//! formula      :=  alternative ("," alternative)*
//! alternative  :=  step ("|" step)*
//! step         :=  lo-hi            keep the value iff ⌊value⌋ is in lo..=hi
//!               |  n                shorthand for n-n
//!               |  set   x          replace the value with x
//!               |  add   x          value + x
//!               |  sub   x          value - x
//!               |  mult  x          value * x
//!               |  div   x          value / x
//!               |  get   NAME       store the value into the context slot
//! ```
//!
//! `x` is a number or a context name; an absent name resolves to `NaN` and
//! thereby rejects. Alternatives are tried in order and the first one whose
//! step chain yields a non-`NaN` result wins.

use thiserror::Error;

/// Named float parameters bound into a formula at evaluation time.
pub trait Context {
    /// Current value of `name`, `NaN` when unset.
    fn get(&self, name: &str) -> f32;

    fn set(&mut self, name: &str, value: f32);
}

/// Context with no parameters: every lookup rejects, every store is dropped.
///
/// Used for channel acceptance patterns, which operate on the input value
/// alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyContext;

impl Context for EmptyContext {
    fn get(&self, _name: &str) -> f32 {
        f32::NAN
    }

    fn set(&mut self, _name: &str, _value: f32) {}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormulaError {
    #[error("empty step in formula")]
    EmptyStep,

    #[error("unknown op `{0}`")]
    UnknownOp(String),

    #[error("malformed number `{0}`")]
    MalformedNumber(String),

    #[error("reversed range {0}-{1}")]
    ReversedRange(i32, i32),

    #[error("op `{0}` is missing its operand")]
    MissingOperand(String),

    #[error("`get` needs a name, not a number")]
    GetNeedsName,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Number(f32),
    Name(String),
}

impl Operand {
    fn parse(token: &str) -> Self {
        match token.parse::<f32>() {
            Ok(number) => Operand::Number(number),
            Err(_) => Operand::Name(token.to_owned()),
        }
    }

    fn resolve(&self, ctx: &dyn Context) -> f32 {
        match self {
            Operand::Number(number) => *number,
            Operand::Name(name) => ctx.get(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    /// Pass the value through iff its floor lies in `lo..=hi`.
    Gate { lo: i32, hi: i32 },
    Set(Operand),
    Add(Operand),
    Sub(Operand),
    Mult(Operand),
    Div(Operand),
    Get(String),
}

impl Step {
    fn apply(&self, value: f32, ctx: &mut dyn Context) -> f32 {
        match self {
            Step::Gate { lo, hi } => {
                let floor = value.floor();
                if floor >= *lo as f32 && floor <= *hi as f32 {
                    value
                } else {
                    f32::NAN
                }
            }
            Step::Set(operand) => operand.resolve(ctx),
            Step::Add(operand) => value + operand.resolve(ctx),
            Step::Sub(operand) => value - operand.resolve(ctx),
            Step::Mult(operand) => value * operand.resolve(ctx),
            Step::Div(operand) => {
                let divisor = operand.resolve(ctx);
                // Float division by zero would yield an infinity, not the
                // NaN rejection sentinel.
                if divisor == 0.0 {
                    f32::NAN
                } else {
                    value / divisor
                }
            }
            Step::Get(name) => {
                ctx.set(name, value);
                value
            }
        }
    }
}

/// A compiled formula, reusable and deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct Processor {
    alternatives: Vec<Vec<Step>>,
    source: String,
}

impl Processor {
    /// Compile `formula`. A blank formula is valid and rejects every input.
    pub fn compile(formula: &str) -> Result<Self, FormulaError> {
        let mut alternatives = Vec::new();

        if !formula.trim().is_empty() {
            for alternative in formula.split(',') {
                let mut steps = Vec::new();
                for step in alternative.split('|') {
                    steps.push(parse_step(step.trim())?);
                }
                alternatives.push(steps);
            }
        }

        Ok(Self {
            alternatives,
            source: formula.to_owned(),
        })
    }

    /// Evaluate against `input`; `NaN` signals rejection.
    pub fn process(&self, input: f32, ctx: &mut dyn Context) -> f32 {
        for steps in &self.alternatives {
            let mut value = input;
            for step in steps {
                value = step.apply(value, ctx);
                if value.is_nan() {
                    break;
                }
            }
            if !value.is_nan() {
                return value;
            }
        }
        f32::NAN
    }

    /// The formula string this processor was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }
}

fn parse_step(token: &str) -> Result<Step, FormulaError> {
    if token.is_empty() {
        return Err(FormulaError::EmptyStep);
    }

    let mut words = token.split_whitespace();
    let head = words.next().ok_or(FormulaError::EmptyStep)?;
    let operand = words.next();

    if operand.is_none() {
        return parse_gate(head);
    }

    let operand = operand.unwrap_or_default();
    match head {
        "set" => Ok(Step::Set(Operand::parse(operand))),
        "add" => Ok(Step::Add(Operand::parse(operand))),
        "sub" => Ok(Step::Sub(Operand::parse(operand))),
        "mult" => Ok(Step::Mult(Operand::parse(operand))),
        "div" => Ok(Step::Div(Operand::parse(operand))),
        "get" => match Operand::parse(operand) {
            Operand::Name(name) => Ok(Step::Get(name)),
            Operand::Number(_) => Err(FormulaError::GetNeedsName),
        },
        other => Err(FormulaError::UnknownOp(other.to_owned())),
    }
}

/// A single token is a gate: either a range `lo-hi` or a bare integer.
fn parse_gate(token: &str) -> Result<Step, FormulaError> {
    match token {
        "set" | "add" | "sub" | "mult" | "div" | "get" => {
            return Err(FormulaError::MissingOperand(token.to_owned()));
        }
        _ => {}
    }

    if let Some((lo, hi)) = token.split_once('-') {
        let lo = parse_int(lo.trim())?;
        let hi = parse_int(hi.trim())?;
        if lo > hi {
            return Err(FormulaError::ReversedRange(lo, hi));
        }
        return Ok(Step::Gate { lo, hi });
    }

    let n = parse_int(token)?;
    Ok(Step::Gate { lo: n, hi: n })
}

fn parse_int(token: &str) -> Result<i32, FormulaError> {
    token
        .parse::<i32>()
        .map_err(|_| FormulaError::MalformedNumber(token.to_owned()))
}
