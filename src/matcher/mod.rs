//! Pattern matching against facts.
//!
//! A pattern is an ordinary JSON value in which strings starting with `?` are
//! variables. Matching returns every binding set under which the pattern
//! unifies with the fact:
//! - an empty result means no match
//! - more than one result means the pattern matched in several ways (list
//!   backtracking, property variables)
//!
//! Variable forms:
//! - `?x` binds (or checks) `?x`
//! - `?` is anonymous and binds nothing
//! - `??x` is optional: a missing map key or an empty list remainder is fine
//! - `?<x`, `?<=x`, `?>x`, `?>=x`, `?!=x` test the fact against the number
//!   bound to that variable and then bind `?x` to the fact
//!
//! A list pattern denotes a set: its elements are matched against fact
//! elements in any order, each fact element consumed at most once.

mod bindings;

pub use bindings::{is_permanent, Bindings, PERMANENT_SUFFIX};

use crate::types::{Error, Result};
use serde_json::{Map, Value};

const INEQUALITIES: [&str; 5] = ["<=", ">=", "!=", "<", ">"];

// =============================================================================
// Variables
// =============================================================================

pub fn is_variable(s: &str) -> bool {
    s.starts_with('?')
}

pub fn is_anonymous_variable(s: &str) -> bool {
    s == "?"
}

pub fn is_optional_variable(s: &str) -> bool {
    s.starts_with("??")
}

fn is_optional_pattern(v: &Value) -> bool {
    v.as_str().map(is_optional_variable).unwrap_or(false)
}

fn is_scalar(v: &Value) -> bool {
    !matches!(v, Value::Object(_) | Value::Array(_))
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

// =============================================================================
// Matcher
// =============================================================================

/// Pattern matcher with feature switches.
#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    /// Allow a variable as the sole key of a map pattern.
    pub allow_property_variables: bool,
    /// Reject map patterns mixing a variable key with other keys.
    pub check_for_bad_property_variables: bool,
    /// Enable `?<x`-style inequality variables.
    pub inequalities: bool,
}

impl Default for Matcher {
    fn default() -> Self {
        Self {
            allow_property_variables: true,
            check_for_bad_property_variables: true,
            inequalities: true,
        }
    }
}

/// Match with the default matcher.
pub fn match_pattern(pattern: &Value, fact: &Value, bindings: &Bindings) -> Result<Vec<Bindings>> {
    Matcher::default().match_with(pattern, fact, bindings)
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match against empty bindings.
    pub fn matches(&self, pattern: &Value, fact: &Value) -> Result<Vec<Bindings>> {
        self.match_with(pattern, fact, &Bindings::new())
    }

    /// Match `pattern` against `fact` extending `bindings`, which is never
    /// modified.
    pub fn match_with(
        &self,
        pattern: &Value,
        fact: &Value,
        bindings: &Bindings,
    ) -> Result<Vec<Bindings>> {
        self.match_value(pattern, fact, bindings.clone())
    }

    fn match_value(&self, pattern: &Value, fact: &Value, bs: Bindings) -> Result<Vec<Bindings>> {
        let matched = match pattern {
            Value::Null => fact.is_null(),
            Value::Bool(b) => fact.as_bool() == Some(*b),
            Value::Number(_) => matches!(fact, Value::Number(_)) && scalar_eq(pattern, fact),
            Value::String(s) if is_variable(s) => return self.match_variable(s, fact, bs),
            Value::String(s) => fact.as_str() == Some(s.as_str()),
            Value::Object(m) => {
                return match fact {
                    Value::Object(_) if m.is_empty() => Ok(vec![bs]),
                    Value::Object(fm) => self.match_map(vec![bs], m, fm),
                    _ => Ok(Vec::new()),
                }
            }
            Value::Array(xs) => {
                return match fact {
                    Value::Array(fs) => self.match_list(xs, fs, bs),
                    _ => Ok(Vec::new()),
                }
            }
        };
        Ok(if matched { vec![bs] } else { Vec::new() })
    }

    fn match_variable(&self, var: &str, fact: &Value, mut bs: Bindings) -> Result<Vec<Bindings>> {
        if is_anonymous_variable(var) {
            return Ok(vec![bs]);
        }
        if let Some(result) = self.inequal(var, fact, &bs) {
            return Ok(result);
        }
        match bs.get(var).cloned() {
            Some(bound) => self.match_value(&bound, fact, bs),
            None => {
                bs.insert(var.to_string(), fact.clone());
                Ok(vec![bs])
            }
        }
    }

    /// Inequality check for `?<x`-style variables. `None` when `var` isn't
    /// an inequality over a numeric binding and numeric fact.
    fn inequal(&self, var: &str, fact: &Value, bs: &Bindings) -> Option<Vec<Bindings>> {
        if !self.inequalities || var.len() < 3 {
            return None;
        }
        let bound = bs.get(var)?.as_f64()?;
        let x = fact.as_f64()?;
        let rest = &var[1..];
        let op = INEQUALITIES.iter().find(|op| rest.starts_with(**op))?;
        let name = format!("?{}", &rest[op.len()..]);

        let holds = match *op {
            "<=" => x <= bound,
            ">=" => x >= bound,
            "!=" => x != bound,
            "<" => x < bound,
            ">" => x > bound,
            _ => return None,
        };
        if !holds {
            return Some(Vec::new());
        }
        match bs.get(&name) {
            Some(existing) => {
                let existing = existing.as_f64()?;
                Some(if existing == x { vec![bs.clone()] } else { Vec::new() })
            }
            None => Some(vec![bs.extend_with(name, fact.clone())]),
        }
    }

    fn match_all(&self, bss: Vec<Bindings>, pattern: &Value, fact: &Value) -> Result<Vec<Bindings>> {
        let mut acc = Vec::new();
        for bs in bss {
            acc.extend(self.match_value(pattern, fact, bs)?);
        }
        Ok(acc)
    }

    fn check_property_variables(&self, pattern: &Map<String, Value>) -> Result<()> {
        if self.check_for_bad_property_variables && pattern.len() > 1 {
            if let Some(k) = pattern.keys().find(|k| is_variable(k)) {
                return Err(bad_property_variable(k));
            }
        }
        Ok(())
    }

    fn match_map(
        &self,
        mut bss: Vec<Bindings>,
        pattern: &Map<String, Value>,
        fact: &Map<String, Value>,
    ) -> Result<Vec<Bindings>> {
        self.check_property_variables(pattern)?;

        for (k, v) in pattern {
            if is_variable(k) {
                if !self.allow_property_variables {
                    return Err(Error::BadPropertyVariable(format!(
                        "property variables are disabled (\"{}\")",
                        k
                    )));
                }
                if pattern.len() != 1 {
                    return Err(bad_property_variable(k));
                }
                let key_pattern = Value::String(k.clone());
                let mut gathered = Vec::new();
                for (fk, fv) in fact {
                    let keyed = self.match_all(bss.clone(), &key_pattern, &Value::String(fk.clone()))?;
                    if keyed.is_empty() {
                        continue;
                    }
                    gathered.extend(self.match_all(keyed, v, fv)?);
                }
                return Ok(gathered);
            }

            match fact.get(k) {
                None if is_optional_pattern(v) => continue,
                None => return Ok(Vec::new()),
                Some(fv) => {
                    bss = self.match_all(bss, v, fv)?;
                    if bss.is_empty() {
                        return Ok(bss);
                    }
                }
            }
        }
        Ok(bss)
    }

    fn match_list(&self, pattern: &[Value], fact: &[Value], bs: Bindings) -> Result<Vec<Bindings>> {
        let (var, elements) = split_list_variable(pattern)?;

        let mut scalars: Vec<&Value> = fact.iter().filter(|f| is_scalar(f)).collect();
        let complex: Vec<&Value> = fact.iter().filter(|f| !is_scalar(f)).collect();

        let mut branches: Vec<Branch<'_>> = vec![(vec![bs], complex)];

        for x in elements {
            if is_scalar(x) {
                match scalars.iter().position(|f| scalar_eq(x, f)) {
                    Some(i) => {
                        scalars.remove(i);
                    }
                    None => return Ok(Vec::new()),
                }
            } else {
                branches = self.backtrack(branches, x)?;
                if branches.is_empty() {
                    return Ok(Vec::new());
                }
            }
        }

        for (_, pool) in branches.iter_mut() {
            pool.extend(scalars.iter().copied());
        }

        let results = match var {
            None => flatten(branches),
            Some(v) if is_anonymous_variable(v) => {
                flatten(branches.into_iter().filter(|(_, pool)| !pool.is_empty()).collect())
            }
            Some(v) => {
                let var_pattern = Value::String(v.to_string());
                let narrowed = self.backtrack(branches.clone(), &var_pattern)?;
                if narrowed.is_empty() && is_optional_variable(v) {
                    flatten(branches)
                } else {
                    flatten(narrowed)
                }
            }
        };
        Ok(dedup(results))
    }

    /// Try `pattern` against every unconsumed element of every branch,
    /// keeping each successful pairing as a new branch without that element.
    fn backtrack<'a>(&self, branches: Vec<Branch<'a>>, pattern: &Value) -> Result<Vec<Branch<'a>>> {
        let mut acc = Vec::new();
        for (bss, pool) in branches {
            for (j, candidate) in pool.iter().enumerate() {
                let matched = self.match_all(bss.clone(), pattern, candidate)?;
                if matched.is_empty() {
                    continue;
                }
                let mut rest = pool.clone();
                rest.remove(j);
                acc.push((matched, rest));
            }
        }
        Ok(acc)
    }
}

impl Matcher {
    pub fn with_inequalities(mut self, on: bool) -> Self {
        self.inequalities = on;
        self
    }

    pub fn with_property_variables(mut self, on: bool) -> Self {
        self.allow_property_variables = on;
        self
    }
}

/// Binding alternatives paired with the fact elements they have not consumed.
type Branch<'a> = (Vec<Bindings>, Vec<&'a Value>);

fn flatten(branches: Vec<Branch<'_>>) -> Vec<Bindings> {
    branches.into_iter().flat_map(|(bss, _)| bss).collect()
}

fn dedup(bss: Vec<Bindings>) -> Vec<Bindings> {
    let mut acc: Vec<Bindings> = Vec::with_capacity(bss.len());
    for bs in bss {
        if !acc.contains(&bs) {
            acc.push(bs);
        }
    }
    acc
}

fn bad_property_variable(key: &str) -> Error {
    Error::BadPropertyVariable(format!(
        "can't have a variable as a key (\"{}\") with other keys",
        key
    ))
}

fn split_list_variable(pattern: &[Value]) -> Result<(Option<&str>, Vec<&Value>)> {
    let mut var: Option<&str> = None;
    let mut elements = Vec::with_capacity(pattern.len());
    for x in pattern {
        match x.as_str() {
            Some(s) if is_variable(s) => match var {
                None => var = Some(s),
                Some(existing) if existing == s => {
                    return Err(Error::ListVariables(format!(
                        "repeated variables not supported ({})",
                        s
                    )))
                }
                Some(existing) => {
                    return Err(Error::ListVariables(format!(
                        "multiple variables not supported here ({}, {})",
                        existing, s
                    )))
                }
            },
            _ => elements.push(x),
        }
    }
    Ok((var, elements))
}

// =============================================================================
// Eager validation
// =============================================================================

/// Reject patterns that can only ever fail at match time.
pub fn validate_pattern(pattern: &Value) -> Result<()> {
    match pattern {
        Value::Object(m) => {
            if m.len() > 1 {
                if let Some(k) = m.keys().find(|k| is_variable(k)) {
                    return Err(bad_property_variable(k));
                }
            }
            m.values().try_for_each(validate_pattern)
        }
        Value::Array(xs) => {
            split_list_variable(xs)?;
            xs.iter().try_for_each(validate_pattern)
        }
        _ => Ok(()),
    }
}
