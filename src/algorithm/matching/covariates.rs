//! Covariate specifications
//!
//! A specification is a formula-like list of terms such as
//! `~ gdp + lag(trade, 1:3) + I(pop^2) + log(area)`. Each term names one panel
//! column, optionally lagged over a range of periods and transformed.
//! `lag(x, 1:3)` expands into three covariates holding `x` at `t-1`, `t-2`
//! and `t-3`.

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::error::{PanelMatchError, Result};
use crate::panel::{Panel, PanelColumn, UnitId};

/// Transformation applied to a covariate value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Value as read
    Identity,
    /// Natural logarithm; non-positive values count as missing
    Log,
    /// Integer power, written `I(x^k)`
    Power(i32),
}

impl Transform {
    /// Apply the transformation, returning `None` for non-finite results
    #[must_use]
    pub fn apply(self, value: f64) -> Option<f64> {
        let out = match self {
            Self::Identity => value,
            Self::Log => value.ln(),
            Self::Power(k) => value.powi(k),
        };
        out.is_finite().then_some(out)
    }
}

/// One term of a covariate specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CovariateTerm {
    /// Panel column the term reads
    pub variable: String,
    /// Lag offsets, `None` for the current period only
    pub lags: Option<RangeInclusive<usize>>,
    /// Transformation applied to each value read
    pub transform: Transform,
}

impl CovariateTerm {
    /// Plain term reading `variable` at the evaluation period
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            lags: None,
            transform: Transform::Identity,
        }
    }

    /// Lag offsets this term reads, `[0]` for unlagged terms
    fn offsets(&self) -> RangeInclusive<usize> {
        self.lags.clone().unwrap_or(0..=0)
    }

    fn base_name(&self) -> String {
        match self.transform {
            Transform::Identity => self.variable.clone(),
            Transform::Log => format!("log({})", self.variable),
            Transform::Power(k) => format!("I({}^{k})", self.variable),
        }
    }

    /// Names of the covariates this term expands into
    #[must_use]
    pub fn expanded_names(&self) -> Vec<String> {
        let base = self.base_name();
        match &self.lags {
            None => vec![base],
            Some(lags) => lags.clone().map(|l| format!("{base}_l{l}")).collect(),
        }
    }

    /// Number of covariates this term expands into
    #[must_use]
    pub fn width(&self) -> usize {
        self.offsets().count()
    }
}

impl fmt::Display for CovariateTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lags {
            None => f.write_str(&self.base_name()),
            Some(lags) if lags.start() == lags.end() => {
                write!(f, "lag({}, {})", self.base_name(), lags.start())
            }
            Some(lags) => write!(f, "lag({}, {}:{})", self.base_name(), lags.start(), lags.end()),
        }
    }
}

/// Ordered list of covariate terms
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CovariateSpec {
    terms: Vec<CovariateTerm>,
}

impl CovariateSpec {
    /// Build a specification from terms
    #[must_use]
    pub const fn new(terms: Vec<CovariateTerm>) -> Self {
        Self { terms }
    }

    /// Parse a formula such as `~ x + lag(y, 1:3) + I(z^2) + log(w)`
    ///
    /// The leading `~` is optional. An empty formula yields an empty
    /// specification.
    ///
    /// # Errors
    ///
    /// Returns [`PanelMatchError::Configuration`] for malformed terms.
    pub fn parse(formula: &str) -> Result<Self> {
        let body = formula.trim();
        let body = body.strip_prefix('~').unwrap_or(body).trim();
        if body.is_empty() {
            return Ok(Self::default());
        }

        let terms = split_top_level(body, '+')?
            .into_iter()
            .map(parse_term)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { terms })
    }

    /// Terms in declaration order
    #[must_use]
    pub fn terms(&self) -> &[CovariateTerm] {
        &self.terms
    }

    /// Whether the specification has no terms
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Number of covariates after lag expansion
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.terms.iter().map(CovariateTerm::width).sum()
    }

    /// Names of the covariates after lag expansion
    #[must_use]
    pub fn expanded_names(&self) -> Vec<String> {
        self.terms.iter().flat_map(CovariateTerm::expanded_names).collect()
    }

    /// Distinct panel columns the specification reads, in first-use order
    #[must_use]
    pub fn variables(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for term in &self.terms {
            if !seen.contains(&term.variable) {
                seen.push(term.variable.clone());
            }
        }
        seen
    }

    /// Resolve the specification against a panel's columns
    ///
    /// # Errors
    ///
    /// Returns [`PanelMatchError::DataValidation`] if a referenced column is
    /// not part of the panel or holds category codes.
    pub fn resolve<'a>(&self, panel: &'a Panel) -> Result<CovariateFrame<'a>> {
        let mut components = Vec::with_capacity(self.dimension());
        for term in &self.terms {
            let column = panel.column(&term.variable).ok_or_else(|| {
                PanelMatchError::data(format!(
                    "Covariate column '{}' is not part of the panel",
                    term.variable
                ))
            })?;
            if column.is_categorical() {
                return Err(PanelMatchError::data(format!(
                    "Covariate column '{}' holds categories; use it as an exact match variable",
                    term.variable
                )));
            }
            for lag in term.offsets() {
                components.push(Component {
                    column,
                    lag: lag as i64,
                    transform: term.transform,
                });
            }
        }
        Ok(CovariateFrame { panel, components })
    }

    /// Covariate vector of `unit` at `period`
    ///
    /// Returns `None` when any component is missing, outside the panel, or
    /// when a referenced column does not exist.
    #[must_use]
    pub fn vector(&self, panel: &Panel, unit: UnitId, period: i64) -> Option<Vec<f64>> {
        self.resolve(panel).ok()?.vector(unit, period)
    }
}

impl fmt::Display for CovariateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("~ ")?;
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(" + ")?;
            }
            write!(f, "{term}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for CovariateSpec {
    type Error = PanelMatchError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<CovariateSpec> for String {
    fn from(spec: CovariateSpec) -> Self {
        if spec.is_empty() {
            Self::new()
        } else {
            spec.to_string()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Component<'a> {
    column: &'a PanelColumn,
    lag: i64,
    transform: Transform,
}

/// Covariate specification bound to the columns of one panel
#[derive(Debug, Clone)]
pub struct CovariateFrame<'a> {
    panel: &'a Panel,
    components: Vec<Component<'a>>,
}

impl CovariateFrame<'_> {
    /// Number of covariates per vector
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.components.len()
    }

    /// Covariate vector of `unit` at `period`, `None` if any component is missing
    #[must_use]
    pub fn vector(&self, unit: UnitId, period: i64) -> Option<Vec<f64>> {
        self.components
            .iter()
            .map(|c| {
                self.panel
                    .value(c.column, unit, period - c.lag)
                    .and_then(|v| c.transform.apply(v))
            })
            .collect()
    }

    /// Whether every component is present for `unit` at `period`
    #[must_use]
    pub fn is_complete(&self, unit: UnitId, period: i64) -> bool {
        self.components.iter().all(|c| {
            self.panel
                .value(c.column, unit, period - c.lag)
                .and_then(|v| c.transform.apply(v))
                .is_some()
        })
    }
}

fn split_top_level(input: &str, separator: char) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, ch) in input.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    PanelMatchError::config(format!("Unbalanced parentheses in '{input}'"))
                })?;
            }
            c if c == separator && depth == 0 => {
                parts.push(input[start..i].trim());
                start = i + ch.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(PanelMatchError::config(format!(
            "Unbalanced parentheses in '{input}'"
        )));
    }
    parts.push(input[start..].trim());

    if parts.iter().any(|p| p.is_empty()) {
        return Err(PanelMatchError::config(format!("Empty term in '{input}'")));
    }
    Ok(parts)
}

fn call<'a>(term: &'a str, function: &str) -> Option<&'a str> {
    term.strip_prefix(function)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

fn parse_variable(name: &str) -> Result<String> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '.')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(name.to_string())
    } else {
        Err(PanelMatchError::config(format!(
            "'{name}' is not a valid covariate name"
        )))
    }
}

fn parse_base(term: &str) -> Result<(String, Transform)> {
    if let Some(inner) = call(term, "log") {
        return Ok((parse_variable(inner)?, Transform::Log));
    }
    if let Some(inner) = call(term, "I") {
        let (variable, power) = inner.split_once('^').ok_or_else(|| {
            PanelMatchError::config(format!("Expected I(x^k), found '{term}'"))
        })?;
        let power = power.trim().parse::<i32>().map_err(|_| {
            PanelMatchError::config(format!("Power in '{term}' must be an integer"))
        })?;
        return Ok((parse_variable(variable.trim())?, Transform::Power(power)));
    }
    Ok((parse_variable(term)?, Transform::Identity))
}

fn parse_lags(spec: &str) -> Result<RangeInclusive<usize>> {
    let parse = |s: &str| {
        s.trim().parse::<usize>().map_err(|_| {
            PanelMatchError::config(format!("Lag '{spec}' must be a non-negative integer range"))
        })
    };
    let (from, to) = match spec.split_once(':') {
        Some((a, b)) => (parse(a)?, parse(b)?),
        None => {
            let l = parse(spec)?;
            (l, l)
        }
    };
    if from > to {
        return Err(PanelMatchError::config(format!(
            "Lag range '{spec}' is decreasing"
        )));
    }
    Ok(from..=to)
}

fn parse_term(term: &str) -> Result<CovariateTerm> {
    if let Some(inner) = call(term, "lag") {
        let args = split_top_level(inner, ',')?;
        let [base, lags] = args.as_slice() else {
            return Err(PanelMatchError::config(format!(
                "Expected lag(x, a:b), found '{term}'"
            )));
        };
        let (variable, transform) = parse_base(base)?;
        return Ok(CovariateTerm {
            variable,
            lags: Some(parse_lags(lags)?),
            transform,
        });
    }

    let (variable, transform) = parse_base(term)?;
    Ok(CovariateTerm {
        variable,
        lags: None,
        transform,
    })
}
