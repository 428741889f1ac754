//! Named-axis numeric vectors and the callable boundary used by integrators.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Index, Mul, Neg, Sub};

use crate::error::Result;

/// A point or tangent in named-axis space.
///
/// Lookups of an axis that was never set read as `0.0`, and arithmetic treats the
/// union of both operands' axes with the same default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vector(BTreeMap<String, f64>);

impl Vector {
    pub fn new() -> Self {
        Vector(BTreeMap::new())
    }

    pub fn get(&self, axis: &str) -> f64 {
        self.0.get(axis).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, axis: &str) -> bool {
        self.0.contains_key(axis)
    }

    pub fn insert(&mut self, axis: impl Into<String>, value: f64) -> Option<f64> {
        self.0.insert(axis.into(), value)
    }

    pub fn with(mut self, axis: impl Into<String>, value: f64) -> Self {
        self.insert(axis, value);
        self
    }

    pub fn axes(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn dot(&self, other: &Vector) -> f64 {
        self.0.iter().map(|(k, v)| v * other.get(k)).sum()
    }

    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    fn zip_with(&self, other: &Vector, f: impl Fn(f64, f64) -> f64) -> Vector {
        let mut out = self.clone();
        for (axis, value) in &other.0 {
            out.0.insert(axis.clone(), f(self.get(axis), *value));
        }
        for (axis, value) in out.0.iter_mut() {
            if !other.0.contains_key(axis) {
                *value = f(*value, 0.0);
            }
        }
        out
    }

    pub fn into_inner(self) -> BTreeMap<String, f64> {
        self.0
    }
}

impl Index<&str> for Vector {
    type Output = f64;

    fn index(&self, axis: &str) -> &f64 {
        self.0.get(axis).unwrap_or(&0.0)
    }
}

impl From<BTreeMap<String, f64>> for Vector {
    fn from(values: BTreeMap<String, f64>) -> Self {
        Vector(values)
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Vector {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Vector(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl<'a> IntoIterator for &'a Vector {
    type Item = (&'a String, &'a f64);
    type IntoIter = std::collections::btree_map::Iter<'a, String, f64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Add for &Vector {
    type Output = Vector;

    fn add(self, rhs: &Vector) -> Vector {
        self.zip_with(rhs, |a, b| a + b)
    }
}

impl Sub for &Vector {
    type Output = Vector;

    fn sub(self, rhs: &Vector) -> Vector {
        self.zip_with(rhs, |a, b| a - b)
    }
}

impl Mul<f64> for &Vector {
    type Output = Vector;

    fn mul(self, rhs: f64) -> Vector {
        Vector(self.0.iter().map(|(k, v)| (k.clone(), v * rhs)).collect())
    }
}

impl Mul<&Vector> for f64 {
    type Output = Vector;

    fn mul(self, rhs: &Vector) -> Vector {
        rhs * self
    }
}

impl Neg for &Vector {
    type Output = Vector;

    fn neg(self) -> Vector {
        self * -1.0
    }
}

impl Add for Vector {
    type Output = Vector;

    fn add(self, rhs: Vector) -> Vector {
        &self + &rhs
    }
}

impl Sub for Vector {
    type Output = Vector;

    fn sub(self, rhs: Vector) -> Vector {
        &self - &rhs
    }
}

impl Mul<f64> for Vector {
    type Output = Vector;

    fn mul(self, rhs: f64) -> Vector {
        &self * rhs
    }
}

impl Neg for Vector {
    type Output = Vector;

    fn neg(self) -> Vector {
        -&self
    }
}

/// Two-column `axis | <header>` table.
pub(crate) fn render_table<'a>(
    f: &mut fmt::Formatter<'_>,
    header: &str,
    rows: impl Iterator<Item = (&'a str, String)>,
) -> fmt::Result {
    let rows: Vec<(&str, String)> = rows.collect();
    let left = rows.iter().map(|(k, _)| k.len()).chain(Some("axis".len())).max().unwrap_or(4);
    let right = rows.iter().map(|(_, v)| v.len()).chain(Some(header.len())).max().unwrap_or(0);
    writeln!(f, "{:<left$} | {:<right$}", "axis", header, left = left, right = right)?;
    writeln!(f, "{}-+-{}", "-".repeat(left), "-".repeat(right))?;
    for (axis, value) in rows {
        writeln!(f, "{:<left$} | {:<right$}", axis, value, left = left, right = right)?;
    }
    Ok(())
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render_table(f, "value", self.iter().map(|(k, v)| (k, v.to_string())))
    }
}

/// Anything that maps a state vector to a derivative vector.
///
/// This is the only surface integrators and finite-difference checks rely on.
pub trait VectorFunction {
    fn apply(&self, state: &Vector) -> Result<Vector>;
}

impl<F> VectorFunction for F
where
    F: Fn(&Vector) -> Vector,
{
    fn apply(&self, state: &Vector) -> Result<Vector> {
        Ok(self(state))
    }
}
