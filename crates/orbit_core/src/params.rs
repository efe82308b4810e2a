//! Parameter containers and keyed parameter mutation.
//!
//! The rule only ever sees `&P`. Mutation goes through [`ParameterSet`], which
//! the handle calls from `set_parameter`.

use crate::error::{EvolutionError, EvolutionResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Addresses one parameter, either by position or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamKey {
    Index(usize),
    Name(String),
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKey::Index(i) => write!(f, "#{i}"),
            ParamKey::Name(name) => f.write_str(name),
        }
    }
}

impl From<usize> for ParamKey {
    fn from(value: usize) -> Self {
        ParamKey::Index(value)
    }
}

impl From<&str> for ParamKey {
    fn from(value: &str) -> Self {
        ParamKey::Name(value.to_string())
    }
}

impl From<String> for ParamKey {
    fn from(value: String) -> Self {
        ParamKey::Name(value)
    }
}

/// A parameter container that supports replacing one field.
pub trait ParameterSet {
    /// Replaces the field addressed by `key`.
    /// Fails with [`EvolutionError::UnknownParameter`] and leaves the
    /// container unchanged when `key` does not exist.
    fn set_parameter(&mut self, key: &ParamKey, value: f64) -> EvolutionResult<()>;
}

impl ParameterSet for Vec<f64> {
    fn set_parameter(&mut self, key: &ParamKey, value: f64) -> EvolutionResult<()> {
        match key {
            ParamKey::Index(i) if *i < self.len() => {
                self[*i] = value;
                Ok(())
            }
            _ => Err(EvolutionError::unknown_parameter(key.to_string())),
        }
    }
}

impl ParameterSet for () {
    fn set_parameter(&mut self, key: &ParamKey, _value: f64) -> EvolutionResult<()> {
        Err(EvolutionError::unknown_parameter(key.to_string()))
    }
}

/// Ordered parameter values with names resolved to indices at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    values: Vec<f64>,
    names: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Parameters {
    pub fn new<I, S>(entries: I) -> EvolutionResult<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut values = Vec::new();
        let mut names = Vec::new();
        let mut index = HashMap::new();
        for (name, value) in entries {
            let name = name.into();
            if index.insert(name.clone(), values.len()).is_some() {
                return Err(EvolutionError::config(format!(
                    "duplicate parameter name '{name}'"
                )));
            }
            names.push(name);
            values.push(value);
        }
        Ok(Self {
            values,
            names,
            index,
        })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        // `index` is not serialized; fall back to a scan after deserialization.
        self.index
            .get(name)
            .copied()
            .or_else(|| self.names.iter().position(|n| n == name))
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.index_of(name).map(|i| self.values[i])
    }
}

impl std::ops::Index<usize> for Parameters {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.values[index]
    }
}

impl ParameterSet for Parameters {
    fn set_parameter(&mut self, key: &ParamKey, value: f64) -> EvolutionResult<()> {
        let slot = match key {
            ParamKey::Index(i) if *i < self.values.len() => Some(*i),
            ParamKey::Index(_) => None,
            ParamKey::Name(name) => self.index_of(name),
        };
        match slot {
            Some(i) => {
                self.values[i] = value;
                Ok(())
            }
            None => Err(EvolutionError::unknown_parameter(key.to_string())),
        }
    }
}
