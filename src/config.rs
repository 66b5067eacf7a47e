//! Runtime variables settable via SET/RESET and inspectable via SHOW.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ArchiveError, Entity, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Bool(bool),
    Int(i64),
    Str(String),
    /// String restricted to a fixed set of allowed values.
    Enum(String),
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarValue::Bool(v) => write!(f, "{v}"),
            VarValue::Int(v) => write!(f, "{v}"),
            VarValue::Str(v) | VarValue::Enum(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone)]
struct Variable {
    value: VarValue,
    default: VarValue,
    /// Allowed values for enum variables.
    allowed: Vec<&'static str>,
}

/// The per-process variable environment. Variables are registered with
/// their defaults at startup; SET never creates new ones.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    vars: BTreeMap<String, Variable>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let mut config = RuntimeConfig {
            vars: BTreeMap::new(),
        };
        config.register("archive.default_profile", VarValue::Str("default".into()), &[]);
        config.register("basebackup.queue_depth", VarValue::Int(8), &[]);
        config.register("basebackup.block_size", VarValue::Int(4096), &[]);
        config.register("streamer.status_interval", VarValue::Int(10), &[]);
        config.register("logging.verbose", VarValue::Bool(false), &[]);
        config.register(
            "logging.format",
            VarValue::Enum("plain".into()),
            &["plain", "json"],
        );
        config
    }
}

impl RuntimeConfig {
    fn register(&mut self, name: &str, default: VarValue, allowed: &[&'static str]) {
        self.vars.insert(
            name.to_string(),
            Variable {
                value: default.clone(),
                default,
                allowed: allowed.to_vec(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Result<&VarValue> {
        self.vars
            .get(name)
            .map(|v| &v.value)
            .ok_or_else(|| ArchiveError::not_found(Entity::Variable, name))
    }

    pub fn get_int(&self, name: &str) -> Result<i64> {
        match self.get(name)? {
            VarValue::Int(v) => Ok(*v),
            _ => Err(ArchiveError::invalid(name, "not an integer variable")),
        }
    }

    /// Set a variable. The new value must match the registered type; enum
    /// variables additionally check the allowed value list.
    pub fn set(&mut self, name: &str, value: VarValue) -> Result<()> {
        let var = self
            .vars
            .get_mut(name)
            .ok_or_else(|| ArchiveError::not_found(Entity::Variable, name))?;
        match (&var.value, &value) {
            (VarValue::Bool(_), VarValue::Bool(_))
            | (VarValue::Int(_), VarValue::Int(_))
            | (VarValue::Str(_), VarValue::Str(_)) => {}
            (VarValue::Enum(_), VarValue::Str(s)) | (VarValue::Enum(_), VarValue::Enum(s)) => {
                if !var.allowed.iter().any(|a| *a == s.as_str()) {
                    return Err(ArchiveError::invalid(
                        name,
                        format!("\"{s}\" is not one of {:?}", var.allowed),
                    ));
                }
                var.value = VarValue::Enum(s.clone());
                return Ok(());
            }
            _ => {
                return Err(ArchiveError::invalid(
                    name,
                    "value type does not match the variable type",
                ))
            }
        }
        var.value = value;
        Ok(())
    }

    /// Reset a variable to its registered default.
    pub fn reset(&mut self, name: &str) -> Result<()> {
        let var = self
            .vars
            .get_mut(name)
            .ok_or_else(|| ArchiveError::not_found(Entity::Variable, name))?;
        var.value = var.default.clone();
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VarValue)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), &v.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_show_reset() {
        let mut config = RuntimeConfig::default();
        assert_eq!(config.get_int("basebackup.queue_depth").unwrap(), 8);

        config
            .set("basebackup.queue_depth", VarValue::Int(32))
            .unwrap();
        assert_eq!(config.get_int("basebackup.queue_depth").unwrap(), 32);

        config.reset("basebackup.queue_depth").unwrap();
        assert_eq!(config.get_int("basebackup.queue_depth").unwrap(), 8);

        assert!(config.set("no.such.variable", VarValue::Int(1)).is_err());
        assert!(config
            .set("basebackup.queue_depth", VarValue::Str("eight".into()))
            .is_err());
    }

    #[test]
    fn enum_variables_check_allowed_values() {
        let mut config = RuntimeConfig::default();
        config
            .set("logging.format", VarValue::Str("json".into()))
            .unwrap();
        assert!(config
            .set("logging.format", VarValue::Str("xml".into()))
            .is_err());
    }
}
