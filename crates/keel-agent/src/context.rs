//! Per-recipe execution environment.

use keel_core::resource::ResourceProperty;
use keel_core::variables::resolve_references;
use keel_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const PATH_VAR: &str = "PATH";

/// Environment, search path and property values every command of a recipe
/// runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    env: BTreeMap<String, String>,
    /// Directories prepended to the inherited `PATH`, first entry first.
    path: Vec<PathBuf>,
    properties: Vec<(String, String)>,
}

impl ExecutionContext {
    /// Resolve `properties` against the base environment.
    ///
    /// Properties flagged for resolution have their `${name}` references
    /// replaced from the property set, in declaration order: a reference to
    /// an earlier property sees its resolved value, a later one its raw
    /// value. The base environment is never consulted for references.
    /// Properties flagged for the environment are added to it (later names
    /// win), those flagged for the path are prepended to `PATH` in
    /// declaration order.
    pub fn resolve<I>(base_env: I, properties: &[ResourceProperty]) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut values: HashMap<String, String> = properties
            .iter()
            .map(|p| (p.name().to_string(), p.value().to_string()))
            .collect();

        let mut resolved = Vec::with_capacity(properties.len());
        for property in properties {
            let value = if property.resolve_variables() {
                resolve_references(property.name(), property.value(), |name| {
                    values.get(name).map(String::as_str)
                })?
            } else {
                property.value().to_string()
            };
            values.insert(property.name().to_string(), value.clone());
            resolved.push((property.name().to_string(), value));
        }

        let mut env: BTreeMap<String, String> = base_env.into_iter().collect();
        let mut path = Vec::new();
        for (property, (name, value)) in properties.iter().zip(&resolved) {
            if property.add_to_environment() {
                env.insert(name.clone(), value.clone());
            }
            if property.add_to_path() {
                path.push(PathBuf::from(value));
            }
        }

        let mut context = Self {
            env,
            path,
            properties: resolved,
        };
        context.env.insert(PATH_VAR.to_string(), context.joined_path()?);
        Ok(context)
    }

    /// Context built from the agent process environment.
    pub fn from_process(properties: &[ResourceProperty]) -> Result<Self> {
        Self::resolve(std::env::vars(), properties)
    }

    fn joined_path(&self) -> Result<String> {
        let inherited: Vec<PathBuf> = self
            .env
            .get(PATH_VAR)
            .map(|p| std::env::split_paths(p).collect())
            .unwrap_or_default();
        let joined: OsString = std::env::join_paths(self.path.iter().chain(inherited.iter()))
            .map_err(|e| Error::InvalidConfiguration(format!("invalid search path entry: {}", e)))?;
        joined
            .into_string()
            .map_err(|_| Error::InvalidConfiguration("search path is not valid UTF-8".to_string()))
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    /// Full search path, added entries first.
    pub fn search_path(&self) -> Vec<PathBuf> {
        self.var(PATH_VAR)
            .map(|p| std::env::split_paths(p).collect())
            .unwrap_or_default()
    }

    /// Resolved value of a property.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Copy of the context with extra variables set, e.g. per-command
    /// directories.
    pub fn with_vars<'a, I>(&self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a Path)>,
    {
        let mut context = self.clone();
        for (name, path) in vars {
            context
                .env
                .insert(name.to_string(), path.to_string_lossy().into_owned());
        }
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn base() -> Vec<(String, String)> {
        vec![
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            ("HOME".to_string(), "/home/agent".to_string()),
        ]
    }

    fn prop(name: &str, value: &str) -> ResourceProperty {
        ResourceProperty::new(name, value).unwrap()
    }

    #[test]
    fn test_path_property_is_first_search_entry() {
        let properties = vec![
            prop("tool.bin", "/opt/tool/bin").with_add_to_path(true),
            prop("other.bin", "/opt/other/bin").with_add_to_path(true),
        ];
        let context = ExecutionContext::resolve(base(), &properties).unwrap();

        let path = context.search_path();
        assert_eq!(path[0], PathBuf::from("/opt/tool/bin"));
        assert_eq!(path[1], PathBuf::from("/opt/other/bin"));
        assert_eq!(path[2], PathBuf::from("/usr/bin"));
    }

    #[test]
    fn test_references_resolve_from_property_set() {
        let properties = vec![
            prop("HOME", "/opt/home"),
            prop("TOOL_BIN", "${HOME}/bin")
                .with_resolve_variables(true)
                .with_add_to_environment(true),
        ];
        let context = ExecutionContext::resolve(base(), &properties).unwrap();

        assert_eq!(context.property("TOOL_BIN"), Some("/opt/home/bin"));
        assert_eq!(context.var("TOOL_BIN"), Some("/opt/home/bin"));
        // Not flagged for the environment, so the inherited value stays.
        assert_eq!(context.var("HOME"), Some("/home/agent"));
    }

    #[test]
    fn test_undefined_reference_is_an_error() {
        let properties = vec![prop("TOOL_BIN", "${MISSING}/bin").with_resolve_variables(true)];
        let err = ExecutionContext::resolve(base(), &properties).unwrap_err();
        assert!(matches!(
            err,
            Error::UnresolvedVariable { ref variable, .. } if variable == "MISSING"
        ));
    }

    #[test]
    fn test_unflagged_value_kept_literally() {
        let properties = vec![prop("RAW", "${NOT_RESOLVED}").with_add_to_environment(true)];
        let context = ExecutionContext::resolve(base(), &properties).unwrap();
        assert_eq!(context.var("RAW"), Some("${NOT_RESOLVED}"));
    }

    #[test]
    fn test_base_environment_not_used_for_references() {
        let properties = vec![prop("X", "${HOME}").with_resolve_variables(true)];
        assert!(ExecutionContext::resolve(base(), &properties).is_err());
    }
}
