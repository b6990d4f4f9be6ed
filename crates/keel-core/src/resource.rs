//! Resource model: named tool/runtime definitions and their properties.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named value describing part of a build environment.
///
/// The three flags are independent: a property may be exported to the
/// process environment, prepended to the search path, and have `${name}`
/// references in its value resolved, in any combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProperty {
    name: String,
    value: String,
    #[serde(default)]
    add_to_environment: bool,
    #[serde(default)]
    add_to_path: bool,
    #[serde(default)]
    resolve_variables: bool,
}

impl ResourceProperty {
    /// Create a property with all flags off. The name must be non-empty.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "resource property name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name,
            value: value.into(),
            add_to_environment: false,
            add_to_path: false,
            resolve_variables: false,
        })
    }

    pub fn with_add_to_environment(mut self, flag: bool) -> Self {
        self.add_to_environment = flag;
        self
    }

    pub fn with_add_to_path(mut self, flag: bool) -> Self {
        self.add_to_path = flag;
        self
    }

    pub fn with_resolve_variables(mut self, flag: bool) -> Self {
        self.resolve_variables = flag;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn add_to_environment(&self) -> bool {
        self.add_to_environment
    }

    pub fn add_to_path(&self) -> bool {
        self.add_to_path
    }

    pub fn resolve_variables(&self) -> bool {
        self.resolve_variables
    }
}

/// One version of a resource: its properties ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVersion {
    pub value: String,
    #[serde(default)]
    properties: BTreeMap<String, ResourceProperty>,
}

impl ResourceVersion {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Add a property. Fails if one with the same name exists; delete it
    /// first to replace it.
    pub fn add_property(&mut self, property: ResourceProperty) -> Result<()> {
        if let Some(existing) = self.properties.get(property.name()) {
            return Err(Error::DuplicateProperty {
                name: property.name().to_string(),
                existing: existing.value().to_string(),
            });
        }
        self.properties.insert(property.name().to_string(), property);
        Ok(())
    }

    pub fn delete_property(&mut self, name: &str) -> Option<ResourceProperty> {
        self.properties.remove(name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn property(&self, name: &str) -> Option<&ResourceProperty> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = &ResourceProperty> {
        self.properties.values()
    }
}

/// A tool or runtime available to builds, e.g. `jdk` with versions
/// `17` and `21`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(default)]
    pub default_version: Option<String>,
    #[serde(default)]
    properties: BTreeMap<String, ResourceProperty>,
    #[serde(default)]
    versions: BTreeMap<String, ResourceVersion>,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_property(&mut self, property: ResourceProperty) -> Result<()> {
        if let Some(existing) = self.properties.get(property.name()) {
            return Err(Error::DuplicateProperty {
                name: property.name().to_string(),
                existing: existing.value().to_string(),
            });
        }
        self.properties.insert(property.name().to_string(), property);
        Ok(())
    }

    pub fn add_version(&mut self, version: ResourceVersion) -> Result<()> {
        if self.versions.contains_key(&version.value) {
            return Err(Error::InvalidConfiguration(format!(
                "resource '{}' already has version '{}'",
                self.name, version.value
            )));
        }
        self.versions.insert(version.value.clone(), version);
        Ok(())
    }

    pub fn version(&self, value: &str) -> Option<&ResourceVersion> {
        self.versions.get(value)
    }

    pub fn versions(&self) -> impl Iterator<Item = &ResourceVersion> {
        self.versions.values()
    }

    pub fn properties(&self) -> impl Iterator<Item = &ResourceProperty> {
        self.properties.values()
    }

    /// Properties contributed by this resource when `version` (or the
    /// default version) is requested: resource-level properties first, then
    /// the version's.
    pub fn resolve(&self, version: Option<&str>) -> Result<Vec<ResourceProperty>> {
        let mut resolved: Vec<ResourceProperty> = self.properties.values().cloned().collect();

        if let Some(value) = version.or(self.default_version.as_deref()) {
            let version = self.versions.get(value).ok_or_else(|| {
                Error::ResourceNotFound(format!("{} version {}", self.name, value))
            })?;
            for property in version.properties() {
                resolved.retain(|p| p.name() != property.name());
                resolved.push(property.clone());
            }
        }

        Ok(resolved)
    }
}

/// A recipe's dependency on a resource, optionally pinned to a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub resource: String,
    #[serde(default)]
    pub version: Option<String>,
}

impl ResourceRequirement {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_property_name_rejected() {
        assert!(ResourceProperty::new("", "value").is_err());
        assert!(ResourceProperty::new("  ", "value").is_err());
    }

    #[test]
    fn test_duplicate_property_rejected() {
        let mut version = ResourceVersion::new("1.0");
        version
            .add_property(ResourceProperty::new("JAVA_HOME", "/opt/jdk").unwrap())
            .unwrap();

        let err = version
            .add_property(ResourceProperty::new("JAVA_HOME", "/usr/lib/jvm").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateProperty { ref existing, .. } if existing == "/opt/jdk"));

        version.delete_property("JAVA_HOME");
        version
            .add_property(ResourceProperty::new("JAVA_HOME", "/usr/lib/jvm").unwrap())
            .unwrap();
        assert_eq!(version.property("JAVA_HOME").unwrap().value(), "/usr/lib/jvm");
    }

    #[test]
    fn test_version_properties_ordered_by_name() {
        let mut version = ResourceVersion::new("1.0");
        version.add_property(ResourceProperty::new("b", "2").unwrap()).unwrap();
        version.add_property(ResourceProperty::new("a", "1").unwrap()).unwrap();

        let names: Vec<_> = version.properties().map(|p| p.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_resolve_version_overrides_resource_property() {
        let mut resource = Resource::new("jdk");
        resource
            .add_property(ResourceProperty::new("JAVA_OPTS", "-Xmx1g").unwrap())
            .unwrap();
        let mut v17 = ResourceVersion::new("17");
        v17.add_property(ResourceProperty::new("JAVA_OPTS", "-Xmx2g").unwrap())
            .unwrap();
        resource.add_version(v17).unwrap();

        let props = resource.resolve(Some("17")).unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].value(), "-Xmx2g");

        assert!(matches!(
            resource.resolve(Some("21")),
            Err(Error::ResourceNotFound(_))
        ));
    }
}
