//! Project and recipe definitions.
//!
//! These are plain validated data handed to the core by the configuration
//! collaborator; the core does not parse or edit them.

use crate::ids::ProjectId;
use crate::resource::ResourceRequirement;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Connection details for a project's repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmConfig {
    /// SCM implementation name, e.g. `local` or `git`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Repository location. Together with `kind` it identifies the cache entry.
    pub location: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ScmConfig {
    pub fn new(kind: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            location: location.into(),
            options: BTreeMap::new(),
        }
    }

    /// The unique key used by the revision cache.
    pub fn unique_location(&self) -> String {
        format!("{}:{}", self.kind, self.location)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSpec {
    /// Run through `sh -c`.
    Shell(String),
    /// Run a program directly; the program is looked up on the resolved
    /// search path.
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub name: String,
    pub run: CommandSpec,
    /// Relative to the recipe's base directory.
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl CommandDefinition {
    pub fn shell(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: CommandSpec::Shell(script.into()),
            working_dir: None,
        }
    }
}

/// An ordered list of commands executed as one unit by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeDefinition {
    pub name: String,
    pub commands: Vec<CommandDefinition>,
    #[serde(default)]
    pub continue_on_error: bool,
}

impl RecipeDefinition {
    pub fn command_names(&self) -> Vec<String> {
        self.commands.iter().map(|c| c.name.clone()).collect()
    }
}

/// A stage runs one recipe on one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub recipe: String,
    #[serde(default)]
    pub requirements: Vec<ResourceRequirement>,
    /// Agent capabilities the stage needs.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: ProjectId,
    pub scm: ScmConfig,
    pub stages: Vec<StageConfig>,
    pub recipes: Vec<RecipeDefinition>,
}

impl ProjectConfig {
    pub fn recipe(&self, name: &str) -> Result<&RecipeDefinition> {
        self.recipes
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::RecipeNotFound(format!("{}/{}", self.id, name)))
    }

    /// Check the semantic consistency the core depends on.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "project {} has no stages",
                self.id
            )));
        }

        let mut names = HashSet::new();
        let mut recipes = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(Error::InvalidConfiguration(format!(
                    "project {} declares stage '{}' twice",
                    self.id, stage.name
                )));
            }
            // A recipe is in flight at most once per revision.
            if !recipes.insert(stage.recipe.as_str()) {
                return Err(Error::InvalidConfiguration(format!(
                    "project {} runs recipe '{}' in more than one stage",
                    self.id, stage.recipe
                )));
            }
            self.recipe(&stage.recipe)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> ProjectConfig {
        ProjectConfig {
            id: ProjectId::new("demo"),
            scm: ScmConfig::new("local", "/srv/demo"),
            stages: vec![StageConfig {
                name: "default".into(),
                recipe: "build".into(),
                requirements: vec![],
                capabilities: vec![],
            }],
            recipes: vec![RecipeDefinition {
                name: "build".into(),
                commands: vec![CommandDefinition::shell("make", "make all")],
                continue_on_error: false,
            }],
        }
    }

    #[test]
    fn test_valid_project() {
        assert!(project().validate().is_ok());
    }

    #[test]
    fn test_stage_with_unknown_recipe_rejected() {
        let mut p = project();
        p.stages[0].recipe = "missing".into();
        assert!(matches!(p.validate(), Err(Error::RecipeNotFound(_))));
    }

    #[test]
    fn test_unique_location_includes_kind() {
        assert_eq!(project().scm.unique_location(), "local:/srv/demo");
    }
}
