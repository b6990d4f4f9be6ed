//! Test fixtures for creating sample configuration.

use keel_agent::{AgentConfig, PostProcessorConfig};
use keel_core::ids::ProjectId;
use keel_core::project::{CommandDefinition, ProjectConfig, RecipeDefinition, ScmConfig, StageConfig};
use keel_core::resource::{Resource, ResourceProperty, ResourceRequirement};
use keel_scm::LOCAL_SCM_KIND;
use std::path::Path;

pub const PROJECT: &str = "demo";

/// Factory for test projects backed by a local directory.
pub struct ProjectFixture;

impl ProjectFixture {
    fn scm(repo: &Path) -> ScmConfig {
        ScmConfig::new(LOCAL_SCM_KIND, repo.to_string_lossy())
    }

    /// One stage running one recipe made of `commands`.
    pub fn with_commands(
        repo: &Path,
        commands: Vec<CommandDefinition>,
        continue_on_error: bool,
    ) -> ProjectConfig {
        ProjectConfig {
            id: ProjectId::new(PROJECT),
            scm: Self::scm(repo),
            stages: vec![StageConfig {
                name: "default".to_string(),
                recipe: "build".to_string(),
                requirements: vec![],
                capabilities: vec![],
            }],
            recipes: vec![RecipeDefinition {
                name: "build".to_string(),
                commands,
                continue_on_error,
            }],
        }
    }

    pub fn single_stage(repo: &Path, script: &str) -> ProjectConfig {
        Self::with_commands(repo, vec![CommandDefinition::shell("build", script)], false)
    }

    /// Two commands where the first fails and prints an error line.
    pub fn failing_first_command(repo: &Path) -> ProjectConfig {
        Self::with_commands(
            repo,
            vec![
                CommandDefinition::shell("compile", "echo 'error: compilation failed'; exit 1"),
                CommandDefinition::shell("test", "echo tests ran"),
            ],
            false,
        )
    }

    /// Two stages needing different capabilities.
    pub fn two_platforms(repo: &Path) -> ProjectConfig {
        let mut project = Self::single_stage(repo, "true");
        project.stages = vec![
            StageConfig {
                name: "linux".to_string(),
                recipe: "build".to_string(),
                requirements: vec![],
                capabilities: vec!["linux".to_string()],
            },
            StageConfig {
                name: "windows".to_string(),
                recipe: "build-windows".to_string(),
                requirements: vec![],
                capabilities: vec!["windows".to_string()],
            },
        ];
        project.recipes.push(RecipeDefinition {
            name: "build-windows".to_string(),
            commands: vec![CommandDefinition::shell("build", "true")],
            continue_on_error: false,
        });
        project
    }

    pub fn require(mut project: ProjectConfig, resource: &str) -> ProjectConfig {
        for stage in &mut project.stages {
            stage.requirements.push(ResourceRequirement::new(resource));
        }
        project
    }
}

/// Factory for test resources.
pub struct ResourceFixture;

impl ResourceFixture {
    /// A tool whose `bin` directory goes on the path and whose home is
    /// derived from a base property.
    pub fn tool(name: &str, base: &str) -> Resource {
        let mut resource = Resource::new(name);
        let properties = [
            ResourceProperty::new("TOOL_BASE", base),
            ResourceProperty::new("TOOL_HOME", "${TOOL_BASE}/home").map(|p| {
                p.with_resolve_variables(true).with_add_to_environment(true)
            }),
            ResourceProperty::new("tool.bin", "${TOOL_BASE}/bin")
                .map(|p| p.with_resolve_variables(true).with_add_to_path(true)),
        ];
        for property in properties {
            resource
                .add_property(property.expect("fixture property names are valid"))
                .expect("fixture property names are unique");
        }
        resource
    }
}

/// Agent configuration writing into `work_dir`, scanning output for lines
/// starting with `error` and `value=`.
pub fn agent_config(name: &str, capabilities: &[&str], work_dir: &Path) -> AgentConfig {
    AgentConfig {
        name: name.to_string(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        work_dir: work_dir.to_path_buf(),
        cleanup: true,
        post_processors: vec![
            PostProcessorConfig::Regex {
                name: "diagnostics".to_string(),
                patterns: vec!["^error".to_string(), "^value=".to_string()],
                fail_on_match: false,
            },
            PostProcessorConfig::Artifacts,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tool_resource_has_every_property() {
        let resource = ResourceFixture::tool("tool", "/opt/tool");
        let names: Vec<&str> = resource.properties().map(|p| p.name()).collect();
        assert_eq!(names, vec!["TOOL_BASE", "TOOL_HOME", "tool.bin"]);
    }
}
