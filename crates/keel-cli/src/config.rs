//! System definition: master settings, local agents, resources and
//! projects in one YAML file.

use keel_agent::AgentConfig;
use keel_core::project::ProjectConfig;
use keel_core::resource::Resource;
use keel_core::trigger::{TriggerConfig, TriggerSchedule};
use keel_master::MasterConfig;
use keel_scheduler::CronExpression;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDefinition {
    #[serde(flatten)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemDefinition {
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub projects: Vec<ProjectDefinition>,
}

impl SystemDefinition {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// `path` if given, otherwise `system.yaml` in the user config dir.
    pub fn resolve_path(path: Option<PathBuf>) -> Result<PathBuf, Box<dyn std::error::Error>> {
        match path {
            Some(path) => Ok(path),
            None => {
                let dirs = directories::ProjectDirs::from("ci", "keel", "keel")
                    .ok_or("Could not determine config directory")?;
                Ok(dirs.config_dir().join("system.yaml"))
            }
        }
    }

    /// Every problem found, empty if the definition is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let mut agent_names = HashSet::new();
        for agent in &self.agents {
            if !agent_names.insert(agent.name.as_str()) {
                problems.push(format!("agent '{}' is declared twice", agent.name));
            }
            for processor in &agent.post_processors {
                if let Err(e) = processor.build() {
                    problems.push(format!("agent '{}': {}", agent.name, e));
                }
            }
        }

        let resources: HashSet<&str> = self.resources.iter().map(|r| r.name.as_str()).collect();
        let mut project_ids = HashSet::new();
        for definition in &self.projects {
            let project = &definition.project;
            if !project_ids.insert(project.id.clone()) {
                problems.push(format!("project {} is declared twice", project.id));
            }
            if let Err(e) = project.validate() {
                problems.push(e.to_string());
            }
            for stage in &project.stages {
                for requirement in &stage.requirements {
                    if !resources.contains(requirement.resource.as_str()) {
                        problems.push(format!(
                            "project {} stage '{}' requires unknown resource '{}'",
                            project.id, stage.name, requirement.resource
                        ));
                    }
                }
                if !self.agents.is_empty()
                    && !self
                        .agents
                        .iter()
                        .any(|a| stage.capabilities.iter().all(|c| a.capabilities.contains(c)))
                {
                    problems.push(format!(
                        "project {} stage '{}': no agent offers {:?}",
                        project.id, stage.name, stage.capabilities
                    ));
                }
            }
            for trigger in &definition.triggers {
                if let TriggerSchedule::Cron { expression } = &trigger.schedule
                    && let Err(e) = CronExpression::parse(expression)
                {
                    problems.push(format!(
                        "project {} trigger '{}': {}",
                        project.id, trigger.name, e
                    ));
                }
            }
        }

        problems
    }
}
