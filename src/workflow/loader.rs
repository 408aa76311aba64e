//! Loading and validating workflow documents.
//!
//! Documents are YAML or JSON, selected by file extension. Validation checks
//! everything serde cannot: name uniqueness, reference integrity, dependency
//! cycles, and numeric bounds on the resilience policies.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::ConfigError;
use crate::workflow::definition::{AgentKind, RetryPolicy, WorkflowDefinition};

/// Load a workflow document from a file and validate it.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<WorkflowDefinition, ConfigError> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let raw = std::fs::read_to_string(path)?;

    let definition = match extension.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?,
        "json" => serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?,
        other => {
            return Err(ConfigError::UnsupportedFormat {
                extension: if other.is_empty() {
                    "(none)".to_string()
                } else {
                    format!(".{other}")
                },
            });
        }
    };

    validate(&definition)?;
    Ok(definition)
}

/// Parse a YAML document from a string and validate it.
pub fn load_from_yaml(raw: &str) -> Result<WorkflowDefinition, ConfigError> {
    let definition: WorkflowDefinition =
        serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&definition)?;
    Ok(definition)
}

/// Validate an already-deserialized workflow document.
///
/// Returns the first problem found. Checks:
/// - agent and task names are unique
/// - every task references a declared agent
/// - every dependency references a declared task (and not itself)
/// - the dependency graph is acyclic
/// - retry, breaker, and timeout values are within bounds
/// - non-custom agents have an endpoint
pub fn validate(definition: &WorkflowDefinition) -> Result<(), ConfigError> {
    let mut agent_names = HashSet::new();
    for agent in &definition.agents {
        if !agent_names.insert(agent.name.as_str()) {
            return Err(ConfigError::DuplicateAgent {
                name: agent.name.clone(),
            });
        }

        if agent.endpoint.is_none() && agent.kind != AgentKind::Custom {
            return Err(ConfigError::MissingEndpoint {
                agent: agent.name.clone(),
                kind: agent.kind.to_string(),
            });
        }

        validate_timeout(&agent.name, agent.timeout)?;
        validate_retry(&agent.name, &agent.retry)?;

        if agent.breaker.failure_threshold < 1 {
            return Err(invalid(
                format!("agents.{}.breaker.failure_threshold", agent.name),
                "must be at least 1",
            ));
        }
        if agent.breaker.recovery_timeout < 1.0 {
            return Err(invalid(
                format!("agents.{}.breaker.recovery_timeout", agent.name),
                "must be at least 1 second",
            ));
        }
        if agent.max_concurrency == Some(0) {
            return Err(invalid(
                format!("agents.{}.max_concurrency", agent.name),
                "must be at least 1 when set",
            ));
        }
    }

    let mut task_names = HashSet::new();
    for task in &definition.tasks {
        if !task_names.insert(task.name.as_str()) {
            return Err(ConfigError::DuplicateTask {
                name: task.name.clone(),
            });
        }

        if !agent_names.contains(task.agent.as_str()) {
            return Err(ConfigError::UnknownAgent {
                task: task.name.clone(),
                agent: task.agent.clone(),
            });
        }

        if let Some(timeout) = task.timeout {
            validate_timeout(&task.name, timeout)?;
        }
        if let Some(retry) = &task.retry {
            validate_retry(&task.name, retry)?;
        }
    }

    for task in &definition.tasks {
        for dependency in &task.depends_on {
            if dependency == &task.name {
                return Err(ConfigError::DependencyCycle {
                    task: task.name.clone(),
                });
            }
            if !task_names.contains(dependency.as_str()) {
                return Err(ConfigError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    check_cycles(definition)
}

fn invalid(key: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        message: message.into(),
    }
}

fn validate_timeout(owner: &str, timeout: f64) -> Result<(), ConfigError> {
    if !(timeout >= 1.0) {
        return Err(invalid(
            format!("{owner}.timeout"),
            "must be at least 1 second",
        ));
    }
    Ok(())
}

fn validate_retry(owner: &str, retry: &RetryPolicy) -> Result<(), ConfigError> {
    if retry.max_attempts < 1 || retry.max_attempts > 10 {
        return Err(invalid(
            format!("{owner}.retry.max_attempts"),
            "must be between 1 and 10",
        ));
    }
    if !(retry.initial_delay >= 0.1) {
        return Err(invalid(
            format!("{owner}.retry.initial_delay"),
            "must be at least 0.1 seconds",
        ));
    }
    if !(retry.max_delay >= 1.0) {
        return Err(invalid(
            format!("{owner}.retry.max_delay"),
            "must be at least 1 second",
        ));
    }
    if !(retry.exponential_base >= 1.1) {
        return Err(invalid(
            format!("{owner}.retry.exponential_base"),
            "must be at least 1.1",
        ));
    }
    Ok(())
}

/// Depth-first cycle detection over the task dependency graph.
fn check_cycles(definition: &WorkflowDefinition) -> Result<(), ConfigError> {
    let deps: HashMap<&str, &[String]> = definition
        .tasks
        .iter()
        .map(|t| (t.name.as_str(), t.depends_on.as_slice()))
        .collect();

    fn visit<'a>(
        name: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
    ) -> bool {
        visited.insert(name);
        stack.insert(name);

        if let Some(dependencies) = deps.get(name) {
            for dep in dependencies.iter() {
                if stack.contains(dep.as_str()) {
                    return true;
                }
                if !visited.contains(dep.as_str())
                    && visit(dep.as_str(), deps, visited, stack)
                {
                    return true;
                }
            }
        }

        stack.remove(name);
        false
    }

    let mut visited = HashSet::new();
    for task in &definition.tasks {
        if !visited.contains(task.name.as_str()) {
            let mut stack = HashSet::new();
            if visit(task.name.as_str(), &deps, &mut visited, &mut stack) {
                return Err(ConfigError::DependencyCycle {
                    task: task.name.clone(),
                });
            }
        }
    }
    Ok(())
}
