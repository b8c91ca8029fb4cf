//! Task Graph: the parsed, immutable representation of a run's work.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{Result, ZergError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Verifying,
    Complete,
    Failed,
    Blocked,
    Paused,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Blocked)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFiles {
    pub create: Vec<String>,
    pub modify: Vec<String>,
    pub read: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Verification {
    pub command: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub level: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files: TaskFiles,
    #[serde(default)]
    pub verification: Verification,
}

impl Task {
    /// An empty command or an absent verification block auto-passes.
    pub fn verification_auto_passes(&self) -> bool {
        self.verification.command.trim().is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TaskGraphDoc {
    feature: String,
    #[allow(dead_code)]
    version: String,
    tasks: Vec<Task>,
    levels: HashMap<u32, Vec<String>>,
    #[serde(default)]
    level_names: HashMap<u32, String>,
}

#[derive(Debug, Clone)]
pub struct TaskGraph {
    pub feature: String,
    tasks: HashMap<String, Task>,
    levels: HashMap<u32, Vec<String>>,
    ordered_levels: Vec<u32>,
    pub level_names: HashMap<u32, String>,
}

impl TaskGraph {
    pub fn parse_str(contents: &str, is_yaml: bool) -> Result<Self> {
        let doc: TaskGraphDoc = if is_yaml {
            serde_yaml::from_str(contents)?
        } else {
            serde_json::from_str(contents)?
        };
        Self::from_doc(doc)
    }

    pub fn parse_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        Self::parse_str(&contents, is_yaml)
    }

    fn from_doc(doc: TaskGraphDoc) -> Result<Self> {
        let mut errors = Vec::new();
        let mut tasks = HashMap::new();

        for task in &doc.tasks {
            if task.level == 0 {
                errors.push(format!("task {}: level must be positive", task.id));
            }
            if tasks.contains_key(&task.id) {
                errors.push(format!("duplicate task id: {}", task.id));
            }
            if !task.verification.command.trim().is_empty() && task.verification.timeout_seconds == 0
            {
                errors.push(format!(
                    "task {}: verification.timeout_seconds must be positive",
                    task.id
                ));
            }
            tasks.insert(task.id.clone(), task.clone());
        }

        // Dependency level ordering.
        for task in tasks.values() {
            for dep_id in &task.dependencies {
                match tasks.get(dep_id) {
                    Some(dep) if dep.level < task.level => {}
                    Some(dep) => errors.push(format!(
                        "task {}: dependency {} is not in a strictly lower level ({} >= {})",
                        task.id, dep_id, dep.level, task.level
                    )),
                    None => errors.push(format!(
                        "task {}: unknown dependency {}",
                        task.id, dep_id
                    )),
                }
            }
        }

        // No two tasks in the same level may create the same path.
        let mut levels_by_num: HashMap<u32, Vec<String>> = HashMap::new();
        for task in tasks.values() {
            levels_by_num.entry(task.level).or_default().push(task.id.clone());
        }
        for (level, ids) in &levels_by_num {
            let mut seen = HashSet::new();
            for id in ids {
                let task = &tasks[id];
                for path in &task.files.create {
                    if !seen.insert(path.clone()) {
                        errors.push(format!(
                            "level {level}: multiple tasks create path {path}"
                        ));
                    }
                }
            }
        }

        if !errors.is_empty() {
            return Err(ZergError::Graph(errors));
        }

        let mut ordered_levels: Vec<u32> = doc.levels.keys().copied().collect();
        ordered_levels.sort_unstable();

        Ok(Self {
            feature: doc.feature,
            tasks,
            levels: doc.levels,
            ordered_levels,
            level_names: doc.level_names,
        })
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks_in_level(&self, level: u32) -> &[String] {
        self.levels.get(&level).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn levels(&self) -> &[u32] {
        &self.ordered_levels
    }

    pub fn next_level(&self, level: u32) -> Option<u32> {
        self.ordered_levels
            .iter()
            .copied()
            .find(|&l| l > level)
    }

    pub fn all_task_ids(&self) -> impl Iterator<Item = &String> {
        self.tasks.keys()
    }
}
