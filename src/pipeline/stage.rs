//! The fixed stage set and its dependency graph.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One named unit of the pipeline.
///
/// Variant order is the declaration order used to break ties when several
/// stages become ready at once, so `Ord` doubles as dispatch priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Chunker,
    GraphDb,
    VectorDb,
    Prompt,
    Llm,
}

impl Stage {
    /// All stages in declaration order.
    pub const ALL: [Stage; 5] = [
        Stage::Chunker,
        Stage::GraphDb,
        Stage::VectorDb,
        Stage::Prompt,
        Stage::Llm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Chunker => "chunker",
            Stage::GraphDb => "graph_db",
            Stage::VectorDb => "vector_db",
            Stage::Prompt => "prompt",
            Stage::Llm => "llm",
        }
    }

    /// Upstream stages whose output feeds this stage's input.
    pub fn dependencies(&self) -> &'static [Stage] {
        match self {
            Stage::Chunker | Stage::GraphDb | Stage::VectorDb => &[],
            Stage::Prompt => &[Stage::GraphDb],
            Stage::Llm => &[Stage::Prompt],
        }
    }

    /// Stages that list `self` as a direct dependency.
    pub fn dependents(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| s.dependencies().contains(self))
            .collect()
    }

    /// Upper-case token used in environment variable names (`GRAPH_DB`).
    pub fn env_key(&self) -> String {
        self.as_str().to_uppercase()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chunker" => Ok(Stage::Chunker),
            "graph_db" | "graphdb" => Ok(Stage::GraphDb),
            "vector_db" | "vectordb" => Ok(Stage::VectorDb),
            "prompt" => Ok(Stage::Prompt),
            "llm" => Ok(Stage::Llm),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}
