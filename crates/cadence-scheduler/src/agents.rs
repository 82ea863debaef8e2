//! Agent ordering for recipe matching.

use cadence_core::agent::Agent;
use cadence_core::recipe::RecipeRequest;
use sha2::{Digest, Sha256};

/// Orders candidate agents for a recipe. The first capable agent in the
/// returned order receives the recipe.
pub trait AgentSorter: Send + Sync {
    fn sort(&self, agents: Vec<Agent>, recipe: &RecipeRequest) -> Vec<Agent>;
}

/// Sorts agents by a hash of agent, project and stage, so that repeated
/// builds of a stage tend to land on the same agent.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashAgentSorter;

impl HashAgentSorter {
    pub fn new() -> Self {
        Self
    }

    fn key(agent: &Agent, recipe: &RecipeRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(agent.name.as_bytes());
        hasher.update(recipe.project_name.as_bytes());
        hasher.update(recipe.stage.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl AgentSorter for HashAgentSorter {
    fn sort(&self, agents: Vec<Agent>, recipe: &RecipeRequest) -> Vec<Agent> {
        let mut keyed: Vec<(String, Agent)> = agents
            .into_iter()
            .map(|agent| (Self::key(&agent, recipe), agent))
            .collect();
        keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
        keyed.into_iter().map(|(_, agent)| agent).collect()
    }
}

/// Keeps the directory's order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryOrderSorter;

impl AgentSorter for DirectoryOrderSorter {
    fn sort(&self, agents: Vec<Agent>, _recipe: &RecipeRequest) -> Vec<Agent> {
        agents
    }
}
