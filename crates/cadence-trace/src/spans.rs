//! Span constructors for orchestration work.

use tracing::{Level, Span, span};

/// Attributes attached to build, recipe and dispatch spans.
#[derive(Debug, Default, Clone)]
pub struct CiAttributes {
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub build_id: Option<String>,
    pub build_number: Option<u64>,
    pub request_id: Option<String>,
    pub reason: Option<String>,
    pub recipe_id: Option<String>,
    pub stage_name: Option<String>,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub revision: Option<String>,
}

impl CiAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.project_id = Some(id.into());
        self.project_name = Some(name.into());
        self
    }

    pub fn build(mut self, id: impl Into<String>, number: u64) -> Self {
        self.build_id = Some(id.into());
        self.build_number = Some(number);
        self
    }

    pub fn request(mut self, id: impl Into<String>, reason: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self.reason = Some(reason.into());
        self
    }

    pub fn recipe(mut self, id: impl Into<String>, stage: impl Into<String>) -> Self {
        self.recipe_id = Some(id.into());
        self.stage_name = Some(stage.into());
        self
    }

    pub fn agent(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self.agent_name = Some(name.into());
        self
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

/// Span covering an activated build.
pub fn build_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "build.start",
        ci.project.id = attrs.project_id.as_deref().unwrap_or(""),
        ci.project.name = attrs.project_name.as_deref().unwrap_or(""),
        ci.build.id = attrs.build_id.as_deref().unwrap_or(""),
        ci.build.number = attrs.build_number.unwrap_or(0),
        ci.request.id = attrs.request_id.as_deref().unwrap_or(""),
        ci.build.reason = attrs.reason.as_deref().unwrap_or(""),
    )
}

/// Span covering admission of a recipe request.
pub fn recipe_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "recipe.enqueue",
        ci.project.name = attrs.project_name.as_deref().unwrap_or(""),
        ci.build.number = attrs.build_number.unwrap_or(0),
        ci.recipe.id = attrs.recipe_id.as_deref().unwrap_or(""),
        ci.stage.name = attrs.stage_name.as_deref().unwrap_or(""),
    )
}

/// Span covering hand-off of a recipe to an agent.
pub fn dispatch_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "recipe.dispatch",
        ci.recipe.id = attrs.recipe_id.as_deref().unwrap_or(""),
        ci.stage.name = attrs.stage_name.as_deref().unwrap_or(""),
        ci.agent.id = attrs.agent_id.as_deref().unwrap_or(""),
        ci.agent.name = attrs.agent_name.as_deref().unwrap_or(""),
        vcs.revision = attrs.revision.as_deref().unwrap_or(""),
    )
}
