mod catalog;
mod client;
mod feedback;
mod overrides;
mod ranker;
mod resolve;
mod roles;
mod router;
mod scoring;
mod selection;
mod sources;
mod split;

pub use catalog::{CatalogSnapshot, SourceStatus};
pub use client::HttpRanker;
pub use feedback::{FeedbackStore, FeedbackView, COMMUNITY_HOURLY_LIMIT};
pub use ranker::{Ranker, RankerConfig, RefreshReport};
pub use roles::{ComposedPrompt, RoleCatalog};
pub use router::{DecomposeRequest, ModelRouter, PickRequest, PickedModel, RouterStatus};
pub use scoring::NormParams;
pub use selection::Recommendation;
pub use sources::SourceConfig;
pub use split::{
    classify, sequential_subtasks, split_task, swarm_subtasks, Decomposition, SplitMethod,
    SubTask,
};
