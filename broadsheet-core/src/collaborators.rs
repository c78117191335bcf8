// Interfaces to the services that label and enrich articles. Neither is
// part of the pipeline proper; failures leave the article where it was.

use crate::model::{Classification, PlaceEntity};
use async_trait::async_trait;

pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// Topic classifier fed with cleaned article text.
#[async_trait]
pub trait TextClassifier: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, text: &str) -> Result<Classification, CollaboratorError>;
}

/// Place-name matcher run after classification.
#[async_trait]
pub trait Gazetteer: Send + Sync {
    fn name(&self) -> &str;

    /// `hints` are free-form location hints such as the source's home town.
    async fn match_places(
        &self,
        text: &str,
        hints: &[String],
    ) -> Result<Vec<PlaceEntity>, CollaboratorError>;
}
