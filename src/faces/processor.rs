use async_trait::async_trait;

use super::FaceDescriptorSet;
use crate::error::ItemError;
use crate::scanner::ObjectEntry;
use crate::tasks::MatchResult;

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// One or more matches, in the order they should be appended.
    Matched(Vec<MatchResult>),
    /// Processed cleanly with nothing above the threshold (or no face at all).
    NoMatch,
    /// Faces were written to the image's metadata.
    Indexed(FaceDescriptorSet),
    /// Faces already exist for this image and collection.
    AlreadyIndexed,
}

impl ItemOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ItemOutcome::Matched(_) => "matched",
            ItemOutcome::NoMatch => "no_match",
            ItemOutcome::Indexed(_) => "indexed",
            ItemOutcome::AlreadyIndexed => "already_indexed",
        }
    }
}

/// One job mode's handling of a single unit of work.
///
/// Implementations only touch shared state (metadata, match lists) after the
/// provider call has fully succeeded.
#[async_trait]
pub trait CandidateProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, candidate: &ObjectEntry) -> Result<ItemOutcome, ItemError>;
}
