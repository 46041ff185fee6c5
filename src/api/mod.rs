//! Feed, stream and auth collaborators.
//!
//! These run inside worker-pool tasks and block freely (subprocesses, HTTP).
//! They take owned or borrowed inputs and return owned values; nothing here
//! touches UI state.

pub mod oauth;
pub mod token;
pub mod ytdlp;

use crate::error::FetchError;
use crate::model::{Feed, StreamSet, VideoId};

/// Everything a browse or search needs, copied into the task.
#[derive(Clone, Debug)]
pub struct FeedRequest {
    /// Playlist-like URL listed for the home feed.
    pub home_url: String,
    pub max_results: u32,
    pub access_token: Option<String>,
}

pub trait FeedSource: Send + Sync {
    fn browse(&self, req: &FeedRequest) -> Result<Feed, FetchError>;

    fn search(&self, req: &FeedRequest, query: &str) -> Result<Feed, FetchError>;

    fn streams(&self, id: &VideoId, access_token: Option<&str>) -> Result<StreamSet, FetchError>;
}
