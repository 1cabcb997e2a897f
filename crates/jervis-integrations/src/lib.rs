//! Source client and polling-handler implementations (§4.3, §4.7): typed
//! façades over issue trackers, wikis, mail, and git remotes, each paired
//! with a [`handler::PollingHandler`] that stages fetched content as
//! `StagedArtifact` rows without touching the search store.

pub mod error;
pub mod git_remote;
pub mod github;
pub mod handler;
pub mod mail;
pub mod types;
pub mod wiki;
