//! Log surface of the RPC dispatcher

use crate::wal::Wal;
use fidias_common::{Error, Result};
use fidias_proto::{Request, Response};
use std::sync::Arc;

impl Wal {
    /// Serve a log request from the local store and ballot engine
    pub async fn handle_log(self: &Arc<Self>, request: Request) -> Result<Response> {
        match request {
            Request::GetEntry { key, id } => Ok(Response::Entry(self.store.get_entry(&key, &id)?)),
            Request::LastEntry { key } => Ok(Response::Entry(self.store.last_entry(&key)?)),
            Request::GetIndex { key } => Ok(Response::Index(self.store.index_or_empty(&key)?)),
            Request::FetchKeylog { key, after, limit } => {
                let limit = usize::try_from(limit).unwrap_or(usize::MAX);
                Ok(Response::Entries(self.store.entries_after(&key, &after, limit)?))
            }
            Request::ProposeEntry { entry, options } => {
                Ok(Response::Ballot(self.lead(entry, options).await?))
            }
            Request::BallotVote { entry, options } => {
                self.vote(&entry, &options)?;
                Ok(Response::Ok)
            }
            Request::BallotCommit { entry, options } => {
                self.commit(&entry, &options).await?;
                Ok(Response::Ok)
            }
            other => Err(Error::invalid_argument(format!(
                "{} is not a log request",
                other.method()
            ))),
        }
    }
}
