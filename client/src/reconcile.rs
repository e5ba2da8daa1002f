//! Vote reconciliation: map a vote intent plus the user's prior vote to the
//! single write that leaves at most one vote row per (post, user).

use hivepost_shared::{PostId, UserId, Vote, VoteId, VoteValue};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::gateway::RemoteGateway;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteAction {
    Insert {
        post_id: PostId,
        user_id: UserId,
        value: VoteValue,
    },
    Update {
        vote_id: VoteId,
        value: VoteValue,
    },
    Delete {
        vote_id: VoteId,
    },
}

/// Decides which write a click turns into.
///
/// Same value as the existing vote retracts it, a different value overwrites
/// it in place, and no existing vote inserts one. Anonymous users get
/// [`SyncError::Unauthenticated`] before anything is decided.
pub fn resolve_vote(
    intended: VoteValue,
    post_id: PostId,
    user_id: Option<&str>,
    existing: Option<&Vote>,
) -> Result<VoteAction> {
    let user_id = user_id.ok_or(SyncError::Unauthenticated)?;

    let action = match existing {
        Some(vote) if vote.value == intended => VoteAction::Delete { vote_id: vote.id },
        Some(vote) => VoteAction::Update {
            vote_id: vote.id,
            value: intended,
        },
        None => VoteAction::Insert {
            post_id,
            user_id: user_id.to_string(),
            value: intended,
        },
    };
    Ok(action)
}

/// Executes `action`; returns the resulting row, or `None` once deleted.
pub async fn apply(gateway: &dyn RemoteGateway, action: &VoteAction) -> Result<Option<Vote>> {
    debug!(?action, "applying vote action");
    match action {
        VoteAction::Insert {
            post_id,
            user_id,
            value,
        } => gateway.insert_vote(*post_id, user_id, *value).await.map(Some),
        VoteAction::Update { vote_id, value } => {
            gateway.update_vote(*vote_id, *value).await.map(Some)
        }
        VoteAction::Delete { vote_id } => gateway.delete_vote(*vote_id).await.map(|()| None),
    }
}
