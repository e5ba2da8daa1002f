use std::fmt;

use serde::{Deserialize, Serialize};

pub type PostId = i64;
pub type VoteId = i64;
pub type CommunityId = i64;
pub type CommentId = i64;
pub type UserId = String;

/// Object storage bucket that holds post images.
pub const POST_IMAGES_BUCKET: &str = "post-images";

// ── Auth ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub avatar_url: String,
}

// ── Votes ──

/// A signed reaction: `+1` (like) or `-1` (dislike). Encoded as the bare integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum VoteValue {
    Up,
    Down,
}

impl VoteValue {
    pub fn as_i32(self) -> i32 {
        match self {
            VoteValue::Up => 1,
            VoteValue::Down => -1,
        }
    }
}

impl From<VoteValue> for i32 {
    fn from(value: VoteValue) -> Self {
        value.as_i32()
    }
}

impl TryFrom<i32> for VoteValue {
    type Error = InvalidVoteValue;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(VoteValue::Up),
            -1 => Ok(VoteValue::Down),
            other => Err(InvalidVoteValue(other)),
        }
    }
}

impl fmt::Display for VoteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+}", self.as_i32())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidVoteValue(pub i32);

impl fmt::Display for InvalidVoteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vote value must be 1 or -1, got {}", self.0)
    }
}

impl std::error::Error for InvalidVoteValue {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub id: VoteId,
    pub post_id: PostId,
    pub user_id: UserId,
    pub value: VoteValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVote {
    pub post_id: PostId,
    pub user_id: UserId,
    pub value: VoteValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateVote {
    pub value: VoteValue,
}

/// Like/dislike counts for one post, seen from one (possibly anonymous) user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub likes: i64,
    pub dislikes: i64,
    pub user_vote: Option<VoteValue>,
}

impl Tally {
    pub fn from_votes(votes: &[Vote], user_id: Option<&str>) -> Self {
        let mut tally = Tally::default();
        for vote in votes {
            match vote.value {
                VoteValue::Up => tally.likes += 1,
                VoteValue::Down => tally.dislikes += 1,
            }
            if user_id == Some(vote.user_id.as_str()) {
                tally.user_vote = Some(vote.value);
            }
        }
        tally
    }

    /// The tally after this user clicks `value`: same value retracts, other value switches.
    pub fn toggled(self, value: VoteValue) -> Self {
        let mut next = self;
        if let Some(prev) = self.user_vote {
            next.bump(prev, -1);
        }
        if self.user_vote == Some(value) {
            next.user_vote = None;
        } else {
            next.bump(value, 1);
            next.user_vote = Some(value);
        }
        next
    }

    pub fn score(&self) -> i64 {
        self.likes - self.dislikes
    }

    fn bump(&mut self, value: VoteValue, delta: i64) {
        match value {
            VoteValue::Up => self.likes += delta,
            VoteValue::Down => self.dislikes += delta,
        }
    }
}

// ── Posts ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub title: String,
    pub content: String,
    pub image_url: String,
    pub avatar_url: Option<String>,
    pub created_at: String,
    pub community_id: Option<CommunityId>,
    pub community_name: Option<String>,
    pub like_count: i64,
    pub comment_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPost {
    pub title: String,
    pub content: String,
    pub image_url: String,
    pub avatar_url: Option<String>,
    pub community_id: Option<CommunityId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUploaded {
    pub public_url: String,
}

// ── Communities ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: CommunityId,
    pub name: String,
    pub description: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCommunity {
    pub name: String,
    pub description: String,
}

// ── Comments ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    pub parent_comment_id: Option<CommentId>,
    pub content: String,
    pub user_id: UserId,
    pub author: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewComment {
    pub post_id: PostId,
    pub content: String,
    pub parent_comment_id: Option<CommentId>,
}

// ── Errors ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}
