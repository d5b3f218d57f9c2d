//! Entities, their repositories and the managers that change them.
//!
//! Repositories build rows and run single-row operations. Managers own the
//! multi-row operations: atomic transactions through the coordinator and the
//! non-atomic side effects that follow them.

pub mod block;
pub mod card;
pub mod chat;
pub mod chat_message;
pub mod comment;
pub mod feed;
pub mod post;
pub mod user;
pub mod view;

pub use block::{BlockError, BlockManager};
pub use chat::{Chat, ChatError, ChatManager, ChatType};
pub use chat_message::{ChatMessage, ChatMessageManager};
pub use comment::{Comment, CommentError, CommentManager};
pub use feed::{FeedEngine, FeedEntry, FeedError};
pub use post::Post;
pub use user::User;
pub use view::{ViewedStatus, Viewable};
