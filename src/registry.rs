//! Per-scope dependency registry.
//!
//! [`Clients`] carries the store handles and limits. [`Managers`] builds each
//! repository and manager at most once, on first use, and hands out shared
//! `Arc`s so that managers depending on each other see the same instance.

use std::sync::{Arc, OnceLock};

use crate::config::Limits;
use crate::models::block::{BlockManager, BlockRepository};
use crate::models::card::CardRepository;
use crate::models::chat::{ChatManager, ChatMemberRepository, ChatRepository};
use crate::models::chat_message::{ChatMessageManager, ChatMessageRepository};
use crate::models::comment::{CommentManager, CommentRepository};
use crate::models::feed::FeedEngine;
use crate::models::post::PostRepository;
use crate::models::user::UserRepository;
use crate::models::view::ViewRepository;
use crate::postprocess::Postprocessor;
use crate::storage::{Store, Tables};
use crate::transact::TransactionCoordinator;

/// Store handles and request limits shared by every manager.
#[derive(Clone)]
pub struct Clients {
    pub tables: Tables,
    pub limits: Limits,
}

impl Clients {
    pub fn new(tables: Tables, limits: Limits) -> Self {
        Self { tables, limits }
    }

    pub fn main(&self) -> Arc<dyn Store> {
        self.tables.main.clone()
    }

    pub fn feed(&self) -> Arc<dyn Store> {
        self.tables.feed.clone()
    }
}

/// Lazily constructed managers for one request scope.
pub struct Managers {
    clients: Clients,
    users: OnceLock<UserRepository>,
    posts: OnceLock<PostRepository>,
    views: OnceLock<ViewRepository>,
    cards: OnceLock<CardRepository>,
    coordinator: OnceLock<TransactionCoordinator>,
    feed: OnceLock<Arc<FeedEngine>>,
    blocks: OnceLock<Arc<BlockManager>>,
    comments: OnceLock<Arc<CommentManager>>,
    chat_messages: OnceLock<Arc<ChatMessageManager>>,
    chats: OnceLock<Arc<ChatManager>>,
}

impl Managers {
    pub fn new(clients: Clients) -> Self {
        Self {
            clients,
            users: OnceLock::new(),
            posts: OnceLock::new(),
            views: OnceLock::new(),
            cards: OnceLock::new(),
            coordinator: OnceLock::new(),
            feed: OnceLock::new(),
            blocks: OnceLock::new(),
            comments: OnceLock::new(),
            chat_messages: OnceLock::new(),
            chats: OnceLock::new(),
        }
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    pub fn users(&self) -> &UserRepository {
        self.users
            .get_or_init(|| UserRepository::new(self.clients.main()))
    }

    pub fn posts(&self) -> &PostRepository {
        self.posts
            .get_or_init(|| PostRepository::new(self.clients.main()))
    }

    pub fn views(&self) -> &ViewRepository {
        self.views
            .get_or_init(|| ViewRepository::new(self.clients.main()))
    }

    pub fn cards(&self) -> &CardRepository {
        self.cards
            .get_or_init(|| CardRepository::new(self.clients.main()))
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        self.coordinator.get_or_init(|| {
            TransactionCoordinator::new(self.clients.main(), self.clients.limits.max_transact_items)
        })
    }

    pub fn feed(&self) -> Arc<FeedEngine> {
        self.feed
            .get_or_init(|| {
                Arc::new(FeedEngine::new(
                    self.clients.main(),
                    self.clients.feed(),
                    self.clients.limits.batch_write_size,
                ))
            })
            .clone()
    }

    pub fn blocks(&self) -> Arc<BlockManager> {
        self.blocks
            .get_or_init(|| {
                Arc::new(BlockManager::new(
                    BlockRepository::new(self.clients.main()),
                    self.feed(),
                ))
            })
            .clone()
    }

    pub fn comments(&self) -> Arc<CommentManager> {
        self.comments
            .get_or_init(|| {
                Arc::new(CommentManager::new(
                    CommentRepository::new(self.clients.main()),
                    self.posts().clone(),
                    self.views().clone(),
                    self.coordinator().clone(),
                ))
            })
            .clone()
    }

    pub fn chat_messages(&self) -> Arc<ChatMessageManager> {
        self.chat_messages
            .get_or_init(|| {
                Arc::new(ChatMessageManager::new(
                    ChatMessageRepository::new(self.clients.main()),
                    ChatMemberRepository::new(self.clients.main()),
                    self.views().clone(),
                    self.clients.main(),
                    self.clients.limits.batch_write_size,
                ))
            })
            .clone()
    }

    pub fn chats(&self) -> Arc<ChatManager> {
        self.chats
            .get_or_init(|| {
                Arc::new(ChatManager::new(
                    ChatRepository::new(self.clients.main()),
                    ChatMemberRepository::new(self.clients.main()),
                    self.users().clone(),
                    self.blocks(),
                    self.chat_messages(),
                    self.cards().clone(),
                    self.views().clone(),
                    self.coordinator().clone(),
                ))
            })
            .clone()
    }

    /// Change-stream dispatcher over this scope's managers.
    pub fn postprocessor(&self) -> Postprocessor {
        Postprocessor::new(self.chats())
    }
}
