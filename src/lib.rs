//! Gig-marketplace financial core.
//!
//! Owns escrow/money state, the double-entry ledger, the PSP bridge, XP
//! awards, dispute resolution, and the background sweepers that keep all of
//! it consistent. Deliberately narrow: the product HTTP/RPC surface, auth,
//! moderation and onboarding all live elsewhere.

pub mod audit;
pub mod config;
pub mod database;
pub mod dispute_service;
pub mod error;
pub mod fee;
pub mod jobs;
pub mod kill_switch;
pub mod ledger;
pub mod models;
pub mod money_state_machine;
pub mod outbox;
pub mod proof_state_machine;
pub mod psp_bridge;
pub mod reaper;
pub mod reconciler;
pub mod replay_guard;
pub mod subscription_processor;
pub mod task_state_machine;
pub mod webhooks;
pub mod xp_math;
pub mod xp_service;
