//! # Giftbox Scheduler
//!
//! Durable expiry timers and the giveaway lifecycle built on them.
//!
//! ## Design Principles
//! - SQLite persistence: timers, giveaways and ledgers survive restarts
//! - One dispatch loop, sleeping until the next expiry
//! - Ending a giveaway is idempotent; duplicate fires change nothing
//! - Announcements are best-effort and never unwind a committed draw
//!
//! ## Architecture
//! ```text
//! TimerEngine (tokio select: sleep | wake signal | shutdown)
//!   └── due timer → TimerHandler (Coordinator)
//!         ├── Giveaway → draw → persist → announce
//!         │                └── ChatPlatform (DiscordPlatform)
//!         │                └── ActivityService (HttpActivityService)
//!         └── Reminder → "timer ended" reply
//! ```

pub mod activity;
pub mod dispatch;
pub mod engine;
pub mod lifecycle;
pub mod notify;
pub mod persistence;
pub mod timers;

pub use activity::HttpActivityService;
pub use dispatch::DiscordPlatform;
pub use engine::{EngineStats, TimerEngine, TimerHandler, TimerSignal};
pub use lifecycle::{Coordinator, Deputy, DonationUpdate, DrawOutcome, GiveawayRequest, RerollExclusion};
pub use persistence::GiftboxDb;
pub use timers::{Timer, TimerKind};
