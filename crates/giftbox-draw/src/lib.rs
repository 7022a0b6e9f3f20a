//! # Giftbox Draw
//!
//! Pure winner-selection pipeline: eligibility filter → weight resolver →
//! weighted sampling without replacement. Raffles reuse the selector with
//! ticket counts as weights.
//!
//! ```text
//! entrants ──► eligibility::check ──► weights::resolve_weight ──► WeightedSelector::select
//! tickets  ──────────────────────────► weights::raffle_pool ─────┘
//! ```

pub mod eligibility;
pub mod raffle;
pub mod selector;
pub mod weights;

pub use eligibility::{Eligibility, ExclusionReason, MemberSnapshot};
pub use raffle::Raffle;
pub use selector::WeightedSelector;
pub use weights::{raffle_pool, resolve_weight};
