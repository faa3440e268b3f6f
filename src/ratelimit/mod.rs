//! Rate limiting identities, policy, state stores and the decision engine.

mod clock;
mod engine;
mod identity;
mod memory;
mod policy;
#[cfg(feature = "redis")]
mod redis_store;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Decision, DecisionEngine, DenyReason, DEFAULT_STORE_TIMEOUT};
pub use identity::{strip_port, RateIdentity};
pub use memory::InMemoryStore;
pub use policy::{LimitRule, RateLimitPolicy, TokenOverride};
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use store::{RateRecord, RateStore, StoreError};
