// ============================================================================
// Consumer - receive, decode, append, acknowledge
// ============================================================================

mod consumer_loop;
mod policy;

pub use consumer_loop::ConsumerLoop;
pub use policy::policy_for;
