//! Retry policies of the coordination layer.
//!
//! Store operations are not retried: a silently repeated ownership write could
//! act on state another rebalancer already changed. The exceptions are the
//! cleanup of a session record, which must eventually succeed, and the watch
//! registration of a background listener, which only reads.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `guaranteed_delete_policy` | 50ms | 2s | 5 | `unregister_session` |
//! | `watch_rearm_policy` | 50ms | 2s | 10 | listener rearm |
//!
//! (Defaults shown; the values come from [`SubscriptionConfig`].)

use backon::ExponentialBuilder;

use super::config::SubscriptionConfig;
use super::error::SubscriptionError;
use crate::store::StoreError;

/// Policy for deletes that must go through despite transient connection loss.
///
/// Includes jitter so that sessions shutting down together do not retry in lockstep.
pub fn guaranteed_delete_policy(config: &SubscriptionConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(config.unregister_min_delay)
        .with_max_delay(config.unregister_max_delay)
        .with_max_times(config.unregister_max_retries)
        .with_jitter()
}

/// Retry predicate for the guaranteed delete.
pub fn is_retriable_delete_error(error: &StoreError) -> bool {
    error.is_retriable()
}

/// Policy for re-registering the watch of a running listener.
pub fn watch_rearm_policy(config: &SubscriptionConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(config.watch_rearm_min_delay)
        .with_max_delay(config.watch_rearm_max_delay)
        .with_max_times(config.watch_rearm_max_retries)
        .with_jitter()
}

/// Retry predicate for a failed watch rearm.
///
/// Only transient store errors qualify; an expired session never recovers.
pub fn is_retriable_watch_error(error: &SubscriptionError) -> bool {
    error.store_error().is_some_and(StoreError::is_retriable)
}
