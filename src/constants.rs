//! Centralized path and configuration constants.
//!
//! The path segments below are shared with existing deployments reading the
//! same coordination store and must not change.
//!
//! # Categories
//!
//! - **Path Constants**: Node names of the subscription tree
//! - **Value Constants**: Sentinels stored inside nodes
//! - **Defaults**: Tunables used by [`SubscriptionConfig`](crate::subscription::SubscriptionConfig)

// =============================================================================
// Path Constants
// =============================================================================

/// Default root under which locks and subscriptions live.
pub const DEFAULT_ROOT_PATH: &str = "/nakadi";

/// Directory holding one lock node per subscription.
pub const LOCKS_DIR: &str = "locks";

/// Prefix of the lock node name (`subscription_<id>`).
pub const LOCK_NODE_PREFIX: &str = "subscription_";

/// Directory holding one subtree per subscription.
pub const SUBSCRIPTIONS_DIR: &str = "subscriptions";

/// Initialization marker node.
pub const STATE_NODE: &str = "state";

/// Parent of the ephemeral session records.
pub const SESSIONS_NODE: &str = "sessions";

/// Parent of the `<topic>/<partition>` records.
pub const TOPICS_NODE: &str = "topics";

/// Per-partition child holding the committed offset.
pub const OFFSET_NODE: &str = "offset";

/// Topology version counter node.
pub const TOPOLOGY_NODE: &str = "topology";

// =============================================================================
// Value Constants
// =============================================================================

/// Value of the state node once `fill_empty_subscription` has completed.
pub const STATE_INITIALIZED: &str = "INITIALIZED";

/// Field delimiter of the legacy partition record format.
pub const RECORD_DELIMITER: char = ':';

/// Initial value of the topology counter.
pub const INITIAL_TOPOLOGY_VERSION: u64 = 0;

// =============================================================================
// Defaults
// =============================================================================

/// Log a progress line every N partitions while filling a subscription.
pub const DEFAULT_PARTITION_PROGRESS_LOG_INTERVAL: usize = 100;

/// Attempts made by the guaranteed delete of a session record.
pub const DEFAULT_UNREGISTER_MAX_RETRIES: usize = 5;

/// Initial backoff of the guaranteed delete.
pub const DEFAULT_UNREGISTER_MIN_DELAY_MS: u64 = 50;

/// Backoff ceiling of the guaranteed delete.
pub const DEFAULT_UNREGISTER_MAX_DELAY_MS: u64 = 2_000;

/// Attempts made to rearm a listener's watch before the listener gives up.
pub const DEFAULT_WATCH_REARM_MAX_RETRIES: usize = 10;

/// Initial backoff between watch rearm attempts.
pub const DEFAULT_WATCH_REARM_MIN_DELAY_MS: u64 = 50;

/// Backoff ceiling between watch rearm attempts.
pub const DEFAULT_WATCH_REARM_MAX_DELAY_MS: u64 = 2_000;
