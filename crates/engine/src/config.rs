use time::Duration;

/// Engine configuration.
///
/// Constructed by the embedding process and passed into component
/// constructors; components never reach for global state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Files larger than this are split into fixed-offset chunks of
    /// exactly this size (the final chunk may be shorter). Snapshotted
    /// onto every ticket at issuance.
    pub chunk_threshold: usize,
    /// Ceiling on a single stored blob. A chunk that would exceed this
    /// is stored as a small part-tree instead.
    pub chunk_ceiling: usize,
    /// Maximum number of children a collection may carry.
    pub max_collection_children: usize,
    /// Ticket lifetime used when the caller does not ask for one.
    pub default_ticket_ttl: Duration,
    /// Hard ceiling on ticket lifetime; requested TTLs are clamped.
    pub max_ticket_ttl: Duration,
    /// Quota applied to realms that have not had one set explicitly.
    pub default_quota_limit: u64,
    /// Bounded retries for optimistic conditional updates before the
    /// conflict is surfaced to the caller.
    pub cas_retry_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_threshold: 1024 * 1024,
            chunk_ceiling: 4 * 1024 * 1024,
            max_collection_children: 10_000,
            default_ticket_ttl: Duration::minutes(15),
            max_ticket_ttl: Duration::hours(1),
            default_quota_limit: 10 * 1024 * 1024 * 1024,
            cas_retry_limit: 8,
        }
    }
}
