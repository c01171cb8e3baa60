//! Hard limits per tenant. Requests beyond these fail with `LimitExceeded`
//! instead of growing memory or WAL without bound.

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_POOLS_PER_TENANT: usize = 100_000;
/// Pending plus confirmed bookings on one pool; cancelled rows do not count.
pub const MAX_BOOKINGS_PER_POOL: usize = 10_000;
pub const MAX_WORKERS_PER_TENANT: usize = 1_000_000;

/// Upper bound on a single pool's declared capacity.
pub const MAX_POOL_CAPACITY: u32 = 10_000;

/// Dates accepted by one `duplicate_pool` call.
pub const MAX_DUPLICATE_DATES: usize = 7;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 1_024;

/// How long a mutation waits for its pool, or for the commit gate, before
/// reporting a retryable conflict.
pub const LOCK_TIMEOUT_MS: u64 = 2_000;

/// Ids accepted in one `IN (...)` / multi-row statement.
pub const MAX_BATCH_ROWS: usize = 64;
