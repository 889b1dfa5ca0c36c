//! Tuning constants for the sync engine. Centralized so the numbers are
//! discoverable and (where it makes sense) overridable from config.

/// IDLE connection timeout in seconds before we drop out and re-issue
/// IDLE. RFC 3501 recommends clients re-issue IDLE at least every 29
/// minutes; we refresh sooner for reliability across flaky NATs.
pub const IDLE_TIMEOUT_SECS: u64 = 300;

/// Batch size for flag/label STORE and CONDSTORE-changed-flags fetch
/// operations, to stay well under typical IMAP command line length limits.
pub const FLAG_SYNC_BATCH_SIZE: usize = 500;
pub const CONDSTORE_FLAGS_REFRESH_BATCH_SIZE: usize = 500;

/// Maximum retry delay in seconds for connection attempts, and the number
/// of retries before an account's monitor gives up and surfaces the error.
pub const MAX_RETRY_DELAY_SECS: u64 = 30;
pub const MAX_RETRIES: u32 = 10;

/// Fixed backoff between retries of a single Crispin operation (matches
/// the 5-second sleep `retry_crispin` uses upstream).
pub const RETRY_SLEEP_SECS: u64 = 5;

/// Bodies larger than this are not fetched in full; we record metadata
/// only and mark the message truncated.
pub const MAX_MESSAGE_BODY_LENGTH: usize = 20 * 1024 * 1024;

/// After this many consecutive UIDVALIDITY-triggered resyncs for the same
/// folder without reaching a stable `poll` phase, the folder's engine
/// gives up and marks the folder `Done` rather than resync forever.
pub const MAX_UIDINVALID_RESYNCS: u32 = 10;

/// Default readonly connection pool size per account (most operations:
/// fetch, search, IDLE).
pub const DEFAULT_READONLY_POOL_SIZE: usize = 3;

/// Writable pool size per account (STORE, EXPUNGE, APPEND, COPY) — kept
/// at 1 because concurrent writers against the same mailbox risk racing
/// sequence numbers.
pub const DEFAULT_WRITABLE_POOL_SIZE: usize = 1;

/// Pool size used instead of the defaults above when an account is
/// throttled (provider asked us to back off).
pub const THROTTLED_POOL_SIZE: usize = 1;

/// How long `ConnectionPool::acquire` waits for a permit before returning
/// `SyncError::PoolTimeout`.
pub const POOL_ACQUIRE_TIMEOUT_SECS: u64 = 120;

/// Default interval between slow full-refresh passes (see
/// `SPEC_FULL.md` open-question resolution); overridable per account.
pub const DEFAULT_SLOW_REFRESH_INTERVAL_SECS: u64 = 12 * 60 * 60;

/// How often a settled (`Poll`-phase) Folder Sync Engine wakes up to
/// check for new mail when IDLE isn't in use or has just timed out.
pub const FOLDER_POLL_INTERVAL_SECS: u64 = 60;

/// OAuth2 access tokens are treated as expired this many seconds before
/// their provider-reported expiry, to leave margin for the request that
/// will actually use the token.
pub const OAUTH_EXPIRY_SAFETY_MARGIN_SECS: i64 = 10;
