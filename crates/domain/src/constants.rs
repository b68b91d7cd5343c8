//! Protocol constants shared by producers and consumers.

/// Priority for every sync message (0..=9 scale).
pub const NORMAL_PRIORITY: u8 = 4;

/// Deliveries allowed before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 20;

/// Prefix of failure confirmations caused by invalid input.
pub const VALIDATION_ERROR_PREFIX: &str = "validation error: ";

/// Prefix of failure confirmations caused by retryable failures.
pub const TRANSIENT_ERROR_PREFIX: &str = "transient error: ";

/// Prefix of failure confirmations caused by integrity violations.
pub const SECURITY_ERROR_PREFIX: &str = "security error: ";

/// Recorded failures after which reconciliation stops resending a row.
pub const DEFAULT_MAX_RESEND_ATTEMPTS: u32 = 10;

/// Longest error text persisted on audit rows and dead letters.
pub const MAX_ERROR_LEN: usize = 1024;

/// Default bounded concurrency per queue.
pub const DOCUMENT_SYNC_CONCURRENCY: usize = 10;
pub const DOCUMENT_CONFIRMATION_CONCURRENCY: usize = 5;
pub const USER_SYNC_CONCURRENCY: usize = 5;
pub const USER_CONFIRMATION_CONCURRENCY: usize = 3;
