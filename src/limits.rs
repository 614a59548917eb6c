use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_OWNERS_PER_TENANT: usize = 100_000;
pub const MAX_OWNER_LEN: usize = 256;
pub const MAX_IDENTITY_LEN: usize = 512;
pub const MAX_MEMBERS_PER_OWNER: usize = 64;
pub const MAX_REQUESTS_PER_OWNER: usize = 10_000;
pub const MAX_TEXT_LEN: usize = 4096;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A booking request may not be longer than one day.
pub const MAX_REQUEST_DURATION_MS: Ms = 86_400_000;

pub const MIN_SLOT_DURATION_MS: Ms = 5 * 60_000;
pub const MAX_SLOT_DURATION_MS: Ms = 86_400_000;
