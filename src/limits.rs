/// Highest sequence number representable in the three-digit key slot.
pub const MAX_SEQUENCE: u16 = 999;

pub const MAX_BATCH_SIZE: usize = 500;
pub const MAX_IMPORT_SIZE: usize = 10_000;
pub const MAX_FIELD_LEN: usize = 512;
pub const MAX_BRANCH_NAME_LEN: usize = 64;
