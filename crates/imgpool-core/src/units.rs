//! Byte-size constants.

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;
