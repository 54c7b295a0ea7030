pub mod protocol;
pub mod timestamp;
pub mod journal;
pub mod session;
pub mod discovery;
pub mod test_util;
