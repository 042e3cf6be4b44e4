//! HPACK integration tests

mod encoding;
