//! Frame codec integration tests
