//! Post-download workers: preview generation and artifact cleanup

pub mod cleanup;
pub mod preview;
pub mod storage;
