//! Library half of the `toolmesh` binary, so the command implementations can
//! be exercised from integration tests.

pub mod commands;
