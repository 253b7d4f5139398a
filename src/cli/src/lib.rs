//! Lockbox CLI - offline-update bundle builder.

pub mod commands;
