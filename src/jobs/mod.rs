pub mod cleanup;
pub mod usage_sync;
