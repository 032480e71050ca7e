// ABOUTME: Command implementations for the switchover CLI
// ABOUTME: Exports sync, final_sync, and status commands

pub mod final_sync;
pub mod status;
pub mod sync;

pub use final_sync::final_sync;
pub use status::status;
pub use sync::sync;
