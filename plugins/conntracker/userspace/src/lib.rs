//! Conntracker plugin: loads the XDP connection tracker, publishes filter
//! rules into its enforcement table and reads its telemetry maps.

pub mod loader;
pub mod reader;
pub mod table;
