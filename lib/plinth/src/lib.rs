//! Shared groundwork for the daemons in this workspace: logging setup,
//! configuration loading and the process-level glue (privilege drop,
//! daemonization, pid files) every service binary needs.

pub mod config;
pub mod logging;
pub mod os;
pub mod time;
