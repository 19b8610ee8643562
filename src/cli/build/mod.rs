mod connect;
mod core;
pub mod progress;
mod select;
mod start;

pub use connect::{connect, tunnel, TunnelOptions};
pub use core::{
    delete_build, download_patch, download_sources, ipa, list_builds, list_flutter_versions,
    print_logs, show_build, stop_build,
};
pub use start::{start, StartArgs};
