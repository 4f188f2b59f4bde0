// Daemonization and single-instance lockfile

mod daemonize;
mod lockfile;

pub use daemonize::daemonize;
pub use lockfile::Lockfile;
