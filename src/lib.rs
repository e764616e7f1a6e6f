pub mod config;
pub mod filter;
pub mod message;
pub mod output;
pub mod protocol;
pub mod reconstruct;
pub mod rspamd;
pub mod session;

pub use config::Config;
pub use filter::Filter;
pub use output::{spawn_writer, Output};
pub use rspamd::{Scanner, Verdict};
