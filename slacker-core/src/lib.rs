pub mod dashboard;
pub mod message;
pub mod model;
pub mod resolver;

pub use dashboard::Dashboard;
pub use model::*;
pub use resolver::{resolve, CheckRun, Resolution, Review, Signals};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

fn short_hash(hash: &str) -> String {
    if hash.len() >= 8 {
        hash[..8].to_string()
    } else {
        hash.to_string()
    }
}

/// Short revision of the running build, for health and status responses.
pub fn get_bot_version() -> String {
    if let Some(git_hash) = option_env!("SLACKER_GIT_HASH") {
        short_hash(git_hash)
    } else if let Some(git_hash) = built_info::GIT_COMMIT_HASH {
        short_hash(git_hash)
    } else {
        built_info::PKG_VERSION.to_string()
    }
}
