mod replay;
mod serve;

pub use replay::{execute_replay, replay_lines, ReplayReport};
pub use serve::execute_serve;
