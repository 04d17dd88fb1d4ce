//! Mockbox Config - environment variable names and typed parsing helpers
//! shared by the orchestrator library and the `mockbox` binary.

pub mod constants;
pub mod env;

pub use env::{
    env_list, env_string, parse_env_flag, parse_env_or_default,
    parse_env_or_default_with_validation,
};
