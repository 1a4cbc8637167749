//! command line interface of `groupfs`
mod cli_struct;
pub use cli_struct::*;
