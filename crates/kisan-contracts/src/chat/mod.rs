mod commands;
mod log;

pub use commands::{parse_command, ShellCommand, SHELL_HELP};
pub use log::{ChatLog, ChatMessage, Role};
