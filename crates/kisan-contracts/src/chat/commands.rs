/// Slash commands accepted by the interactive assistant shell. Anything
/// that is not a slash command is treated as a chat prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    Noop,
    Help,
    Quit,
    Clear,
    Status,
    Insights,
    SetLanguage { code: String },
    Analyze { path: String },
    Forecast { city: String },
    Unknown { command: String },
    Prompt { text: String },
}

pub const SHELL_HELP: &[&str] = &[
    "/help",
    "/lang <en|hi|mr>",
    "/status",
    "/insights",
    "/analyze <image-path>",
    "/forecast <city>",
    "/clear",
    "/quit",
];

fn first_word(arg: &str) -> String {
    // Quoted paths survive shell-style splitting; on malformed quoting
    // fall back to whitespace splitting like the rest of the shell.
    let parts = match shell_words::split(arg) {
        Ok(parts) => parts,
        Err(_) => arg.split_whitespace().map(str::to_string).collect(),
    };
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

pub fn parse_command(text: &str) -> ShellCommand {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ShellCommand::Noop;
    }

    let Some(tail) = trimmed.strip_prefix('/') else {
        return ShellCommand::Prompt {
            text: trimmed.to_string(),
        };
    };

    let command_len = tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    if command_len == 0 {
        return ShellCommand::Prompt {
            text: trimmed.to_string(),
        };
    }

    let command = tail[..command_len].to_ascii_lowercase();
    let arg = tail[command_len..].trim();

    match command.as_str() {
        "help" => ShellCommand::Help,
        "quit" | "exit" => ShellCommand::Quit,
        "clear" => ShellCommand::Clear,
        "status" => ShellCommand::Status,
        "insights" => ShellCommand::Insights,
        "lang" => ShellCommand::SetLanguage {
            code: arg.to_string(),
        },
        "analyze" => ShellCommand::Analyze {
            path: first_word(arg),
        },
        "forecast" => ShellCommand::Forecast {
            city: arg.to_string(),
        },
        _ => ShellCommand::Unknown { command },
    }
}
