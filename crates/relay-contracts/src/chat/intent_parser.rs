use super::command_registry::{
    find_spec, CommandKind, CommandSpec, NO_ARG_COMMANDS, PATH_PROMPT_COMMANDS, RAW_ARG_COMMANDS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Noop,
    Chat { prompt: String },
    SetModel { model: String },
    SetImageModel { model: String },
    Generate { prompt: String },
    Edit { path: String, prompt: String },
    Enhance { path: String, prompt: Option<String> },
    Reset,
    History,
    Limits,
    Models,
    Help,
    Quit,
    /// A known command given without its required arguments.
    Usage { usage: &'static str },
    Unknown { command: String, arg: String },
}

/// Byte offset where the first shell word of `arg` ends.
fn first_word_end(arg: &str) -> usize {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (index, ch) in arg.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, ch) {
            (Some('\''), '\'') => quote = None,
            (Some('\''), _) => {}
            (_, '\\') => escaped = true,
            (Some('"'), '"') => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(ch),
            (None, ch) if ch.is_whitespace() => return index,
            (None, _) => {}
        }
    }
    arg.len()
}

/// Splits `<path> <prompt…>`. The path may be quoted or escaped; the prompt
/// is the raw remainder after it, quotes included.
fn split_path_and_prompt(arg: &str) -> Option<(String, String)> {
    let arg = arg.trim();
    if arg.is_empty() {
        return None;
    }
    let (token, rest) = arg.split_at(first_word_end(arg));
    let path = shell_words::split(token)
        .ok()
        .and_then(|words| words.into_iter().next())
        .unwrap_or_else(|| token.to_string());
    if path.is_empty() {
        return None;
    }
    Some((path, rest.trim().to_string()))
}

fn raw_arg_intent(spec: CommandSpec, arg: &str) -> Intent {
    if arg.is_empty() {
        return Intent::Usage { usage: spec.usage };
    }
    let value = arg.to_string();
    match spec.kind {
        CommandKind::SetModel => Intent::SetModel { model: value },
        CommandKind::SetImageModel => Intent::SetImageModel { model: value },
        _ => Intent::Generate { prompt: value },
    }
}

fn path_prompt_intent(spec: CommandSpec, arg: &str) -> Intent {
    let Some((path, prompt)) = split_path_and_prompt(arg) else {
        return Intent::Usage { usage: spec.usage };
    };
    match spec.kind {
        CommandKind::Edit if prompt.trim().is_empty() => Intent::Usage { usage: spec.usage },
        CommandKind::Edit => Intent::Edit { path, prompt },
        _ => Intent::Enhance {
            path,
            prompt: Some(prompt).filter(|value| !value.trim().is_empty()),
        },
    }
}

fn no_arg_intent(spec: CommandSpec) -> Intent {
    match spec.kind {
        CommandKind::Reset => Intent::Reset,
        CommandKind::History => Intent::History,
        CommandKind::Limits => Intent::Limits,
        CommandKind::Models => Intent::Models,
        CommandKind::Quit => Intent::Quit,
        _ => Intent::Help,
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::Noop;
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(spec) = find_spec(&command, RAW_ARG_COMMANDS) {
                return raw_arg_intent(spec, arg);
            }
            if let Some(spec) = find_spec(&command, PATH_PROMPT_COMMANDS) {
                return path_prompt_intent(spec, arg);
            }
            if let Some(spec) = find_spec(&command, NO_ARG_COMMANDS) {
                return no_arg_intent(spec);
            }
            return Intent::Unknown {
                command,
                arg: arg.to_string(),
            };
        }
    }

    Intent::Chat {
        prompt: raw_trimmed.to_string(),
    }
}
