#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CommandKind {
    SetModel,
    SetImageModel,
    Generate,
    Edit,
    Enhance,
    Reset,
    History,
    Limits,
    Models,
    Help,
    Quit,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub kind: CommandKind,
    pub usage: &'static str,
}

/// Commands whose whole remainder is one raw argument.
pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "model",
        kind: CommandKind::SetModel,
        usage: "/model <id>",
    },
    CommandSpec {
        command: "image_model",
        kind: CommandKind::SetImageModel,
        usage: "/image_model <id>",
    },
    CommandSpec {
        command: "generate",
        kind: CommandKind::Generate,
        usage: "/generate <prompt>",
    },
];

/// Commands taking an image path followed by free prompt text.
pub(crate) const PATH_PROMPT_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "edit",
        kind: CommandKind::Edit,
        usage: "/edit <path> <prompt>",
    },
    CommandSpec {
        command: "enhance",
        kind: CommandKind::Enhance,
        usage: "/enhance <path> [prompt]",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "reset",
        kind: CommandKind::Reset,
        usage: "/reset",
    },
    CommandSpec {
        command: "history",
        kind: CommandKind::History,
        usage: "/history",
    },
    CommandSpec {
        command: "limits",
        kind: CommandKind::Limits,
        usage: "/limits",
    },
    CommandSpec {
        command: "models",
        kind: CommandKind::Models,
        usage: "/models",
    },
    CommandSpec {
        command: "help",
        kind: CommandKind::Help,
        usage: "/help",
    },
    CommandSpec {
        command: "quit",
        kind: CommandKind::Quit,
        usage: "/quit",
    },
    CommandSpec {
        command: "exit",
        kind: CommandKind::Quit,
        usage: "/exit",
    },
];

pub const CHAT_HELP_COMMANDS: &[(&str, &str)] = &[
    ("/model <id>", "switch the chat model"),
    ("/image_model <id>", "switch the image model"),
    ("/generate <prompt>", "generate an image"),
    ("/edit <path> <prompt>", "edit an image with a prompt"),
    ("/enhance <path> [prompt]", "enhance an image"),
    ("/reset", "clear the conversation"),
    ("/history", "print the conversation"),
    ("/limits", "show remaining requests"),
    ("/models", "list known models"),
    ("/help", "show this help"),
    ("/quit", "leave the session"),
];

pub(crate) fn find_spec(command: &str, specs: &[CommandSpec]) -> Option<CommandSpec> {
    specs.iter().find(|spec| spec.command == command).copied()
}
