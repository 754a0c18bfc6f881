//! 斜杠命令
//!
//! 命令表是静态的 CommandSpec 列表；parse 把一行输入解析为 Input（不以 `/` 开头的普通消息）或强类型的 SlashCommand。

/// 命令分类（用于 /help 分组）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCategory {
    General,
    Conversation,
    Model,
    Session,
}

impl CommandCategory {
    pub fn label(&self) -> &'static str {
        match self {
            CommandCategory::General => "General",
            CommandCategory::Conversation => "Conversation",
            CommandCategory::Model => "Model",
            CommandCategory::Session => "Sessions",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub usage: &'static str,
    pub description: &'static str,
    pub category: CommandCategory,
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "help", usage: "/help", description: "Show available commands", category: CommandCategory::General },
    CommandSpec { name: "quit", usage: "/quit", description: "Save the session and exit", category: CommandCategory::General },
    CommandSpec { name: "tools", usage: "/tools", description: "Toggle tool use (web search, files) on and off", category: CommandCategory::General },
    CommandSpec { name: "system", usage: "/system [text|\"\"]", description: "View, set or clear the system prompt", category: CommandCategory::Conversation },
    CommandSpec { name: "clear", usage: "/clear", description: "Clear conversation history and summary", category: CommandCategory::Conversation },
    CommandSpec { name: "history", usage: "/history", description: "Print conversation history", category: CommandCategory::Conversation },
    CommandSpec { name: "summary", usage: "/summary", description: "Show the rolling conversation summary", category: CommandCategory::Conversation },
    CommandSpec { name: "models", usage: "/models", description: "List available models (* = current)", category: CommandCategory::Model },
    CommandSpec { name: "model", usage: "/model <name>", description: "Switch to the specified model", category: CommandCategory::Model },
    CommandSpec { name: "new", usage: "/new", description: "Start a new session", category: CommandCategory::Session },
    CommandSpec { name: "sessions", usage: "/sessions", description: "List saved sessions (* = current)", category: CommandCategory::Session },
    CommandSpec { name: "switch", usage: "/switch <id>", description: "Switch to another session", category: CommandCategory::Session },
    CommandSpec { name: "delete", usage: "/delete <id>", description: "Delete a session (not the current one)", category: CommandCategory::Session },
    CommandSpec { name: "title", usage: "/title [text]", description: "View or set the session title", category: CommandCategory::Session },
];

/// 解析后的斜杠命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    Quit,
    Tools,
    /// None = 查看；Some("") = 清空
    System(Option<String>),
    Clear,
    History,
    Summary,
    Models,
    Model(String),
    New,
    Sessions,
    Switch(i64),
    Delete(i64),
    Title(Option<String>),
}

/// 一行用户输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Message(String),
    Command(SlashCommand),
}

pub fn find(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.name == name)
}

/// 解析一行输入；空行返回 Ok(None)
pub fn parse(line: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Input::Message(line.to_string())));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    let spec = find(name).ok_or_else(|| format!("Unknown command: /{}", name))?;
    let usage = || format!("Usage: {}", spec.usage);
    let optional = |args: &str| (!args.is_empty()).then(|| args.to_string());

    let cmd = match spec.name {
        "help" => SlashCommand::Help,
        "quit" => SlashCommand::Quit,
        "tools" => SlashCommand::Tools,
        "system" => SlashCommand::System(match args {
            "" => None,
            "\"\"" | "''" => Some(String::new()),
            text => Some(text.to_string()),
        }),
        "clear" => SlashCommand::Clear,
        "history" => SlashCommand::History,
        "summary" => SlashCommand::Summary,
        "models" => SlashCommand::Models,
        "model" if args.is_empty() => return Err(usage()),
        "model" => SlashCommand::Model(args.to_string()),
        "new" => SlashCommand::New,
        "sessions" => SlashCommand::Sessions,
        "switch" => SlashCommand::Switch(args.parse().map_err(|_| usage())?),
        "delete" => SlashCommand::Delete(args.parse().map_err(|_| usage())?),
        "title" => SlashCommand::Title(optional(args)),
        _ => return Err(format!("Unknown command: /{}", name)),
    };
    Ok(Some(Input::Command(cmd)))
}

/// 以 `/` 开头且尚无空格时，返回可补全的命令名
pub fn completions(prefix: &str) -> Vec<&'static str> {
    match prefix.strip_prefix('/') {
        Some(word) if !word.contains(char::is_whitespace) => COMMANDS
            .iter()
            .filter(|c| c.name.starts_with(word))
            .map(|c| c.name)
            .collect(),
        _ => Vec::new(),
    }
}

/// /help 的文本，按分类分组
pub fn help_text() -> String {
    let width = COMMANDS.iter().map(|c| c.usage.len()).max().unwrap_or(0);
    let mut out = String::from("Available commands:");
    let categories = [
        CommandCategory::General,
        CommandCategory::Conversation,
        CommandCategory::Model,
        CommandCategory::Session,
    ];
    for category in categories {
        out.push_str(&format!("\n{}:", category.label()));
        for c in COMMANDS.iter().filter(|c| c.category == category) {
            out.push_str(&format!("\n  {:width$}  {}", c.usage, c.description, width = width));
        }
    }
    out.push_str("\nKeys: Enter send · Ctrl+C cancel generation · Ctrl+Q quit · Tab complete");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(line: &str) -> SlashCommand {
        match parse(line).unwrap().unwrap() {
            Input::Command(c) => c,
            other => panic!("expected command, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_text_is_message() {
        assert_eq!(
            parse("  hello there ").unwrap(),
            Some(Input::Message("hello there".to_string()))
        );
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn test_system_variants() {
        assert_eq!(cmd("/system"), SlashCommand::System(None));
        assert_eq!(cmd("/system \"\""), SlashCommand::System(Some(String::new())));
        assert_eq!(
            cmd("/system You are   terse"),
            SlashCommand::System(Some("You are   terse".to_string()))
        );
    }

    #[test]
    fn test_argument_validation() {
        assert_eq!(cmd("/switch 3"), SlashCommand::Switch(3));
        assert_eq!(cmd("/delete 12"), SlashCommand::Delete(12));
        assert_eq!(parse("/switch abc").unwrap_err(), "Usage: /switch <id>");
        assert_eq!(parse("/model").unwrap_err(), "Usage: /model <name>");
        assert_eq!(cmd("/model gpt-4o"), SlashCommand::Model("gpt-4o".to_string()));
        assert_eq!(cmd("/title"), SlashCommand::Title(None));
        assert_eq!(cmd("/title My chat"), SlashCommand::Title(Some("My chat".to_string())));
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(parse("/bogus x").unwrap_err(), "Unknown command: /bogus");
    }

    #[test]
    fn test_completions() {
        assert_eq!(completions("/mo"), vec!["models", "model"]);
        assert!(completions("/model x").is_empty());
        assert!(completions("mo").is_empty());
        assert_eq!(completions("/").len(), COMMANDS.len());
    }

    #[test]
    fn test_help_lists_every_command() {
        let help = help_text();
        for c in COMMANDS {
            assert!(help.contains(c.usage), "missing {}", c.name);
        }
    }
}
