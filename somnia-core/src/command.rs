//! Session command protocol
//!
//! One line of input is `<command> [args...]`, whitespace separated. Parsing
//! happens in two steps: [`parse_line`] splits the line, [`resolve`] checks
//! the command table and the per-command argument rules and yields a typed
//! [`Command`]. Nothing executes until both succeed.

use thiserror::Error;

/// A command the session understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help { topic: Option<String> },
    Clear,
    History,
    Dream,
    Status,
    Fund { amount: f64 },
    Balance,
    Models { refresh: bool },
    Model { id: String },
    Sync,
    Identity,
    Exit,
}

/// Table entry describing one command.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub usage: &'static str,
    pub description: &'static str,
    pub min_args: usize,
    pub max_args: usize,
}

impl CommandSpec {
    const fn new(
        name: &'static str,
        aliases: &'static [&'static str],
        usage: &'static str,
        description: &'static str,
        min_args: usize,
        max_args: usize,
    ) -> Self {
        Self {
            name,
            aliases,
            usage,
            description,
            min_args,
            max_args,
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.name == name || self.aliases.contains(&name)
    }
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("help", &[], "help [command]", "Show available commands or describe one", 0, 1),
    CommandSpec::new("clear", &[], "clear", "Clear the session output", 0, 0),
    CommandSpec::new("history", &[], "history", "Show previously entered lines", 0, 0),
    CommandSpec::new("dream", &[], "dream", "Record and analyze a new dream", 0, 0),
    CommandSpec::new("status", &[], "status", "Show session and worker status", 0, 0),
    CommandSpec::new("fund", &[], "fund <amount>", "Add funds to the compute ledger", 1, 1),
    CommandSpec::new("balance", &[], "balance", "Check the compute ledger balance", 0, 0),
    CommandSpec::new("models", &[], "models [refresh]", "List available inference models", 0, 1),
    CommandSpec::new("model", &[], "model <id>", "Select the inference model", 1, 1),
    CommandSpec::new("sync", &[], "sync", "Re-read the agent identity from the ledger", 0, 0),
    CommandSpec::new("identity", &[], "identity", "Show the agent's traits and dream count", 0, 0),
    CommandSpec::new("exit", &["quit"], "exit", "End the session", 0, 0),
];

/// All commands in display order.
pub fn command_specs() -> &'static [CommandSpec] {
    COMMANDS
}

pub fn find_spec(name: &str) -> Option<&'static CommandSpec> {
    let name = name.to_lowercase();
    COMMANDS.iter().find(|spec| spec.matches(&name))
}

/// A line split into its command word and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub command: String,
    pub args: Vec<String>,
}

/// Split a line; `None` for blank input.
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    let mut words = line.split_whitespace();
    let command = words.next()?.to_lowercase();
    Some(ParsedLine {
        command,
        args: words.map(str::to_string).collect(),
    })
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("unknown command '{0}', type 'help' for a list")]
    Unknown(String),

    #[error("usage: {usage}")]
    ArgumentCount { command: String, usage: &'static str },

    #[error("{command}: {message}")]
    InvalidArgument { command: String, message: String },
}

/// Check a parsed line against the command table.
pub fn resolve(parsed: &ParsedLine) -> Result<Command, CommandError> {
    let spec = find_spec(&parsed.command)
        .ok_or_else(|| CommandError::Unknown(parsed.command.clone()))?;

    let count = parsed.args.len();
    if count < spec.min_args || count > spec.max_args {
        return Err(CommandError::ArgumentCount {
            command: spec.name.to_string(),
            usage: spec.usage,
        });
    }

    let first = parsed.args.first().map(String::as_str);
    let invalid = |message: String| CommandError::InvalidArgument {
        command: spec.name.to_string(),
        message,
    };

    let command = match spec.name {
        "help" => match first {
            Some(topic) => match find_spec(topic) {
                Some(found) => Command::Help {
                    topic: Some(found.name.to_string()),
                },
                None => return Err(invalid(format!("no such command '{}'", topic))),
            },
            None => Command::Help { topic: None },
        },
        "clear" => Command::Clear,
        "history" => Command::History,
        "dream" => Command::Dream,
        "status" => Command::Status,
        "fund" => {
            let raw = first.unwrap_or_default();
            let amount = parse_amount(raw)
                .ok_or_else(|| invalid(format!("'{}' is not a positive decimal amount", raw)))?;
            Command::Fund { amount }
        }
        "balance" => Command::Balance,
        "models" => match first {
            Some(arg) if arg.eq_ignore_ascii_case("refresh") => Command::Models { refresh: true },
            Some(arg) => return Err(invalid(format!("unexpected argument '{}'", arg))),
            None => Command::Models { refresh: false },
        },
        "model" => Command::Model {
            id: first.unwrap_or_default().to_string(),
        },
        "sync" => Command::Sync,
        "identity" => Command::Identity,
        "exit" => Command::Exit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(command)
}

/// Plain decimal notation only: digits with at most one decimal point.
fn parse_amount(raw: &str) -> Option<f64> {
    let well_formed = !raw.is_empty()
        && raw.chars().all(|c| c.is_ascii_digit() || c == '.')
        && raw.chars().filter(|c| *c == '.').count() <= 1
        && raw.chars().any(|c| c.is_ascii_digit());
    if !well_formed {
        return None;
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite() && *v > 0.0)
}

/// Help text: the full table, or a single command.
pub fn help_lines(topic: Option<&str>) -> Vec<String> {
    match topic.and_then(find_spec) {
        Some(spec) => {
            let mut lines = vec![format!("{} - {}", spec.usage, spec.description)];
            if !spec.aliases.is_empty() {
                lines.push(format!("aliases: {}", spec.aliases.join(", ")));
            }
            lines
        }
        None => {
            let width = COMMANDS.iter().map(|c| c.usage.len()).max().unwrap_or(0);
            let mut lines = vec!["Available commands:".to_string()];
            lines.extend(
                COMMANDS
                    .iter()
                    .map(|c| format!("  {:<width$}  {}", c.usage, c.description, width = width)),
            );
            lines
        }
    }
}
