//! Text command console.
//!
//! This module provides:
//! - A command table the host fills with definitions and handlers
//! - Built-in `help`, `history`, `clear` and `echo`
//! - Prefix completion and bounded command history
//! - The `inv.*` command set driving an [`InventoryManager`]

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use suspense_common::{InventoryId, ItemId};
use suspense_inventory::InventoryManager;
use thiserror::Error;
use tracing::debug;

use crate::debugger::InventoryDebugger;

/// Default maximum history entries.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// Default maximum output lines.
pub const DEFAULT_OUTPUT_SIZE: usize = 1000;

/// Output message level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputLevel {
    /// Normal output
    #[default]
    Info,
    /// Success/confirmation message
    Success,
    /// Warning message
    Warning,
    /// Error message
    Error,
    /// System message
    System,
    /// User command echo
    Command,
}

impl OutputLevel {
    /// Prefix used when printing to a plain terminal.
    #[must_use]
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::Info => "",
            Self::Success => "ok: ",
            Self::Warning => "warn: ",
            Self::Error => "error: ",
            Self::System => "# ",
            Self::Command => "> ",
        }
    }
}

/// A line of console output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    /// The text content
    pub text: String,
    /// Output level
    pub level: OutputLevel,
}

impl OutputLine {
    /// Creates a new output line.
    #[must_use]
    pub fn new(text: impl Into<String>, level: OutputLevel) -> Self {
        Self {
            text: text.into(),
            level,
        }
    }

    /// Creates an info line.
    #[must_use]
    pub fn info(text: impl Into<String>) -> Self {
        Self::new(text, OutputLevel::Info)
    }

    /// Creates a success line.
    #[must_use]
    pub fn success(text: impl Into<String>) -> Self {
        Self::new(text, OutputLevel::Success)
    }

    /// Creates a warning line.
    #[must_use]
    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(text, OutputLevel::Warning)
    }

    /// Creates an error line.
    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self::new(text, OutputLevel::Error)
    }

    /// Creates a system line.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(text, OutputLevel::System)
    }
}

impl std::fmt::Display for OutputLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.level.prefix(), self.text)
    }
}

/// Command definition for registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDef {
    /// Command name (what user types)
    pub name: String,
    /// Brief description
    pub description: String,
    /// Usage syntax
    pub usage: String,
    /// Category for grouping
    pub category: String,
}

impl CommandDef {
    /// Creates a new command definition.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        usage: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            usage: usage.into(),
            category: "General".to_string(),
        }
    }

    /// Sets the category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

/// Result of executing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Output lines to display
    pub output: Vec<OutputLine>,
    /// Whether the command was successful
    pub success: bool,
}

impl CommandResult {
    /// Creates a successful result with output.
    #[must_use]
    pub fn ok(output: Vec<OutputLine>) -> Self {
        Self {
            output,
            success: true,
        }
    }

    /// Creates a successful result with a single message.
    #[must_use]
    pub fn ok_msg(msg: impl Into<String>) -> Self {
        Self::ok(vec![OutputLine::success(msg)])
    }

    /// Creates an error result.
    #[must_use]
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            output: vec![OutputLine::error(msg)],
            success: false,
        }
    }

    /// Creates a result with multiple output lines; fails if any line is an error.
    #[must_use]
    pub fn with_lines(lines: Vec<OutputLine>) -> Self {
        let success = !lines.iter().any(|l| l.level == OutputLevel::Error);
        Self {
            output: lines,
            success,
        }
    }
}

/// Argument parsing failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgError {
    /// Required argument absent
    #[error("missing argument <{0}>")]
    Missing(&'static str),

    /// Argument did not parse
    #[error("invalid <{name}>: {value}")]
    Invalid {
        /// Argument name
        name: &'static str,
        /// Text given
        value: String,
    },
}

/// Parses a required argument.
pub fn arg<T: std::str::FromStr>(
    args: &[&str],
    index: usize,
    name: &'static str,
) -> Result<T, ArgError> {
    let raw = args.get(index).ok_or(ArgError::Missing(name))?;
    raw.parse().map_err(|_| ArgError::Invalid {
        name,
        value: (*raw).to_string(),
    })
}

/// Parses an optional argument, using `default` when absent.
pub fn arg_or<T: std::str::FromStr>(
    args: &[&str],
    index: usize,
    name: &'static str,
    default: T,
) -> Result<T, ArgError> {
    if args.get(index).is_none() {
        return Ok(default);
    }
    arg(args, index, name)
}

/// Console configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Maximum command history entries
    pub max_history: usize,
    /// Maximum output lines
    pub max_output: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_HISTORY_SIZE,
            max_output: DEFAULT_OUTPUT_SIZE,
        }
    }
}

/// Handler invoked with the host context and the command's arguments.
pub type CommandHandler<C> = Box<dyn Fn(&mut C, &[&str]) -> CommandResult + Send + Sync>;

struct Registered<C> {
    def: CommandDef,
    handler: Option<CommandHandler<C>>,
}

/// Command table over a host context `C`.
pub struct CommandTable<C> {
    config: ConsoleConfig,
    commands: Vec<Registered<C>>,
    history: VecDeque<String>,
    output: VecDeque<OutputLine>,
}

impl<C> std::fmt::Debug for CommandTable<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandTable")
            .field("commands", &self.commands.len())
            .field("history", &self.history.len())
            .field("output", &self.output.len())
            .finish()
    }
}

impl<C> Default for CommandTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CommandTable<C> {
    /// Creates a table with the built-in commands.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ConsoleConfig::default())
    }

    /// Creates with custom configuration.
    #[must_use]
    pub fn with_config(config: ConsoleConfig) -> Self {
        let mut table = Self {
            config,
            commands: Vec::new(),
            history: VecDeque::new(),
            output: VecDeque::new(),
        };
        table.register_builtin_commands();
        table
    }

    fn register_builtin_commands(&mut self) {
        self.register_command(CommandDef::new("help", "Show available commands", "help [command]"));
        self.register_command(CommandDef::new("clear", "Clear the console output", "clear"));
        self.register_command(CommandDef::new("history", "Show command history", "history"));
        self.register_command(
            CommandDef::new("echo", "Print a message", "echo <message>").with_category("Utility"),
        );
    }

    /// Registers a command without a handler. Duplicates are ignored.
    pub fn register_command(&mut self, def: CommandDef) {
        if !self.contains(&def.name) {
            self.commands.push(Registered { def, handler: None });
        }
    }

    /// Registers a command and its handler, replacing any previous handler.
    pub fn register<F>(&mut self, def: CommandDef, handler: F)
    where
        F: Fn(&mut C, &[&str]) -> CommandResult + Send + Sync + 'static,
    {
        let handler: CommandHandler<C> = Box::new(handler);
        match self.commands.iter_mut().find(|c| c.def.name == def.name) {
            Some(existing) => {
                existing.def = def;
                existing.handler = Some(handler);
            }
            None => self.commands.push(Registered {
                def,
                handler: Some(handler),
            }),
        }
    }

    /// Checks if a command is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.commands.iter().any(|c| c.def.name == name)
    }

    /// Registered command definitions.
    pub fn commands(&self) -> impl Iterator<Item = &CommandDef> {
        self.commands.iter().map(|c| &c.def)
    }

    /// Parses and runs one line, recording it in history and output.
    pub fn execute(&mut self, context: &mut C, line: &str) -> CommandResult {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return CommandResult::ok(Vec::new());
        }
        self.output.push_back(OutputLine::new(trimmed, OutputLevel::Command));
        self.add_to_history(trimmed.to_string());

        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        let (name, args) = match parts.split_first() {
            Some((name, args)) => (*name, args),
            None => return CommandResult::ok(Vec::new()),
        };
        debug!("Console: {}", trimmed);

        let result = match name {
            "help" => self.cmd_help(args),
            "clear" => {
                self.output.clear();
                return CommandResult::ok(Vec::new());
            }
            "history" => self.cmd_history(),
            "echo" => CommandResult::ok_msg(args.join(" ")),
            _ => match self.commands.iter().find(|c| c.def.name == name) {
                Some(Registered {
                    handler: Some(handler),
                    ..
                }) => handler(context, args),
                Some(Registered { def, .. }) => {
                    CommandResult::err(format!("{} has no handler", def.name))
                }
                None => CommandResult::err(format!("Unknown command: {name}")),
            },
        };

        self.output.extend(result.output.iter().cloned());
        self.trim_output();
        result
    }

    fn cmd_help(&self, args: &[&str]) -> CommandResult {
        if let Some(name) = args.first() {
            return match self.commands().find(|c| c.name == *name) {
                Some(cmd) => CommandResult::ok(vec![
                    OutputLine::info(format!("{}: {}", cmd.name, cmd.description)),
                    OutputLine::info(format!("Usage: {}", cmd.usage)),
                    OutputLine::info(format!("Category: {}", cmd.category)),
                ]),
                None => CommandResult::err(format!("Unknown command: {name}")),
            };
        }

        let mut lines = vec![OutputLine::info("Available commands:")];
        for cmd in self.commands() {
            lines.push(OutputLine::info(format!("  {} - {}", cmd.name, cmd.description)));
        }
        lines.push(OutputLine::info("Type 'help <command>' for more info."));
        CommandResult::ok(lines)
    }

    fn cmd_history(&self) -> CommandResult {
        if self.history.is_empty() {
            return CommandResult::ok_msg("No command history.");
        }
        let mut lines = vec![OutputLine::info("Command history:")];
        for (i, cmd) in self.history.iter().enumerate() {
            lines.push(OutputLine::info(format!("  {}: {}", i + 1, cmd)));
        }
        CommandResult::ok(lines)
    }

    fn add_to_history(&mut self, cmd: String) {
        // Don't add duplicates of last command
        if self.history.front() == Some(&cmd) {
            return;
        }
        self.history.push_front(cmd);
        while self.history.len() > self.config.max_history {
            self.history.pop_back();
        }
    }

    fn trim_output(&mut self) {
        while self.output.len() > self.config.max_output {
            self.output.pop_front();
        }
    }

    /// Command names starting with `prefix`, case-insensitive, in registration order.
    #[must_use]
    pub fn complete(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.to_lowercase();
        if prefix.is_empty() {
            return Vec::new();
        }
        self.commands()
            .filter(|c| c.name.to_lowercase().starts_with(&prefix))
            .map(|c| c.name.clone())
            .collect()
    }

    /// Command history, newest first.
    #[must_use]
    pub fn history(&self) -> &VecDeque<String> {
        &self.history
    }

    /// Output lines, oldest first.
    #[must_use]
    pub fn output(&self) -> &VecDeque<OutputLine> {
        &self.output
    }
}

// ----------------------------------------------------------------------
// Inventory commands
// ----------------------------------------------------------------------

/// Host context for the `inv.*` commands.
#[derive(Debug)]
pub struct InventorySession {
    /// Inventories being driven
    pub manager: InventoryManager,
    /// Inventory the commands act on
    pub current: InventoryId,
    /// Renderer for `inv.dump`
    pub debugger: InventoryDebugger,
}

impl InventorySession {
    /// Creates a session acting on `current`.
    #[must_use]
    pub fn new(manager: InventoryManager, current: InventoryId) -> Self {
        Self {
            manager,
            current,
            debugger: InventoryDebugger::new().with_axes(),
        }
    }
}

fn inventory_or_err(
    session: &InventorySession,
) -> Result<&suspense_inventory::InventoryComponent, CommandResult> {
    session
        .manager
        .inventory(session.current)
        .ok_or_else(|| CommandResult::err(format!("{} does not exist", session.current)))
}

macro_rules! try_arg {
    ($e:expr) => {
        match $e {
            Ok(value) => value,
            Err(e) => return CommandResult::err(e.to_string()),
        }
    };
}

/// Registers the `inv.*` commands.
pub fn register_inventory_commands(table: &mut CommandTable<InventorySession>) {
    table.register(
        CommandDef::new("inv.list", "List items in the current inventory", "inv.list")
            .with_category("Inventory"),
        |session, _args| match inventory_or_err(session) {
            Ok(inv) if inv.items().is_empty() => CommandResult::ok_msg("Inventory is empty."),
            Ok(inv) => CommandResult::ok(
                inv.items()
                    .iter()
                    .map(|item| OutputLine::info(format!("  {item}")))
                    .collect(),
            ),
            Err(e) => e,
        },
    );

    table.register(
        CommandDef::new("inv.add", "Add a new stack", "inv.add <item_id> [quantity] [slot]")
            .with_category("Inventory"),
        |session, args| {
            let item_id: String = try_arg!(arg(args, 0, "item_id"));
            let quantity: u32 = try_arg!(arg_or(args, 1, "quantity", 1));
            let slot: Option<usize> = match args.get(2) {
                Some(_) => Some(try_arg!(arg(args, 2, "slot"))),
                None => None,
            };
            let current = session.current;
            let result = match slot {
                Some(slot) => {
                    let instance = match session.manager.inventory(current) {
                        Some(inv) => inv.create_instance(&ItemId::new(item_id.as_str()), quantity),
                        None => return CommandResult::err(format!("{current} does not exist")),
                    };
                    session.manager.add_instance(current, instance, Some(slot))
                }
                None => session
                    .manager
                    .add_item(current, &ItemId::new(item_id.as_str()), quantity),
            };
            match result {
                Ok(record) => CommandResult::ok_msg(format!(
                    "Added {}x{} at slot {}",
                    item_id,
                    quantity,
                    record.new_slot.map_or_else(|| "?".to_string(), |s| s.to_string())
                )),
                Err(e) => CommandResult::err(e.to_string()),
            }
        },
    );

    table.register(
        CommandDef::new(
            "inv.remove",
            "Remove units of the item at a slot",
            "inv.remove <slot> [quantity]",
        )
        .with_category("Inventory"),
        |session, args| {
            let slot: usize = try_arg!(arg(args, 0, "slot"));
            let found = match inventory_or_err(session) {
                Ok(inv) => inv.item_at_slot(slot).map(|i| (i.instance_id, i.quantity)),
                Err(e) => return e,
            };
            let Some((instance_id, have)) = found else {
                return CommandResult::err(format!("Slot {slot} is empty"));
            };
            let quantity: u32 = try_arg!(arg_or(args, 1, "quantity", have));
            match session.manager.remove_item(session.current, instance_id, quantity) {
                Ok(_) => CommandResult::ok_msg(format!("Removed {quantity} from slot {slot}")),
                Err(e) => CommandResult::err(e.to_string()),
            }
        },
    );

    table.register(
        CommandDef::new("inv.move", "Move the item at a slot", "inv.move <from> <to>")
            .with_category("Inventory"),
        |session, args| {
            let from: usize = try_arg!(arg(args, 0, "from"));
            let to: usize = try_arg!(arg(args, 1, "to"));
            match session.manager.move_item(session.current, from, to) {
                Ok(_) => CommandResult::ok_msg(format!("Moved {from} -> {to}")),
                Err(e) => CommandResult::err(e.to_string()),
            }
        },
    );

    table.register(
        CommandDef::new("inv.rotate", "Rotate the item at a slot", "inv.rotate <slot>")
            .with_category("Inventory"),
        |session, args| {
            let slot: usize = try_arg!(arg(args, 0, "slot"));
            match session.manager.rotate_item(session.current, slot) {
                Ok(record) => CommandResult::ok_msg(format!("Rotated to {}", record.new_rotation)),
                Err(e) => CommandResult::err(e.to_string()),
            }
        },
    );

    table.register(
        CommandDef::new("inv.undo", "Undo operations", "inv.undo [count]").with_category("History"),
        |session, args| {
            let count: usize = try_arg!(arg_or(args, 0, "count", 1));
            match session.manager.undo_multiple(session.current, count) {
                0 => CommandResult::err("Nothing to undo"),
                n => CommandResult::ok_msg(format!("Undid {n} operation(s)")),
            }
        },
    );

    table.register(
        CommandDef::new("inv.redo", "Redo operations", "inv.redo [count]").with_category("History"),
        |session, args| {
            let count: usize = try_arg!(arg_or(args, 0, "count", 1));
            match session.manager.redo_multiple(session.current, count) {
                0 => CommandResult::err("Nothing to redo"),
                n => CommandResult::ok_msg(format!("Redid {n} operation(s)")),
            }
        },
    );

    table.register(
        CommandDef::new("inv.dump", "Draw the grid", "inv.dump").with_category("Debug"),
        |session, _args| match inventory_or_err(session) {
            Ok(inv) => CommandResult::ok(
                session
                    .debugger
                    .render_grid(inv)
                    .lines()
                    .map(OutputLine::info)
                    .collect(),
            ),
            Err(e) => e,
        },
    );

    table.register(
        CommandDef::new("inv.validate", "Check grid and item consistency", "inv.validate")
            .with_category("Debug"),
        |session, _args| match inventory_or_err(session) {
            Ok(inv) => {
                let report = session.debugger.check_integrity(inv);
                if report.is_ok() {
                    CommandResult::ok_msg("No problems found")
                } else {
                    CommandResult::with_lines(
                        report.problems.into_iter().map(OutputLine::error).collect(),
                    )
                }
            }
            Err(e) => e,
        },
    );

    table.register(
        CommandDef::new(
            "inv.stats",
            "Show inventory and replication statistics",
            "inv.stats [json]",
        )
        .with_category("Debug"),
        |session, args| {
            let report = match inventory_or_err(session) {
                Ok(inv) => session.debugger.report(inv),
                Err(e) => return e,
            };
            let replication = session
                .manager
                .replicator(session.current)
                .map(|r| r.stats().clone())
                .unwrap_or_default();
            let history = session.manager.history(session.current);

            if args.first() == Some(&"json") {
                let value = serde_json::json!({
                    "inventory": report,
                    "replication": replication,
                    "undo": history.map_or(0, |h| h.undo_count()),
                    "redo": history.map_or(0, |h| h.redo_count()),
                });
                return match serde_json::to_string_pretty(&value) {
                    Ok(text) => CommandResult::ok(text.lines().map(OutputLine::info).collect()),
                    Err(e) => CommandResult::err(e.to_string()),
                };
            }

            let mut lines: Vec<OutputLine> =
                report.to_string().lines().map(OutputLine::info).collect();
            lines.push(OutputLine::info(format!(
                "history: {} undo, {} redo",
                history.map_or(0, |h| h.undo_count()),
                history.map_or(0, |h| h.redo_count())
            )));
            lines.push(OutputLine::info(format!(
                "replication: {} flushes, {} items, {} bytes, {}/{} predictions confirmed",
                replication.flush_count,
                replication.items_replicated,
                replication.bytes_sent,
                replication.predictions_confirmed,
                replication.predictions_started
            )));
            CommandResult::ok(lines)
        },
    );

    table.register(
        CommandDef::new("inv.defrag", "Repack items (clears undo history)", "inv.defrag")
            .with_category("Inventory"),
        |session, _args| match session.manager.defragment(session.current) {
            Ok(moved) => CommandResult::ok_msg(format!("Defragmented, {moved} item(s) moved")),
            Err(e) => CommandResult::err(e.to_string()),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use suspense_inventory::{InventoryConfig, ItemData, ItemDataTable};

    fn session() -> InventorySession {
        let table = ItemDataTable::new()
            .with(ItemData::new("pistol").with_size(2, 1).with_weight(1.0))
            .with(ItemData::new("ammo").with_max_stack(60).with_weight(0.1));
        let config = InventoryConfig {
            grid_width: 4,
            grid_height: 2,
            ..InventoryConfig::default()
        };
        let mut manager = InventoryManager::new(config, Arc::new(table));
        let current = manager.create_inventory();
        InventorySession::new(manager, current)
    }

    fn table() -> CommandTable<InventorySession> {
        let mut table = CommandTable::new();
        register_inventory_commands(&mut table);
        table
    }

    #[test]
    fn test_builtin_commands() {
        let mut table: CommandTable<()> = CommandTable::new();
        let help = table.execute(&mut (), "help");
        assert!(help.success);
        assert!(help.output.iter().any(|l| l.text.contains("echo")));

        let echo = table.execute(&mut (), "echo hello   world");
        assert_eq!(echo.output[0].text, "hello world");

        assert!(!table.execute(&mut (), "nope").success);
        assert!(!table.execute(&mut (), "help nope").success);

        table.execute(&mut (), "clear");
        assert!(table.output().is_empty());
    }

    #[test]
    fn test_history_bounded_and_deduplicated() {
        let mut table: CommandTable<()> = CommandTable::with_config(ConsoleConfig {
            max_history: 2,
            ..ConsoleConfig::default()
        });
        table.execute(&mut (), "echo a");
        table.execute(&mut (), "echo a");
        assert_eq!(table.history().len(), 1);
        table.execute(&mut (), "echo b");
        table.execute(&mut (), "echo c");
        assert_eq!(
            table.history(),
            &VecDeque::from(vec!["echo c".to_string(), "echo b".to_string()])
        );
    }

    #[test]
    fn test_handler_and_completion() {
        let mut table: CommandTable<u32> = CommandTable::new();
        table.register(CommandDef::new("count.add", "Add", "count.add <n>"), |count, args| {
            let n: u32 = try_arg!(arg(args, 0, "n"));
            *count += n;
            CommandResult::ok_msg(format!("count = {count}"))
        });
        table.register_command(CommandDef::new("count.reset", "Reset", "count.reset"));

        let mut count = 0;
        assert!(table.execute(&mut count, "count.add 5").success);
        assert_eq!(count, 5);
        let bad = table.execute(&mut count, "count.add five");
        assert_eq!(bad.output[0].text, "invalid <n>: five");
        assert!(!table.execute(&mut count, "count.reset").success);

        assert_eq!(table.complete("COUNT."), vec!["count.add", "count.reset"]);
        assert!(table.complete("").is_empty());
    }

    #[test]
    fn test_inventory_commands() {
        let mut table = table();
        let mut session = session();

        assert!(table.execute(&mut session, "inv.add pistol").success);
        assert!(table.execute(&mut session, "inv.add ammo 30 7").success);
        assert!(!table.execute(&mut session, "inv.add ammo 0").success);

        let dump = table.execute(&mut session, "inv.dump");
        let grid: Vec<&str> = dump.output.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(grid, vec!["   0123", " 0 Aa..", " 1 ...B"]);

        assert!(table.execute(&mut session, "inv.move 0 1").success);
        assert!(table.execute(&mut session, "inv.rotate 1").success);
        assert!(!table.execute(&mut session, "inv.move 1 4").success);
        assert!(table.execute(&mut session, "inv.remove 7 10").success);
        assert_eq!(
            session
                .manager
                .inventory(session.current)
                .map(|i| i.item_count(&ItemId::new("ammo"))),
            Some(20)
        );

        assert!(table.execute(&mut session, "inv.undo 3").success);
        assert!(table.execute(&mut session, "inv.redo").success);
        assert!(table.execute(&mut session, "inv.validate").success);
        assert!(table.execute(&mut session, "inv.stats").success);
        assert!(table.execute(&mut session, "inv.stats json").success);
        assert!(table.execute(&mut session, "inv.defrag").success);
        assert!(!table.execute(&mut session, "inv.undo").success);
        assert!(table.execute(&mut session, "inv.list").success);
    }
}
