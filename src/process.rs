//! Data structures describing what to run.
//!
//! This module defines the validated command specification (`CommandSpec`), the
//! field separator used to parse spec strings (`Separator`), the lifecycle state
//! of a runner (`RunnerState`), and the validated batch (`BatchPlan`).

use std::fmt;
use std::str::FromStr;

use crate::ansi::BackgroundColor;
use crate::errors::SpecError;

/// Hard cap on the number of commands in one batch.
pub const MAX_COMMANDS: usize = 4;

/// Specification for a single command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Background color painted behind the prefix.
    pub color: BackgroundColor,
    /// Label printed before every output line. May be empty.
    pub prefix: String,
    /// Command line, split on whitespace when spawned.
    pub command_line: String,
}

impl CommandSpec {
    pub fn new(
        color: BackgroundColor,
        prefix: impl Into<String>,
        command_line: impl Into<String>,
    ) -> Self {
        Self {
            color,
            prefix: prefix.into(),
            command_line: command_line.into(),
        }
    }

    /// Parses `<color><sep><prefix><sep><command>`.
    pub fn parse(input: &str, separator: Separator) -> Result<Self, SpecError> {
        let fields = split_fields(input, separator, 3)?;
        let color = fields[0].parse::<BackgroundColor>()?;
        Ok(Self::new(color, fields[1], fields[2]))
    }

    /// Executable followed by its arguments. There is no quoting support: a
    /// quoted argument containing spaces is split like any other text.
    pub fn argv(&self) -> Vec<&str> {
        self.command_line.split_whitespace().collect()
    }
}

/// Splits `input` into exactly `count` fields, rejecting empty commands.
fn split_fields(input: &str, separator: Separator, count: usize) -> Result<Vec<&str>, SpecError> {
    let fields: Vec<&str> = input.split(separator.as_char()).collect();
    let command_ok = fields
        .last()
        .map(|command| !command.trim().is_empty())
        .unwrap_or(false);
    if fields.len() != count || !command_ok {
        return Err(SpecError::Format {
            input: input.to_string(),
        });
    }
    Ok(fields)
}

/// Character that separates the fields of a spec string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Separator {
    #[default]
    Semicolon,
    Comma,
    Colon,
    Pipe,
}

impl Separator {
    /// The literal character fields are split on.
    pub fn as_char(self) -> char {
        match self {
            Separator::Semicolon => ';',
            Separator::Comma => ',',
            Separator::Colon => ':',
            Separator::Pipe => '|',
        }
    }

    pub fn allowed() -> &'static str {
        "; , : |"
    }
}

impl fmt::Display for Separator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl FromStr for Separator {
    type Err = SpecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            ";" => Ok(Separator::Semicolon),
            "," => Ok(Separator::Comma),
            ":" => Ok(Separator::Colon),
            "|" => Ok(Separator::Pipe),
            _ => Err(SpecError::InvalidSeparator {
                value: value.to_string(),
            }),
        }
    }
}

/// The lifecycle state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Not started yet.
    Idle,
    /// Child process is alive.
    Running { pid: u32 },
    /// Kill was sent; waiting for the worker to observe the exit.
    Terminating { pid: u32 },
    /// Exited, failed to start, or cancelled before start.
    Done,
}

/// A validated batch, ready to hand to the supervisor.
#[derive(Debug)]
pub struct BatchPlan {
    pub commands: Vec<CommandSpec>,
    pub pre_hook: Option<CommandSpec>,
    /// Non-fatal problems, reported to the user before the batch starts.
    pub warnings: Vec<SpecError>,
}

impl BatchPlan {
    /// Validates every spec string before anything is spawned.
    ///
    /// Field counts are checked for the whole batch first, then colors, so the
    /// first malformed string is reported even if an earlier one also has a bad
    /// color. Any failure rejects the batch as a whole.
    pub fn parse(
        inputs: &[String],
        pre_hook: Option<&str>,
        separator: Separator,
    ) -> Result<Self, SpecError> {
        if inputs.is_empty() {
            return Err(SpecError::NoCommands);
        }
        if inputs.len() > MAX_COMMANDS {
            return Err(SpecError::too_many(inputs.len()));
        }

        let split = inputs
            .iter()
            .map(|input| split_fields(input, separator, 3))
            .collect::<Result<Vec<_>, _>>()?;

        let commands = split
            .into_iter()
            .map(|fields| -> Result<CommandSpec, SpecError> {
                let color = fields[0].parse::<BackgroundColor>()?;
                Ok(CommandSpec::new(color, fields[1], fields[2]))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut warnings = Vec::new();
        let pre_hook = match pre_hook.map(|raw| parse_pre_hook(raw, separator)) {
            Some(Ok(spec)) => Some(spec),
            Some(Err(err)) => {
                warnings.push(err);
                None
            }
            None => None,
        };

        Ok(Self {
            commands,
            pre_hook,
            warnings,
        })
    }
}

/// A pre-hook is either a bare command or a full three-field spec.
fn parse_pre_hook(input: &str, separator: Separator) -> Result<CommandSpec, SpecError> {
    let fields: Vec<&str> = input.split(separator.as_char()).collect();
    match fields.as_slice() {
        [command] if !command.trim().is_empty() => {
            Ok(CommandSpec::new(BackgroundColor::Reset, "", *command))
        }
        [_, _, _] => CommandSpec::parse(input, separator).map_err(|err| match err {
            SpecError::Format { input } => SpecError::PreHookFormat { input },
            other => other,
        }),
        _ => Err(SpecError::PreHookFormat {
            input: input.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn parses_three_field_spec() {
        let spec = CommandSpec::parse("RED;web;echo hi", Separator::Semicolon).unwrap();
        assert_eq!(spec.color, BackgroundColor::Red);
        assert_eq!(spec.prefix, "web");
        assert_eq!(spec.command_line, "echo hi");
        assert_eq!(spec.argv(), vec!["echo", "hi"]);
    }

    #[test]
    fn argv_collapses_repeated_whitespace() {
        let spec = CommandSpec::new(BackgroundColor::Reset, "", "  sleep   1 ");
        assert_eq!(spec.argv(), vec!["sleep", "1"]);
    }

    #[test]
    fn separator_is_matched_literally() {
        let spec = CommandSpec::parse("BLUE|db|echo bye", Separator::Pipe).unwrap();
        assert_eq!(spec.prefix, "db");
        let err = CommandSpec::parse("BLUE|db|echo bye", Separator::Semicolon).unwrap_err();
        assert!(matches!(err, SpecError::Format { .. }));
    }

    #[test]
    fn empty_prefix_is_allowed_but_empty_command_is_not() {
        let spec = CommandSpec::parse("GREEN;;ls", Separator::Semicolon).unwrap();
        assert!(spec.prefix.is_empty());
        let err = CommandSpec::parse("GREEN;web;  ", Separator::Semicolon).unwrap_err();
        assert!(matches!(err, SpecError::Format { .. }));
    }

    #[test]
    fn separator_from_str_accepts_only_known_characters() {
        assert_eq!(";".parse::<Separator>().unwrap(), Separator::Semicolon);
        assert_eq!(",".parse::<Separator>().unwrap(), Separator::Comma);
        assert_eq!(":".parse::<Separator>().unwrap(), Separator::Colon);
        assert_eq!("|".parse::<Separator>().unwrap(), Separator::Pipe);
        assert!(matches!(
            "/".parse::<Separator>(),
            Err(SpecError::InvalidSeparator { .. })
        ));
        assert!(";;".parse::<Separator>().is_err());
    }

    #[test]
    fn batch_keeps_input_order() {
        let plan = BatchPlan::parse(
            &strings(&["RED;web;echo hi", "BLUE;db;echo bye"]),
            None,
            Separator::Semicolon,
        )
        .unwrap();
        let prefixes: Vec<_> = plan.commands.iter().map(|c| c.prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["web", "db"]);
        assert!(plan.pre_hook.is_none());
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn batch_rejects_invalid_color_anywhere() {
        let err = BatchPlan::parse(
            &strings(&["RED;web;echo hi", "PURPLE;db;echo bye"]),
            None,
            Separator::Semicolon,
        )
        .unwrap_err();
        assert!(matches!(err, SpecError::InvalidColor { ref value } if value == "PURPLE"));
    }

    #[test]
    fn batch_reports_format_errors_before_color_errors() {
        let err = BatchPlan::parse(
            &strings(&["PURPLE;web;echo hi", "RED;db"]),
            None,
            Separator::Semicolon,
        )
        .unwrap_err();
        assert!(matches!(err, SpecError::Format { ref input } if input == "RED;db"));
    }

    #[test]
    fn batch_size_is_bounded() {
        assert!(matches!(
            BatchPlan::parse(&[], None, Separator::Semicolon),
            Err(SpecError::NoCommands)
        ));
        let five = strings(&["RED;a;true"; 5]);
        assert!(matches!(
            BatchPlan::parse(&five, None, Separator::Semicolon),
            Err(SpecError::TooManyCommands { count: 5, max: 4 })
        ));
        let four = strings(&["RED;a;true"; 4]);
        assert_eq!(
            BatchPlan::parse(&four, None, Separator::Semicolon)
                .unwrap()
                .commands
                .len(),
            4
        );
    }

    #[test]
    fn pre_hook_accepts_bare_command() {
        let plan =
            BatchPlan::parse(&strings(&["RED;web;true"]), Some("make deps"), Separator::Semicolon)
                .unwrap();
        let hook = plan.pre_hook.unwrap();
        assert_eq!(hook.color, BackgroundColor::Reset);
        assert!(hook.prefix.is_empty());
        assert_eq!(hook.command_line, "make deps");
    }

    #[test]
    fn pre_hook_accepts_full_spec() {
        let plan = BatchPlan::parse(
            &strings(&["RED;web;true"]),
            Some("YELLOW,setup,make deps"),
            Separator::Comma,
        );
        // the batch itself uses ';' so it fails under ','
        assert!(plan.is_err());

        let plan = BatchPlan::parse(
            &strings(&["RED,web,true"]),
            Some("YELLOW,setup,make deps"),
            Separator::Comma,
        )
        .unwrap();
        let hook = plan.pre_hook.unwrap();
        assert_eq!(hook.color, BackgroundColor::Yellow);
        assert_eq!(hook.prefix, "setup");
    }

    #[test]
    fn malformed_pre_hook_is_only_a_warning() {
        let plan =
            BatchPlan::parse(&strings(&["RED;web;true"]), Some("a;b"), Separator::Semicolon)
                .unwrap();
        assert!(plan.pre_hook.is_none());
        assert_eq!(plan.commands.len(), 1);
        assert!(matches!(
            plan.warnings.as_slice(),
            [SpecError::PreHookFormat { input }] if input == "a;b"
        ));

        let plan = BatchPlan::parse(
            &strings(&["RED;web;true"]),
            Some("PURPLE;x;true"),
            Separator::Semicolon,
        )
        .unwrap();
        assert!(plan.pre_hook.is_none());
        assert!(matches!(
            plan.warnings.as_slice(),
            [SpecError::InvalidColor { .. }]
        ));
    }
}
