//! Line commands accepted by the daemon on stdin.

use anyhow::{anyhow, Result};
use std::str::FromStr;

use crate::camera::FacingMode;

pub const HELP: &str = "commands: capture | switch [user|environment] | set <field> <value> | settings | status | quit";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Capture,
    /// `None` flips to the opposite facing mode.
    Switch(Option<FacingMode>),
    Set { field: String, value: String },
    Settings,
    Status,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err(anyhow!("empty command; {}", HELP));
        };
        let rest: Vec<&str> = words.collect();
        let command = match (verb.to_ascii_lowercase().as_str(), rest.as_slice()) {
            ("capture" | "c", []) => Command::Capture,
            ("switch", []) => Command::Switch(None),
            ("switch", [facing]) => Command::Switch(Some(facing.parse()?)),
            ("set", [field, value]) => Command::Set {
                field: field.to_string(),
                value: value.to_string(),
            },
            ("settings", []) => Command::Settings,
            ("status", []) => Command::Status,
            ("help" | "?", []) => Command::Help,
            ("quit" | "exit" | "q", []) => Command::Quit,
            (other, _) => return Err(anyhow!("unrecognized command '{}'; {}", other, HELP)),
        };
        Ok(command)
    }
}
