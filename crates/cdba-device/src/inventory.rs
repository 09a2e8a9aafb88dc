use std::{env, fs, io, path::PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const LOCAL_CONFIG: &str = ".cdba";
pub const SYSTEM_CONFIG: &str = "/etc/cdba";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no board inventory at ./{LOCAL_CONFIG} or {SYSTEM_CONFIG}")]
    NotFound,
    #[error("failed to read {path}: {err}")]
    Io {
        path: String,
        #[source]
        err: io::Error,
    },
    #[error("failed to parse {path}: {err}")]
    Parse {
        path: String,
        #[source]
        err: serde_json::Error,
    },
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConsoleConfig {
    pub path: PathBuf,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_baud() -> u32 {
    115_200
}

/// An external control hook pair, run through the shell.
#[derive(Clone, Debug, Deserialize)]
pub struct CommandPair {
    pub on: String,
    pub off: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FastbootConfig {
    pub vendor: u16,
    pub product: u16,
    /// Device node that exists exactly while the board sits in download
    /// mode; probed periodically and opened for the image transfer.
    pub path: PathBuf,
}

/// One board's driver bindings from the inventory. Instantiated at server
/// start and never mutated.
#[derive(Clone, Debug, Deserialize)]
pub struct BoardConfig {
    pub name: String,
    pub console: ConsoleConfig,
    #[serde(default)]
    pub power: Option<CommandPair>,
    #[serde(default)]
    pub usb: Option<CommandPair>,
    /// Asserts the hardware key that forces the board into download mode.
    #[serde(default)]
    pub fastboot_key: Option<CommandPair>,
    pub fastboot: FastbootConfig,
    /// Access-control list. Absent means unrestricted.
    #[serde(default)]
    pub users: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
}

impl BoardConfig {
    pub fn allows(&self, user: &str) -> bool {
        self.users.as_ref().is_none_or(|users| users.iter().any(|u| u == user))
    }

    /// Human-readable one-paragraph description for `BOARD_INFO`.
    pub fn describe(&self) -> String {
        let mut text = format!(
            "{}: console {} @ {} baud, fastboot {:04x}:{:04x}",
            self.name,
            self.console.path.display(),
            self.console.baud,
            self.fastboot.vendor,
            self.fastboot.product,
        );
        if self.power.is_some() {
            text.push_str(", power control");
        }
        if self.usb.is_some() {
            text.push_str(", vbus control");
        }
        if let Some(desc) = &self.description {
            text.push_str("\n  ");
            text.push_str(desc);
        }
        text
    }
}

#[derive(Debug, Deserialize)]
pub struct Inventory {
    pub boards: Vec<BoardConfig>,
}

impl Inventory {
    /// Loads `./.cdba`, falling back to `/etc/cdba`.
    pub fn load() -> Result<Self, ConfigError> {
        for path in [LOCAL_CONFIG, SYSTEM_CONFIG] {
            match fs::read_to_string(path) {
                Ok(text) => return Self::parse(path, &text),
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(ConfigError::Io { path: path.into(), err }),
            }
        }
        Err(ConfigError::NotFound)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let text =
            fs::read_to_string(path).map_err(|err| ConfigError::Io { path: path.into(), err })?;
        Self::parse(path, &text)
    }

    fn parse(path: &str, text: &str) -> Result<Self, ConfigError> {
        let inventory: Self = serde_json::from_str(text)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        debug!(path, boards = inventory.boards.len(), "inventory loaded");
        Ok(inventory)
    }

    pub fn find(&self, name: &str) -> Option<&BoardConfig> {
        self.boards.iter().find(|b| b.name == name)
    }

    /// Emits the name of every board `user` may access, in inventory order.
    pub fn list_for_user(&self, user: &str, mut emit: impl FnMut(&str)) {
        for board in self.boards.iter().filter(|b| b.allows(user)) {
            emit(&board.name);
        }
    }

    /// Emits a description of `name` if it exists and `user` may access it;
    /// emits nothing otherwise.
    pub fn info_for_user(&self, user: &str, name: &str, mut emit: impl FnMut(&str)) {
        if let Some(board) = self.find(name)
            && board.allows(user)
        {
            emit(&board.describe());
        }
    }
}

/// `CDBA_USER` overrides the effective username, then `USER`, then "nobody".
pub fn effective_user() -> String {
    resolve_user(|var| env::var(var).ok())
}

fn resolve_user(get: impl Fn(&str) -> Option<String>) -> String {
    get("CDBA_USER").or_else(|| get("USER")).unwrap_or_else(|| "nobody".into())
}
