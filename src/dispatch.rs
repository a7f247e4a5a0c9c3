//! SAT-side command registry: built-ins are handled directly by
//! `SatLink`; this module only covers the *extension* surface spec.md
//! §3 calls `CommandRegistry` — user-registered names beyond `PING`,
//! `RESET`, `TXPOW`, `LPM`.

extern crate alloc;
use alloc::boxed::Box;
use alloc::string::String as AString;

use heapless::{FnvIndexMap, String as HString};

/// Longest command name accepted by `register_command`.
pub const MAX_COMMAND_NAME: usize = 16;
/// Longest response text a handler may produce.
pub const MAX_RESPONSE_LEN: usize = 200;
/// How many distinct command names can be registered at once.
const MAX_COMMANDS: usize = 8;

pub type CommandName = HString<MAX_COMMAND_NAME>;
pub type ResponseText = HString<MAX_RESPONSE_LEN>;

/// A user-supplied command handler: given the trimmed argument text
/// after `CMD:<name>`, returns the response text to send back as
/// `CMD:<text>`.
pub type CommandHandler = Box<dyn FnMut(&str) -> ResponseText + Send>;

/// Registered non-built-in command handlers, spec.md §3/§4.4.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: FnvIndexMap<CommandName, CommandHandler, MAX_COMMANDS>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        CommandRegistry {
            handlers: FnvIndexMap::new(),
        }
    }

    /// Register `handler` under `name`, replacing any prior handler
    /// for the same name. Fails if the registry is full and `name` is
    /// new, or if `name` does not fit [`MAX_COMMAND_NAME`].
    pub fn register(&mut self, name: &str, handler: CommandHandler) -> Result<(), AString> {
        let key: CommandName = name
            .try_into()
            .map_err(|_| AString::from("command name too long"))?;
        if !self.handlers.contains_key(&key) && self.handlers.len() == self.handlers.capacity() {
            return Err(AString::from("command registry full"));
        }
        let _ = self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) {
        if let Ok(key) = CommandName::try_from(name) {
            let _ = self.handlers.remove(&key);
        }
    }

    /// Run `name`'s handler against `args`, if one is registered.
    pub fn dispatch(&mut self, name: &str, args: &str) -> Option<ResponseText> {
        let key = CommandName::try_from(name).ok()?;
        self.handlers.get_mut(&key).map(|h| h(args))
    }
}
