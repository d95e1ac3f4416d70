//! Operator command module.
//!
//! Commands are plain words sent to the bot nick as a direct message and
//! are only honored when the sender's full `nick!user@host` source matches
//! one of the configured admin masks.

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use vigil_core::Config;
use vigil_core::control::WorkerMessage;
use vigil_proto::Message;

use crate::engine::{Event, Module, ModuleCtx};

/// Admin commands: reload, join/part, config get/set.
#[derive(Debug, Default)]
pub struct Admin {
    masks: Vec<Regex>,
}

impl Module for Admin {
    fn name(&self) -> &'static str {
        "admin"
    }

    fn attach(&mut self, config: &Config) {
        self.masks = config
            .admins
            .iter()
            .filter_map(|mask| match Regex::new(mask) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!(mask, error = %e, "Invalid admin mask, ignoring");
                    None
                }
            })
            .collect();
    }

    fn handle(&mut self, event: &Event, ctx: &mut ModuleCtx<'_>) {
        let Event::Message(msg) = event else {
            return;
        };
        match msg.command.as_str() {
            "PRIVMSG" => self.handle_privmsg(msg, ctx),
            // Forward server error notices to the configured broadcast nicks.
            "403" => {
                if let Some(text) = msg.params.last().cloned() {
                    for nick in ctx.config.bcnicks.clone() {
                        ctx.send("NOTICE", [nick, text.clone()]);
                    }
                }
            }
            _ => {}
        }
    }
}

impl Admin {
    fn is_admin(&self, source: &str) -> bool {
        self.masks.iter().any(|mask| mask.is_match(source))
    }

    fn handle_privmsg(&self, msg: &Message, ctx: &mut ModuleCtx<'_>) {
        let (Some(target), Some(text)) = (msg.params.first(), msg.params.get(1)) else {
            return;
        };
        // Commands arrive as direct messages only.
        if target != &ctx.config.info.nick {
            return;
        }
        let (Some(source), Some(nick)) = (msg.prefix.as_deref(), msg.source_nick()) else {
            return;
        };
        let nick = nick.to_string();

        if text.trim().is_empty() {
            return;
        }
        if !self.is_admin(source) {
            ctx.send("NOTICE", [nick, "Unauthorized.".to_string()]);
            return;
        }

        let mut parts = text.trim().splitn(3, ' ');
        let command = parts.next().unwrap_or_default();
        let arg = parts.next();
        let rest = parts.next();

        match command {
            "reload" => {
                ctx.send("NOTICE", [nick, "Reloading..".to_string()]);
                ctx.supervisor(WorkerMessage::Reload);
            }
            "admin" => ctx.send("NOTICE", [nick, "Yes you are".to_string()]),
            "join" => match arg {
                Some(channel) => {
                    if !ctx.config.channels.iter().any(|c| c == channel) {
                        ctx.config.channels.push(channel.to_string());
                        ctx.supervisor(WorkerMessage::Save(Box::new(ctx.config.clone())));
                    }
                    ctx.send("JOIN", [channel.to_string()]);
                }
                None => ctx.send("NOTICE", [nick, "Usage: join <channel>".to_string()]),
            },
            "part" => match arg {
                Some(channel) => {
                    if ctx.config.channels.iter().any(|c| c == channel) {
                        ctx.config.channels.retain(|c| c != channel);
                        ctx.supervisor(WorkerMessage::Save(Box::new(ctx.config.clone())));
                    }
                    ctx.send("PART", [channel.to_string()]);
                }
                None => ctx.send("NOTICE", [nick, "Usage: part <channel>".to_string()]),
            },
            "get" => match arg {
                Some(path) => {
                    let value = serde_json::to_value(&*ctx.config)
                        .ok()
                        .and_then(|v| get_path(&v, path))
                        .unwrap_or(Value::Null);
                    ctx.send("NOTICE", [nick, value.to_string()]);
                }
                None => ctx.send("NOTICE", [nick, "Usage: get <path>".to_string()]),
            },
            "set" => match (arg, rest) {
                (Some(path), Some(raw)) => match set_config(ctx.config, path, raw) {
                    Ok(value) => {
                        ctx.supervisor(WorkerMessage::Save(Box::new(ctx.config.clone())));
                        ctx.send("NOTICE", [nick, format!("{path} = {value}")]);
                    }
                    Err(e) => ctx.send("NOTICE", [nick, format!("Nope. {e}")]),
                },
                _ => ctx.send("NOTICE", [nick, "Usage: set <path> <json>".to_string()]),
            },
            _ => ctx.send("NOTICE", [nick, "Unknown command.".to_string()]),
        }
    }
}

/// Apply `set <path> <json>` against the config's JSON form, then
/// deserialize back so typed fields stay valid.
fn set_config(config: &mut Config, path: &str, raw: &str) -> Result<Value, String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let mut tree = serde_json::to_value(&*config).map_err(|e| e.to_string())?;
    set_path(&mut tree, path, value.clone())?;
    *config = serde_json::from_value(tree).map_err(|e| e.to_string())?;
    Ok(value)
}

/// Look up a dotted path in a JSON tree.
fn get_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    Some(current.clone())
}

/// Write a dotted path into a JSON tree, creating intermediate objects.
fn set_path(tree: &mut Value, path: &str, new: Value) -> Result<(), String> {
    let mut current = tree;
    let mut keys = path.split('.').peekable();
    while let Some(key) = keys.next() {
        let obj = current
            .as_object_mut()
            .ok_or_else(|| format!("{key} is not an object"))?;
        if keys.peek().is_none() {
            obj.insert(key.to_string(), new);
            return Ok(());
        }
        current = obj
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    Err("empty path".to_string())
}

#[cfg(test)]
#[path = "admin_tests.rs"]
mod tests;
