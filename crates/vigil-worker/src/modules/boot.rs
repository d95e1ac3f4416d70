//! Session bootstrap module: registration, channel joins, roster refresh.

use tracing::error;

use vigil_core::control::WorkerMessage;

use crate::engine::{Event, Module, ModuleCtx};

/// Registers the session on connect, joins configured channels on welcome
/// and prunes channels the server rejects.
#[derive(Debug, Default)]
pub struct Boot;

impl Module for Boot {
    fn name(&self) -> &'static str {
        "boot"
    }

    fn handle(&mut self, event: &Event, ctx: &mut ModuleCtx<'_>) {
        match event {
            Event::Connected => {
                let info = ctx.config.info.clone();
                if let Some(password) = info.password {
                    ctx.send("PASS", [password]);
                }
                let user = ctx.config.username().to_string();
                let realname = ctx.config.realname().to_string();
                ctx.send("NICK", [info.nick]);
                ctx.send("USER", [user, "0".to_string(), "*".to_string(), realname]);
            }
            Event::Message(msg) => match msg.command.as_str() {
                // Welcome: join and take a roster of every configured channel.
                "001" => {
                    for channel in ctx.config.channels.clone() {
                        ctx.send("JOIN", [channel.clone()]);
                        ctx.send("NAMES", [channel]);
                    }
                }
                // Someone else joined or left: refresh rosters.
                "JOIN" | "PART" => {
                    if msg.source_nick() != Some(ctx.config.info.nick.as_str()) {
                        for channel in ctx.config.channels.clone() {
                            ctx.send("NAMES", [channel]);
                        }
                    }
                }
                // No such channel / needs registered nick: drop it from the
                // config and persist so we stop retrying every session.
                "403" | "477" => {
                    if let Some(rejected) = msg.params.get(1).cloned() {
                        ctx.config
                            .channels
                            .retain(|c| c != &rejected && c.starts_with('#'));
                        ctx.supervisor(WorkerMessage::Save(Box::new(ctx.config.clone())));
                    }
                }
                "464" => error!("Server requires a password (ERR_PASSWDMISMATCH)"),
                _ => {}
            },
        }
    }
}
