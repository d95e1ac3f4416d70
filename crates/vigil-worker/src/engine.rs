//! Protocol engine: dispatches IRC events to attached modules.
//!
//! The engine is deliberately synchronous. Modules react to one event at a
//! time and queue outbound lines and supervisor requests through the
//! context; the bridge performs the actual I/O. This keeps modules trivial
//! to test and matches the single-threaded cooperative execution model.

use tracing::trace;

use vigil_core::Config;
use vigil_core::control::WorkerMessage;
use vigil_proto::Message;

/// Events delivered to modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The upstream link (re-)established its session; modules use this to
    /// run session-establishment logic (login, resubscription).
    Connected,
    /// A parsed line from the upstream server.
    Message(Message),
}

/// Everything one dispatch produced: lines for the relay connection and
/// requests for the sentinel.
#[derive(Debug, Default)]
pub struct EngineOutput {
    pub lines: Vec<String>,
    pub requests: Vec<WorkerMessage>,
}

/// Engine surface visible to modules while handling an event.
pub struct ModuleCtx<'a> {
    /// The worker's config snapshot. Modules may edit it and request a
    /// save; the sentinel holds the authoritative copy.
    pub config: &'a mut Config,
    out: &'a mut Vec<Message>,
    requests: &'a mut Vec<WorkerMessage>,
}

impl ModuleCtx<'_> {
    /// Queue an outbound protocol message.
    pub fn send<C, P>(&mut self, command: C, params: P)
    where
        C: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        self.out.push(Message::new(command, params));
    }

    /// Queue an arbitrary structured message for the sentinel (the upward
    /// "supervisor" callback: save and reload requests).
    pub fn supervisor(&mut self, msg: WorkerMessage) {
        self.requests.push(msg);
    }
}

/// A pluggable bot module.
pub trait Module: Send {
    fn name(&self) -> &'static str;

    /// Called once when the module is attached to the engine.
    fn attach(&mut self, _config: &Config) {}

    /// React to one event.
    fn handle(&mut self, event: &Event, ctx: &mut ModuleCtx<'_>);
}

/// The protocol engine for one worker generation.
pub struct Engine {
    config: Config,
    modules: Vec<Box<dyn Module>>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            modules: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Attach a module; it sees events in attach order.
    pub fn attach(&mut self, mut module: Box<dyn Module>) {
        module.attach(&self.config);
        self.modules.push(module);
    }

    /// Dispatch one event through the engine core and every module.
    pub fn dispatch(&mut self, event: &Event) -> EngineOutput {
        let mut out: Vec<Message> = Vec::new();
        let mut requests: Vec<WorkerMessage> = Vec::new();

        // Engine core: answer server pings before modules see the event.
        if let Event::Message(msg) = event {
            trace!(command = %msg.command, "Dispatching upstream message");
            if msg.command == "PING" {
                out.push(Message::new("PONG", msg.params.clone()));
            }
        }

        let mut modules = std::mem::take(&mut self.modules);
        {
            let mut ctx = ModuleCtx {
                config: &mut self.config,
                out: &mut out,
                requests: &mut requests,
            };
            for module in &mut modules {
                module.handle(event, &mut ctx);
            }
        }
        self.modules = modules;

        EngineOutput {
            lines: out.iter().map(Message::to_line).collect(),
            requests,
        }
    }
}
