use crate::cancel::CancellationSignal;
use crate::request::{HandlerResult, Request};
use crate::{SwitchyardError, SwitchyardResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Kind of work a handler specializes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    /// Explains or reviews code.
    Analyzer,
    /// Fixes errors and bugs.
    Fixer,
    /// Restructures code without changing behavior.
    Refactor,
    /// Checks code against rules.
    Validator,
    /// Produces designs and architecture.
    Designer,
    /// Writes tests.
    TestGenerator,
    /// Writes documentation.
    Documenter,
    /// C# language specialist.
    #[serde(rename = "csharp")]
    CSharp,
    /// JavaScript language specialist.
    #[serde(rename = "javascript")]
    JavaScript,
    /// Python language specialist.
    Python,
    /// Rust language specialist.
    Rust,
    /// Answers general questions from a knowledge base.
    Knowledge,
    /// Catch-all handler.
    Generic,
}

impl HandlerType {
    /// Every handler type, in declaration order.
    pub const ALL: [HandlerType; 13] = [
        HandlerType::Analyzer,
        HandlerType::Fixer,
        HandlerType::Refactor,
        HandlerType::Validator,
        HandlerType::Designer,
        HandlerType::TestGenerator,
        HandlerType::Documenter,
        HandlerType::CSharp,
        HandlerType::JavaScript,
        HandlerType::Python,
        HandlerType::Rust,
        HandlerType::Knowledge,
        HandlerType::Generic,
    ];

    /// Snake-case label, as used in config and routing rules.
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerType::Analyzer => "analyzer",
            HandlerType::Fixer => "fixer",
            HandlerType::Refactor => "refactor",
            HandlerType::Validator => "validator",
            HandlerType::Designer => "designer",
            HandlerType::TestGenerator => "test_generator",
            HandlerType::Documenter => "documenter",
            HandlerType::CSharp => "csharp",
            HandlerType::JavaScript => "javascript",
            HandlerType::Python => "python",
            HandlerType::Rust => "rust",
            HandlerType::Knowledge => "knowledge",
            HandlerType::Generic => "generic",
        }
    }
}

impl std::fmt::Display for HandlerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerType {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        HandlerType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == needle)
            .ok_or_else(|| SwitchyardError::Config(format!("Unknown handler type '{s}'")))
    }
}

/// Routing-facing summary of an available handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    /// Unique handler name.
    pub name: String,
    /// What the handler specializes in.
    pub handler_type: HandlerType,
    /// Free-form capability tags.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl HandlerDescriptor {
    /// Descriptor without capabilities.
    pub fn new(name: impl Into<String>, handler_type: HandlerType) -> Self {
        Self {
            name: name.into(),
            handler_type,
            capabilities: Vec::new(),
        }
    }

    /// Replace the capability tags.
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Trait every task handler implements.
///
/// `handle` reports domain failures through [`HandlerResult::success`] and
/// reserves `Err` for faults (timeouts, I/O, crashes). Both are subject to the
/// retry allowlist.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Unique name within the pool.
    fn name(&self) -> &str;

    /// Family used for routing fallbacks.
    fn handler_type(&self) -> HandlerType;

    /// Capability tags matched by routing rules.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether the handler accepts `request`.
    fn can_handle(&self, request: &Request) -> bool;

    /// Process a request, observing `cancel`.
    async fn handle(
        &self,
        request: &Request,
        cancel: &CancellationSignal,
    ) -> SwitchyardResult<HandlerResult>;

    /// Called once by the pool before the first request.
    async fn initialize(&self) -> SwitchyardResult<()> {
        Ok(())
    }

    /// Called once by the pool on shutdown.
    async fn shutdown(&self) -> SwitchyardResult<()> {
        Ok(())
    }

    /// Routing view of this handler.
    fn descriptor(&self) -> HandlerDescriptor {
        HandlerDescriptor {
            name: self.name().to_string(),
            handler_type: self.handler_type(),
            capabilities: self.capabilities(),
        }
    }
}

/// Lifecycle and lookup contract for the set of handlers.
#[async_trait]
pub trait HandlerPool: Send + Sync {
    /// Initialize every registered handler.
    async fn start_all(&self) -> SwitchyardResult<()>;

    /// Shut down every started handler.
    async fn stop_all(&self) -> SwitchyardResult<()>;

    /// Started handlers matching the predicate, in registration order.
    fn handlers(&self, predicate: &(dyn Fn(&dyn Handler) -> bool + Sync)) -> Vec<Arc<dyn Handler>>;

    /// First started handler of the given type.
    fn by_type(&self, handler_type: HandlerType) -> Option<Arc<dyn Handler>> {
        self.handlers(&|h| h.handler_type() == handler_type)
            .into_iter()
            .next()
    }

    /// Started handler with the given name.
    fn by_name(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers(&|h| h.name() == name).into_iter().next()
    }
}

/// In-memory handler pool.
///
/// Handlers whose `initialize` fails are logged and left out of lookups.
pub struct HandlerRegistry {
    entries: RwLock<Vec<Arc<dyn Handler>>>,
    active: RwLock<HashSet<String>>,
    started: AtomicBool,
}

impl HandlerRegistry {
    /// Empty registry; nothing is started.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            active: RwLock::new(HashSet::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Register a handler. A handler with the same name replaces the earlier one.
    pub fn register(&self, handler: Arc<dyn Handler>) {
        let name = handler.name().to_string();
        info!(handler = %name, handler_type = %handler.handler_type(), "Registered handler");
        let mut handlers = self.entries.write();
        handlers.retain(|h| h.name() != name);
        handlers.push(handler);
    }

    /// Registered handlers, started or not.
    pub fn handler_count(&self) -> usize {
        self.entries.read().len()
    }

    /// True between `start_all` and `stop_all`.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Descriptors of started handlers, in registration order.
    pub fn descriptors(&self) -> Vec<HandlerDescriptor> {
        self.handlers(&|_| true)
            .iter()
            .map(|h| h.descriptor())
            .collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HandlerPool for HandlerRegistry {
    async fn start_all(&self) -> SwitchyardResult<()> {
        let handlers: Vec<Arc<dyn Handler>> = self.entries.read().clone();
        let mut started = 0usize;
        for handler in handlers {
            match handler.initialize().await {
                Ok(()) => {
                    self.active.write().insert(handler.name().to_string());
                    started += 1;
                }
                Err(e) => {
                    warn!(handler = %handler.name(), error = %e, "Handler failed to initialize");
                }
            }
        }
        self.started.store(true, Ordering::SeqCst);
        info!(started, "Handler pool started");
        Ok(())
    }

    async fn stop_all(&self) -> SwitchyardResult<()> {
        let handlers: Vec<Arc<dyn Handler>> = self.handlers(&|_| true);
        for handler in handlers {
            if let Err(e) = handler.shutdown().await {
                warn!(handler = %handler.name(), error = %e, "Handler failed to shut down");
            }
            self.active.write().remove(handler.name());
        }
        self.started.store(false, Ordering::SeqCst);
        info!("Handler pool stopped");
        Ok(())
    }

    fn handlers(&self, predicate: &(dyn Fn(&dyn Handler) -> bool + Sync)) -> Vec<Arc<dyn Handler>> {
        let active = self.active.read();
        self.entries
            .read()
            .iter()
            .filter(|h| active.contains(h.name()) && predicate(Arc::as_ref(h)))
            .cloned()
            .collect()
    }
}
