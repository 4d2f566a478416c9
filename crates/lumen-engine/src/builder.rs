use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lumen_context::{ContextPlanner, DefaultContextPlanner};
use lumen_llm::LlmClient;
use lumen_persist::Stores;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chat::ChatService;
use crate::jobs::{ChatMaintainHandler, ChatPathIndexHandler, ChatRebuildHandler, ChatRespondHandler, JobRuntime};
use crate::maintainer::{GraphMirror, Maintainer};
use crate::notify::Notifier;
use crate::path_indexer::PathIndexer;
use crate::responder::Responder;
use crate::router::{DefaultTurnRouter, TurnRouter};
use crate::tools::{ChatToolExecutor, ToolExecutor};
use crate::types::EngineConfig;

/// Fully wired engine: inbound chat service plus the background job runtime
#[derive(Clone)]
pub struct Engine {
    pub stores: Stores,
    pub notifier: Notifier,
    pub chat: ChatService,
    pub responder: Arc<Responder>,
    pub maintainer: Arc<Maintainer>,
    pub path_indexer: Arc<PathIndexer>,
    pub runtime: Arc<JobRuntime>,
    pub config: EngineConfig,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Start the configured number of job workers
    pub fn start_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.runtime.run_workers(self.config.jobs.workers, shutdown)
    }
}

/// Builder for an [`Engine`]; stores and an LLM client are required, the rest defaults
pub struct EngineBuilder {
    stores: Option<Stores>,
    llm: Option<Arc<dyn LlmClient>>,
    config: EngineConfig,
    notifier: Option<Notifier>,
    planner: Option<Arc<dyn ContextPlanner>>,
    router: Option<Arc<dyn TurnRouter>>,
    tools: Option<Arc<dyn ToolExecutor>>,
    mirror: Option<Arc<dyn GraphMirror>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            stores: None,
            llm: None,
            config: EngineConfig::default(),
            notifier: None,
            planner: None,
            router: None,
            tools: None,
            mirror: None,
        }
    }

    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn llm_client(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a notifier with another component, e.g. the HTTP layer's SSE endpoint
    pub fn notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn ContextPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn router(mut self, router: Arc<dyn TurnRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn graph_mirror(mut self, mirror: Arc<dyn GraphMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let stores = self.stores.ok_or_else(|| anyhow!("stores are required"))?;
        let llm = self.llm.ok_or_else(|| anyhow!("LLM client is required"))?;
        let config = self.config;

        let notifier = self
            .notifier
            .unwrap_or_else(|| Notifier::from_config(&config.notifier));

        let planner: Arc<dyn ContextPlanner> = match self.planner {
            Some(planner) => planner,
            None => Arc::new(
                DefaultContextPlanner::new(stores.clone(), llm.clone(), config.context.clone())
                    .context("building context planner")?,
            ),
        };
        let router: Arc<dyn TurnRouter> = match self.router {
            Some(router) => router,
            None => Arc::new(
                DefaultTurnRouter::with_llm(
                    llm.clone(),
                    config.responder.fast_model.clone(),
                    Duration::from_millis(config.responder.router_timeout_ms),
                )
                .tool_routing(config.responder.tool_routing),
            ),
        };
        let tools: Arc<dyn ToolExecutor> = match self.tools {
            Some(tools) => tools,
            None => Arc::new(ChatToolExecutor::new(stores.clone()).with_max_attempts(config.jobs.max_attempts)),
        };

        let responder = Arc::new(
            Responder::new(
                stores.clone(),
                llm.clone(),
                planner,
                router,
                tools,
                notifier.clone(),
                config.responder.clone(),
            )
            .with_maintain_attempts(config.jobs.max_attempts),
        );

        let mut maintainer = Maintainer::new(stores.clone(), llm.clone(), config.maintainer.clone())
            .with_model(config.responder.fast_model.clone());
        if let Some(mirror) = self.mirror {
            maintainer = maintainer.with_mirror(mirror);
        }
        let maintainer = Arc::new(maintainer);
        let path_indexer = Arc::new(PathIndexer::new(stores.clone(), llm));

        let runtime = JobRuntime::new(stores.jobs.clone(), config.jobs.clone())
            .register(Arc::new(ChatRespondHandler::new(responder.clone())))
            .register(Arc::new(ChatMaintainHandler::new(stores.clone(), maintainer.clone())))
            .register(Arc::new(ChatRebuildHandler::new(stores.clone(), maintainer.clone())))
            .register(Arc::new(ChatPathIndexHandler::new(stores.clone(), path_indexer.clone())));

        let chat = ChatService::new(stores.clone(), notifier.clone()).with_respond_attempts(config.jobs.max_attempts);

        Ok(Engine {
            stores,
            notifier,
            chat,
            responder,
            maintainer,
            path_indexer,
            runtime: Arc::new(runtime),
            config,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
