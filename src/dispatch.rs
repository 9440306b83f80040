//! Lifecycle and event dispatch for cache agents.
//!
//! The dispatcher plays the part of the hosting platform: it installs and
//! activates agent versions one at a time, tracks which one controls fetches,
//! and runs every fetch event as its own tokio task.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{ActivateReport, CacheAgent};
use crate::cache::{CacheResult, CacheStorage};
use crate::http::{Fetcher, Request, Response};

/// Lifecycle state of the registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
  /// No agent has ever been installed
  Uninstalled,
  /// A version is pre-caching its manifest
  Installing { version: String },
  /// A version is deleting superseded generations
  Activating { version: String },
  /// A version controls fetches
  Active { version: String },
}

struct Controller<S: CacheStorage, F: Fetcher> {
  state: AgentState,
  active: Option<Arc<CacheAgent<S, F>>>,
}

/// Registration point for agent versions and entry point for fetch events.
pub struct Dispatcher<S: CacheStorage, F: Fetcher> {
  controller: Arc<RwLock<Controller<S, F>>>,
  /// Serializes install/activate of successive versions
  registering: Arc<Mutex<()>>,
  /// Used while no agent is active
  network: Arc<F>,
}

impl<S, F> Dispatcher<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  pub fn new(network: Arc<F>) -> Self {
    Self {
      controller: Arc::new(RwLock::new(Controller {
        state: AgentState::Uninstalled,
        active: None,
      })),
      registering: Arc::new(Mutex::new(())),
      network,
    }
  }

  /// Dispatcher controlled by an agent installed and activated earlier,
  /// e.g. by a previous run against the same database.
  pub fn with_active(agent: CacheAgent<S, F>) -> Self {
    let network = Arc::clone(agent.fetcher());
    let state = AgentState::Active {
      version: agent.version().to_string(),
    };
    Self {
      controller: Arc::new(RwLock::new(Controller {
        state,
        active: Some(Arc::new(agent)),
      })),
      registering: Arc::new(Mutex::new(())),
      network,
    }
  }

  pub fn state(&self) -> Result<AgentState> {
    let controller = self
      .controller
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(controller.state.clone())
  }

  /// Version of the agent currently answering fetches.
  pub fn active_version(&self) -> Result<Option<String>> {
    Ok(self.active()?.map(|agent| agent.version().to_string()))
  }

  fn active(&self) -> Result<Option<Arc<CacheAgent<S, F>>>> {
    let controller = self
      .controller
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(controller.active.clone())
  }

  fn set_state(&self, state: AgentState) -> Result<AgentState> {
    let mut controller = self
      .controller
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    debug!(from = ?controller.state, to = ?state, "agent state");
    Ok(std::mem::replace(&mut controller.state, state))
  }

  /// Install, then activate, a new agent version.
  ///
  /// The previous agent keeps answering fetches while the new one installs.
  /// If install fails the previous state is restored and the error returned;
  /// registering again retries the install. Once install succeeds the new
  /// version ends up active even if cleaning up old generations fails.
  pub async fn register(&self, agent: CacheAgent<S, F>) -> Result<ActivateReport> {
    let _registering = self.registering.lock().await;
    let version = agent.version().to_string();
    let agent = Arc::new(agent);

    let previous = self.set_state(AgentState::Installing {
      version: version.clone(),
    })?;

    if let Err(e) = agent.install().await {
      warn!(version = %version, error = %e, "install failed");
      self.set_state(previous)?;
      return Err(e.wrap_err(format!("Failed to install {}", version)));
    }

    // The new version takes over fetches as soon as it starts activating
    {
      let mut controller = self
        .controller
        .write()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      controller.state = AgentState::Activating {
        version: version.clone(),
      };
      controller.active = Some(Arc::clone(&agent));
    }

    let activated = agent.activate().await;
    self.set_state(AgentState::Active {
      version: version.clone(),
    })?;

    match activated {
      Ok(report) => {
        info!(version = %version, "agent active");
        Ok(report)
      }
      Err(e) => {
        warn!(version = %version, error = %e, "agent active, stale generations left in place");
        Err(e.wrap_err(format!("Failed to activate {}", version)))
      }
    }
  }

  /// Answer a request through the active agent, or straight from the network
  /// when none is active.
  pub async fn fetch(&self, request: &Request) -> Result<CacheResult<Response>> {
    match self.active()? {
      Some(agent) => agent.handle_fetch(request).await,
      None => {
        debug!(url = %request.url, "no active agent, passing through");
        let response = self.network.fetch(request).await?;
        Ok(CacheResult::from_network(response))
      }
    }
  }

  /// Run a fetch event as an independent task.
  pub fn dispatch(&self, request: Request) -> JoinHandle<Result<CacheResult<Response>>> {
    let dispatcher = self.clone();
    tokio::spawn(async move { dispatcher.fetch(&request).await })
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for Dispatcher<S, F> {
  fn clone(&self) -> Self {
    Self {
      controller: Arc::clone(&self.controller),
      registering: Arc::clone(&self.registering),
      network: Arc::clone(&self.network),
    }
  }
}
