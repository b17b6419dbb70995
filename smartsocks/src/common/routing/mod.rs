// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Failover router: resolves one client connection request into a fully
//! relayed connection by walking an ordered list of transport candidates,
//! remembering which provider last worked for each destination host.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::transport::{
  direct::DIRECT_PROVIDER_NAME, DirectProvider, TransportError, TransportProvider,
};

pub mod relay;

pub use relay::{Piper, RelayError, RelayVerdict};

/// Per-candidate connect budget.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How one routed request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
  /// The relay ran to completion through the named provider.
  Relayed { provider: String },
  /// Every candidate failed or produced a fallback-eligible non-response.
  Exhausted,
}

enum AttemptError {
  Connect(TransportError),
  Relay(RelayError),
}

pub struct Router {
  direct: Arc<dyn TransportProvider>,
  /// Registration order is the failover tie-break order. Read-mostly after
  /// startup.
  providers: Vec<Arc<dyn TransportProvider>>,
  /// Destination host to name of the provider that last succeeded for it.
  /// Advisory only: entries are evicted when the provider fails or vanishes.
  sticky: DashMap<String, String>,
}

impl Router {
  pub fn new() -> Self {
    Self {
      direct: Arc::new(DirectProvider),
      providers: Vec::new(),
      sticky: DashMap::new(),
    }
  }

  /// Registers a tunnel provider. Called once per provider at startup,
  /// before the router is shared with connection workers.
  pub fn register(&mut self, provider: Arc<dyn TransportProvider>) {
    tracing::info!(provider = provider.name(), "transport provider registered");
    self.providers.push(provider);
  }

  /// Seeds the sticky cache, e.g. from a previous run. Unknown provider
  /// names are ignored.
  pub fn set_preferred(&self, host: &str, provider_name: &str) {
    if self.provider_by_name(provider_name).is_some() {
      self.sticky.insert(host.to_string(), provider_name.to_string());
    }
  }

  pub fn preferred(&self, host: &str) -> Option<String> {
    self.sticky.get(host).map(|entry| entry.value().clone())
  }

  fn provider_by_name(&self, name: &str) -> Option<Arc<dyn TransportProvider>> {
    if name == DIRECT_PROVIDER_NAME {
      return Some(self.direct.clone());
    }
    self
      .providers
      .iter()
      .find(|provider| provider.name() == name)
      .cloned()
  }

  fn sticky_provider(&self, host: &str) -> Option<Arc<dyn TransportProvider>> {
    let name = self.preferred(host)?;
    match self.provider_by_name(&name) {
      Some(provider) => Some(provider),
      None => {
        // The cached provider no longer exists; same as no entry.
        self.sticky.remove(host);
        None
      }
    }
  }

  /// Routes one client connection to `host:port`, failing over between
  /// candidates until one attempt is acceptable or all are exhausted. On
  /// exhaustion the local connection is simply left to the caller to drop;
  /// no reply traffic is generated here.
  #[tracing::instrument(level = "debug", skip(self, local))]
  pub async fn route<L>(
    &self,
    local: L,
    host: &str,
    port: u16,
    allow_direct: bool,
  ) -> Result<RouteOutcome, RelayError>
  where
    L: AsyncRead + AsyncWrite + Send + 'static,
  {
    // Plain HTTP is the one destination class where a blocked connection is
    // reliably detectable as total silence from the destination.
    let require_response = port == 80;
    let mut piper = Piper::new(local);
    let mut errors: Vec<(String, TransportError)> = Vec::new();
    let mut sticky_tried: Option<String> = None;

    // A direct sticky entry is ignored (but kept) when this request's policy
    // forbids direct connections; it stays valid for listeners that allow it.
    let sticky_candidate = self
      .sticky_provider(host)
      .filter(|provider| allow_direct || provider.name() != DIRECT_PROVIDER_NAME);
    if let Some(provider) = sticky_candidate {
      if provider.is_available().await {
        let name = provider.name().to_string();
        tracing::debug!(provider = %name, host, port, "trying preferred provider");
        sticky_tried = Some(name.clone());
        match self.attempt(&provider, &mut piper, host, port).await {
          Ok(verdict) if verdict == RelayVerdict::Done || !require_response => {
            piper.shutdown_local().await;
            return Ok(RouteOutcome::Relayed { provider: name });
          }
          Ok(_) => {
            self.sticky.remove(host);
          }
          Err(AttemptError::Relay(relay_error)) => return Err(relay_error),
          Err(AttemptError::Connect(connect_error)) => {
            errors.push((name, connect_error));
            self.sticky.remove(host);
          }
        }
      } else {
        // Unavailable sticky providers are evicted so normal candidate
        // order resumes immediately.
        self.sticky.remove(host);
      }
    }

    if allow_direct && sticky_tried.as_deref() != Some(DIRECT_PROVIDER_NAME) {
      tracing::debug!(host, port, "trying direct connection");
      match self.attempt(&self.direct, &mut piper, host, port).await {
        Ok(verdict) if verdict == RelayVerdict::Done || !require_response => {
          self.learn(host, DIRECT_PROVIDER_NAME, &sticky_tried);
          piper.shutdown_local().await;
          return Ok(RouteOutcome::Relayed {
            provider: DIRECT_PROVIDER_NAME.to_string(),
          });
        }
        Ok(_) => {}
        Err(AttemptError::Relay(relay_error)) => return Err(relay_error),
        Err(AttemptError::Connect(connect_error)) => {
          errors.push((DIRECT_PROVIDER_NAME.to_string(), connect_error));
        }
      }
    }

    for provider in &self.providers {
      let name = provider.name().to_string();
      if sticky_tried.as_deref() == Some(name.as_str()) {
        continue;
      }
      if !provider.is_available().await {
        continue;
      }
      tracing::debug!(provider = %name, host, port, "trying provider");
      match self.attempt(provider, &mut piper, host, port).await {
        Ok(verdict) if verdict == RelayVerdict::Done || !require_response => {
          self.learn(host, &name, &sticky_tried);
          piper.shutdown_local().await;
          return Ok(RouteOutcome::Relayed { provider: name });
        }
        Ok(_) => {}
        Err(AttemptError::Relay(relay_error)) => return Err(relay_error),
        Err(AttemptError::Connect(connect_error)) => {
          errors.push((name, connect_error));
        }
      }
    }

    tracing::error!(host, port, "no provider could relay the connection");
    for (provider, error) in &errors {
      tracing::debug!(provider = %provider, %error, "candidate failure");
    }
    Ok(RouteOutcome::Exhausted)
  }

  async fn attempt<L>(
    &self,
    provider: &Arc<dyn TransportProvider>,
    piper: &mut Piper<L>,
    host: &str,
    port: u16,
  ) -> Result<RelayVerdict, AttemptError>
  where
    L: AsyncRead + AsyncWrite + Send + 'static,
  {
    let transport = provider
      .connect(host, port, CONNECT_TIMEOUT)
      .await
      .map_err(AttemptError::Connect)?;
    piper.pipe(transport).await.map_err(AttemptError::Relay)
  }

  fn learn(&self, host: &str, provider_name: &str, sticky_tried: &Option<String>) {
    if sticky_tried.as_deref() == Some(provider_name) {
      return;
    }
    tracing::debug!(host, provider = provider_name, "sticky route learned");
    self
      .sticky
      .insert(host.to_string(), provider_name.to_string());
  }
}

impl Default for Router {
  fn default() -> Self {
    Self::new()
  }
}
