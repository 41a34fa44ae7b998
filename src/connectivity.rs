//! Connectivity probe and transition events.
//!
//! The online flag is read synchronously and treated as authoritative.
//! Transitions are published as [`ConnectivityEvent`]s on a single-consumer
//! channel that the sync engine drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::gateway::RemoteGateway;

/// A change in connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  Online,
  Offline,
}

/// Connection badge info for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
  pub is_online: bool,
  pub label: &'static str,
}

/// Shared handle to the device's connectivity state.
#[derive(Clone)]
pub struct Connectivity {
  online: Arc<AtomicBool>,
  tx: mpsc::UnboundedSender<ConnectivityEvent>,
  rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ConnectivityEvent>>>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      online: Arc::new(AtomicBool::new(online)),
      tx,
      rx: Arc::new(Mutex::new(Some(rx))),
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Update the flag, emitting an event only when the state actually changes.
  pub fn set_online(&self, online: bool) {
    let previous = self.online.swap(online, Ordering::SeqCst);
    if previous == online {
      return;
    }

    let event = if online {
      info!("connection restored");
      ConnectivityEvent::Online
    } else {
      info!("connection lost, entering offline mode");
      ConnectivityEvent::Offline
    };

    // No consumer is fine; the flag is still updated
    let _ = self.tx.send(event);
  }

  /// Take the event receiver. Only the first caller gets it.
  pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectivityEvent>> {
    match self.rx.lock() {
      Ok(mut rx) => rx.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    }
  }

  pub fn status(&self) -> ConnectionStatus {
    let is_online = self.is_online();
    ConnectionStatus {
      is_online,
      label: if is_online { "Online" } else { "Offline" },
    }
  }

  /// Poll the gateway for reachability and feed the result into the flag.
  ///
  /// Runs until the task is dropped.
  pub async fn probe_loop(self, gateway: Arc<dyn RemoteGateway>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      let reachable = gateway.ping().await.is_ok();
      debug!(reachable, "connectivity probe");
      self.set_online(reachable);
    }
  }
}

impl std::fmt::Debug for Connectivity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connectivity")
      .field("online", &self.is_online())
      .finish_non_exhaustive()
  }
}
