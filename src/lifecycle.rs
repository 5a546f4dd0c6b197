//! Starting and stopping rule instances.
//!
//! Per rule: Stopped -> Starting -> Running -> Stopping -> Stopped. Every
//! transition happens under the registry lock; only `running` is visible.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FleetError, FleetResult};
use crate::instrumented::InstrumentedListener;
use crate::registry::{rule_mut, Fleet, FleetState};
use crate::rule::Rule;
use crate::socks::{PermitCommand, ServerOptions, Socks5Server, StaticCredentials};
use crate::traffic::TrafficCounter;

/// How long shutdown waits for each accept loop to exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A running protocol server and its accept loop task
#[derive(Debug)]
pub(crate) struct ServerHandle {
    server: Arc<Socks5Server>,
    accept_loop: JoinHandle<()>,
}

/// What is left of a stopped instance once its socket is closed: the
/// listener for a last flush and the accept loop task
#[derive(Debug)]
pub(crate) struct Detached {
    id: String,
    listener: Option<InstrumentedListener>,
    server: Option<ServerHandle>,
}

impl Detached {
    /// Flush bytes counted by lingering sessions since the stop. Returns the
    /// accept loop's task.
    ///
    /// Runs without the registry lock.
    pub(crate) async fn finish(self) -> Option<JoinHandle<()>> {
        if let Some(listener) = &self.listener {
            listener.flush_bounded().await;
        }
        self.server.map(|s| s.accept_loop)
    }
}

/// Protocol options derived from a rule
pub fn server_options(rule: &Rule) -> ServerOptions {
    let mut options = ServerOptions::default();
    if rule.enable_udp {
        options.permit = PermitCommand {
            enable_connect: true,
            enable_bind: true,
            enable_associate: true,
        };
    }
    if !rule.no_auth {
        options.credentials = Some(StaticCredentials::single(
            rule.username.clone(),
            rule.password.clone(),
        ));
    }
    options
}

impl Fleet {
    /// Start the server for `id`. Starting a running rule is a no-op.
    pub async fn start_server(&self, id: &str) -> FleetResult<()> {
        let started = {
            let mut state = self.shared.state();
            self.start_locked(&mut state, id)?
        };
        if started {
            self.persist().await;
        }
        Ok(())
    }

    /// Stop the server for `id`, folding its unflushed traffic into the rule
    pub async fn stop_server(&self, id: &str) -> FleetResult<()> {
        let detached = {
            let mut state = self.shared.state();
            self.stop_locked(&mut state, id)?
        };
        detached.finish().await;
        info!("Stopped rule {}", id);
        self.persist().await;
        Ok(())
    }

    /// Options the running server for `id` was built with
    #[cfg(test)]
    pub(crate) fn server_options(&self, id: &str) -> Option<ServerOptions> {
        self.shared
            .state()
            .servers
            .get(id)
            .map(|s| s.server.options().clone())
    }

    /// Address the running listener for `id` is bound to
    #[cfg(test)]
    pub(crate) fn listen_addr(&self, id: &str) -> Option<std::net::SocketAddr> {
        self.shared.state().listeners.get(id).map(|l| l.local_addr())
    }

    /// Check that a running, UDP-enabled rule's port can take a UDP socket
    pub fn test_udp(&self, id: &str) -> String {
        let state = self.shared.state();
        let Some(rule) = state.rule(id) else {
            return format!("Error: rule {} not found", id);
        };
        if !rule.running {
            return format!("Error: rule {} is not running, start it first", id);
        }
        if !rule.enable_udp {
            return format!("Error: UDP is not enabled for rule {}", id);
        }
        match UdpSocket::bind((self.shared.options.listen_ip, rule.port)) {
            Ok(socket) => {
                drop(socket);
                format!("UDP port {} is available for UDP traffic", rule.port)
            }
            Err(e) => format!("UDP port {} cannot be bound: {}", rule.port, e),
        }
    }

    /// Stop every running rule and save
    pub async fn shutdown(&self) {
        let detached: Vec<Detached> = {
            let mut state = self.shared.state();
            let running: Vec<String> = state.listeners.keys().cloned().collect();
            running
                .iter()
                .filter_map(|id| self.stop_locked(&mut state, id).ok())
                .collect()
        };

        for d in detached {
            let id = d.id.clone();
            if let Some(task) = d.finish().await {
                if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                    warn!("Accept loop for {} did not exit in time", id);
                }
            }
        }

        self.persist().await;
        info!("Shutdown complete, {} rules saved", self.shared.state().rules.len());
    }

    /// Bring `id` up. Returns false if it was already running.
    ///
    /// Nothing is registered unless the bind succeeds.
    pub(crate) fn start_locked(&self, state: &mut FleetState, id: &str) -> FleetResult<bool> {
        let rule = state
            .rule(id)
            .ok_or_else(|| FleetError::NotFound(id.to_string()))?;
        if rule.running {
            return Ok(false);
        }
        rule.validate()?;

        let options = server_options(rule);
        let (port, enable_udp, no_auth) = (rule.port, rule.enable_udp, rule.no_auth);
        let listen_ip = self.shared.options.listen_ip;
        let bind_err = |source| FleetError::Bind {
            id: id.to_string(),
            port,
            source,
        };

        let socket = std::net::TcpListener::bind((listen_ip, port)).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        let socket = tokio::net::TcpListener::from_std(socket).map_err(bind_err)?;

        if enable_udp {
            udp_preflight(listen_ip, port);
        }

        let counter = Arc::new(TrafficCounter::new(id, self.shared.flush_target()));
        let listener = InstrumentedListener::new(socket, Arc::clone(&counter)).map_err(bind_err)?;
        let server = Arc::new(Socks5Server::new(options));
        let accept_loop = tokio::spawn(Arc::clone(&server).serve(listener.clone()));

        state.counters.insert(id.to_string(), counter);
        state.listeners.insert(id.to_string(), listener);
        state
            .servers
            .insert(id.to_string(), ServerHandle { server, accept_loop });
        if let Some(rule) = rule_mut(&mut state.rules, id) {
            rule.running = true;
        }

        info!(
            "Started rule {} on {}:{} (auth: {}, udp: {})",
            id,
            listen_ip,
            port,
            if no_auth { "none" } else { "password" },
            enable_udp
        );
        Ok(true)
    }

    /// Take `id` down to stopped under the registry lock.
    ///
    /// The live counter is drained straight into the rule here; calling its
    /// own flush would try to take the registry lock again. The socket is
    /// closed before returning, so the port is free as soon as the rule
    /// reads as stopped.
    pub(crate) fn stop_locked(&self, state: &mut FleetState, id: &str) -> FleetResult<Detached> {
        let rule = rule_mut(&mut state.rules, id)
            .ok_or_else(|| FleetError::NotFound(id.to_string()))?;
        if !rule.running {
            return Err(FleetError::NotRunning(id.to_string()));
        }
        rule.running = false;

        if let Some(counter) = state.counters.remove(id) {
            let (upload, download) = counter.drain();
            rule.upload_bytes += upload;
            rule.download_bytes += download;
            debug!(
                "Final traffic for {}: +{} up, +{} down",
                id, upload, download
            );
        }

        let listener = state.listeners.remove(id);
        if let Some(listener) = &listener {
            if let Err(e) = listener.close_now() {
                warn!("Error closing listener for {}: {}", id, e);
            }
        }

        Ok(Detached {
            id: id.to_string(),
            listener,
            server: state.servers.remove(id),
        })
    }
}

/// Open and close a UDP socket on the rule's port, for the log only
fn udp_preflight(ip: std::net::IpAddr, port: u16) {
    match UdpSocket::bind((ip, port)) {
        Ok(socket) => {
            drop(socket);
            info!("UDP port {} is free, UDP relay ready", port);
        }
        Err(e) => warn!("UDP port {} preflight failed: {}", port, e),
    }
}
