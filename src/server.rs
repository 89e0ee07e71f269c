//! Fixed pool of reactor threads sharing one listener and one registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::error::{Error, Result, TransportError};
use crate::reactor::{bind_listener, Handler, Reactor, ReactorContext, ReactorHandle, ReactorMetrics};
use crate::registry::Registry;

/// Stops every reactor of a [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    reactors: Vec<ReactorHandle>,
}

impl ServerHandle {
    /// Ask every reactor to close its connections and exit.
    pub fn shutdown(&self) {
        for reactor in &self.reactors {
            reactor.shutdown();
        }
    }
}

/// Running gateway: `worker_threads` reactors, each accepting from its own
/// clone of the listener and owning the connections it accepted.
pub struct Server {
    local_addr: SocketAddr,
    context: ReactorContext,
    handle: ServerHandle,
    threads: Vec<JoinHandle<Result<()>>>,
}

impl Server {
    /// Bind and start serving; `factory(shard)` builds each reactor's handler.
    pub fn start<H, F>(config: GatewayConfig, factory: F) -> Result<Self>
    where
        H: Handler + Send + 'static,
        F: FnMut(usize) -> H,
    {
        let context = ReactorContext::new(config.max_connections);
        Self::start_with(config, context, factory)
    }

    /// Like [`Server::start`] with caller-provided shared resources.
    pub fn start_with<H, F>(config: GatewayConfig, context: ReactorContext, mut factory: F) -> Result<Self>
    where
        H: Handler + Send + 'static,
        F: FnMut(usize) -> H,
    {
        config.validate()?;
        let listener = bind_listener(config.bind_address)?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { addr: config.bind_address, source })?;

        let mut reactors = Vec::with_capacity(config.worker_threads);
        for shard in 0..config.worker_threads {
            let clone = listener
                .try_clone()
                .map_err(|source| Error::Bind { addr: local_addr, source })?;
            reactors.push(Reactor::with_listener(
                clone,
                shard,
                config.clone(),
                factory(shard),
                context.clone(),
            )?);
        }

        let handle = ServerHandle {
            reactors: reactors.iter().map(Reactor::handle).collect(),
        };

        let mut threads = Vec::with_capacity(reactors.len());
        for (shard, mut reactor) in reactors.into_iter().enumerate() {
            let spawned = thread::Builder::new()
                .name(format!("wsgate-reactor-{shard}"))
                .spawn(move || reactor.run());
            match spawned {
                Ok(thread) => threads.push(thread),
                Err(e) => {
                    handle.shutdown();
                    return Err(TransportError::io("spawn", e).into());
                }
            }
        }

        info!(addr = %local_addr, workers = threads.len(), "server started");
        Ok(Self {
            local_addr,
            context,
            handle,
            threads,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop switch.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Counters aggregated over every reactor.
    pub fn metrics(&self) -> &ReactorMetrics {
        &self.context.metrics
    }

    /// The shared connection table.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.context.registry
    }

    /// Wait for every reactor to exit. Returns the first reactor error.
    pub fn join(self) -> Result<()> {
        let mut first = None;
        for thread in self.threads {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "reactor failed");
                    first.get_or_insert(e);
                }
                Err(_) => error!("reactor thread panicked"),
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;
    use crate::error::CloseCode;
    use crate::frame::Frame;
    use crate::reactor::{Outbox, PeerInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Idle;

    impl Handler for Idle {
        fn on_connect(&mut self, _peer: &PeerInfo, _out: &mut Outbox) -> Result<()> {
            Ok(())
        }

        fn on_frame(&mut self, _id: ConnectionId, _message: Frame, _out: &mut Outbox) -> Result<()> {
            Ok(())
        }

        fn on_disconnect(&mut self, _id: ConnectionId, _code: CloseCode) {}
    }

    #[test]
    fn starts_one_reactor_per_worker_and_stops() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let server = Server::start(
            GatewayConfig {
                bind_address: "127.0.0.1:0".parse().unwrap(),
                worker_threads: 3,
                poll_timeout_ms: 20,
                ..GatewayConfig::default()
            },
            move |_shard| {
                counter.fetch_add(1, Ordering::SeqCst);
                Idle
            },
        )
        .unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 3);
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.registry().is_empty());

        server.handle().shutdown();
        server.join().unwrap();
    }

    #[test]
    fn invalid_config_is_rejected_before_binding() {
        let err = Server::start(
            GatewayConfig {
                worker_threads: 0,
                ..GatewayConfig::default()
            },
            |_| Idle,
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
