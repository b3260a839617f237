//! Leader TCP Relay
//!
//! A stoppable TCP listener that forwards accepted connections
//! byte-for-byte to the local Redis port. The relay runs only while
//! this node holds leadership, so reaching it always means reaching
//! the current primary.
//!
//! The running/stopped flag is an explicit state value behind a single
//! mutex; `start`, `stop` and the async-failure observation in `wait`
//! all serialize through it. Legal transitions are `Stopped -> Running`
//! via `start` only, and `Running -> Stopped` via `stop` or a failure
//! observed while running.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Relay lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Stopped,
    Running,
}

struct Inner {
    state: RelayState,
    /// Bound listener address while running
    bound: Option<SocketAddr>,
    /// Cancels the accept loop of the current run
    shutdown: Option<CancellationToken>,
    /// Exit report of the current run's accept loop
    done: Option<mpsc::Receiver<Result<()>>>,
    /// Accept loop task of the current run; joined on stop so the
    /// listener socket is released before `stop` returns
    task: Option<tokio::task::JoinHandle<()>>,
}

/// TCP relay forwarding client connections to the local store.
pub struct Relay {
    listen_addr: String,
    upstream_addr: String,
    inner: Mutex<Inner>,
}

impl Relay {
    pub fn new(listen_addr: String, upstream_addr: String) -> Self {
        Self {
            listen_addr,
            upstream_addr,
            inner: Mutex::new(Inner {
                state: RelayState::Stopped,
                bound: None,
                shutdown: None,
                done: None,
                task: None,
            }),
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> RelayState {
        self.inner.lock().await.state
    }

    /// Address the relay is bound to, if running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().await.bound
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Calling `start` while already running is a caller error.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == RelayState::Running {
            return Err(Error::Relay("relay is already running".into()));
        }

        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| Error::Relay(format!("failed to bind {}: {}", self.listen_addr, e)))?;
        let bound = listener
            .local_addr()
            .map_err(|e| Error::Relay(format!("failed to resolve bound address: {}", e)))?;

        let token = CancellationToken::new();
        let (done_tx, done_rx) = mpsc::channel(1);
        let upstream = self.upstream_addr.clone();
        let loop_token = token.clone();
        let task = tokio::spawn(async move {
            let exit = accept_loop(listener, upstream, loop_token).await;
            let _ = done_tx.send(exit).await;
        });

        inner.state = RelayState::Running;
        inner.bound = Some(bound);
        inner.shutdown = Some(token);
        inner.done = Some(done_rx);
        inner.task = Some(task);
        tracing::debug!("relay accepting connections on {}", bound);
        Ok(())
    }

    /// Stop accepting connections and abruptly close in-flight relays.
    /// The listener socket is released before `stop` returns, so the
    /// same port can be bound again immediately.
    ///
    /// Idempotent: stopping an already stopped relay is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == RelayState::Stopped {
            return Ok(());
        }
        if let Some(token) = inner.shutdown.take() {
            token.cancel();
        }
        // The listener is only released when the accept loop exits;
        // join it so no stale connection slips in after demotion and a
        // re-promotion can rebind the port without EADDRINUSE.
        let joined = match inner.task.take() {
            Some(task) => task.await,
            None => Ok(()),
        };
        inner.state = RelayState::Stopped;
        inner.bound = None;
        joined.map_err(|e| Error::Relay(format!("accept loop did not shut down cleanly: {}", e)))?;
        tracing::debug!("relay stopped");
        Ok(())
    }

    /// Block until the current run terminates.
    ///
    /// Returns `Ok(())` on a clean stop and `Err` on an asynchronous
    /// failure. A failure that arrives after the relay was already
    /// stopped belongs to an ended term and is reported as clean.
    pub async fn wait(&self) -> Result<()> {
        let mut done = {
            let mut inner = self.inner.lock().await;
            match inner.done.take() {
                Some(rx) => rx,
                None => return Ok(()),
            }
        };

        let exit = done.recv().await;

        let mut inner = self.inner.lock().await;
        match exit {
            Some(Err(e)) if inner.state == RelayState::Running => {
                if let Some(token) = inner.shutdown.take() {
                    token.cancel();
                }
                // The accept loop already exited to report the error.
                if let Some(task) = inner.task.take() {
                    let _ = task.await;
                }
                inner.state = RelayState::Stopped;
                inner.bound = None;
                Err(e)
            }
            _ => Ok(()),
        }
    }
}

/// Accept connections until cancelled. Per-connection errors are
/// logged; an accept failure terminates the whole run.
async fn accept_loop(
    listener: TcpListener,
    upstream: String,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                match accepted {
                    Ok((client, addr)) => {
                        tracing::debug!("relay connection from {}", addr);
                        let upstream = upstream.clone();
                        let conn_token = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = forward(client, &upstream, conn_token).await {
                                tracing::debug!("relay connection to {} ended: {}", upstream, e);
                            }
                        });
                    }
                    Err(e) => {
                        return Err(Error::Relay(format!("accept failed: {}", e)));
                    }
                }
            }
        }
    }
}

/// Forward raw bytes in both directions until either side closes or
/// the run is cancelled. No protocol inspection.
async fn forward(
    mut client: TcpStream,
    upstream: &str,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut backend = TcpStream::connect(upstream).await?;
    tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        res = tokio::io::copy_bidirectional(&mut client, &mut backend) => res.map(|_| ()),
    }
}
