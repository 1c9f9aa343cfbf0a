//! Embedded HTTP server exposing collectors in the text format.

mod router;

use crate::BootstrapResult;
use anyhow::Context as _;
use futures_util::future::FutureExt;
use futures_util::pin_mut;
use hyper_util::rt::TokioIo;
use log::warn;
use parking_lot::RwLock;
use prometheus::proto;
use router::Router;
use socket2::{Domain, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs as _};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Produces metric families for a scrape.
///
/// Implemented by [`MetricRegistry`] and [`MuxCollector`]. A scrape of a
/// path concatenates the families of every collector registered on it.
///
/// [`MetricRegistry`]: crate::registry::MetricRegistry
/// [`MuxCollector`]: crate::mux::MuxCollector
pub trait Collectable: Send + Sync {
    /// Returns the families this collector currently exposes.
    fn collect(&self) -> Vec<proto::MetricFamily>;
}

/// Embedded HTTP server serving registered collectors.
///
/// The listener is bound synchronously, so a bind failure surfaces from
/// [`bind`] and the OS-assigned port of a `:0` bind is available
/// immediately through [`local_addr`]. Requests are served from a
/// dedicated background thread; dropping the exposer shuts the server
/// down gracefully and joins that thread.
///
/// [`bind`]: Exposer::bind
/// [`local_addr`]: Exposer::local_addr
pub struct Exposer {
    local_addr: SocketAddr,
    routes: Arc<router::RouteMap>,
    shutdown_tx: Option<watch::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Exposer {
    /// Binds `addr` (a `host:port` string) and starts serving.
    pub fn bind(addr: &str) -> BootstrapResult<Self> {
        let sock_addr = addr
            .to_socket_addrs()
            .with_context(|| format!("resolving bind address {addr}"))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("bind address {addr} resolved to nothing"))?;

        let std_listener = StdTcpListener::from(
            bind_socket(sock_addr).with_context(|| format!("binding to socket {sock_addr}"))?,
        );
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let routes: Arc<router::RouteMap> = Arc::new(RwLock::new(HashMap::new()));
        let router = Router::new(Arc::clone(&routes));
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let thread = std::thread::Builder::new()
            .name("promkit-exposer".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        warn!("failed to build exposer runtime: {err}");
                        return;
                    }
                };

                runtime.block_on(serve(std_listener, router, shutdown_rx));
            })
            .context("spawning exposer thread")?;

        Ok(Self {
            local_addr,
            routes,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Registers a collector for scrapes of `path`.
    pub fn register_collector(&self, path: &str, collector: Arc<dyn Collectable>) {
        self.routes
            .write()
            .entry(path.to_owned())
            .or_default()
            .push(collector);
    }

    /// The bound address. When bound to port `0` this carries the port
    /// the OS picked.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shorthand for the bound port.
    pub fn listening_port(&self) -> u16 {
        self.local_addr.port()
    }
}

impl Drop for Exposer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("exposer thread panicked during shutdown");
            }
        }
    }
}

async fn serve(std_listener: StdTcpListener, router: Router, mut shutdown_rx: watch::Receiver<()>) {
    let listener = match TcpListener::from_std(std_listener) {
        Ok(listener) => listener,
        Err(err) => {
            warn!("failed to register exposer listener: {err}");
            return;
        }
    };

    // Connection tasks hold clones of `close_rx`; once the accept loop
    // stops, `close_tx.closed()` resolves when the last one finishes.
    let (close_tx, close_rx) = watch::channel(());

    loop {
        let socket = tokio::select! {
            conn = listener.accept() => match conn {
                Ok((conn, _)) => TokioIo::new(conn),
                Err(err) => {
                    warn!("failed to accept connection: {err}");
                    continue;
                }
            },
            _ = shutdown_rx.changed() => break,
        };

        let router = router.clone();
        let mut conn_shutdown_rx = shutdown_rx.clone();
        let close_rx = close_rx.clone();

        tokio::spawn(async move {
            let conn = hyper::server::conn::http1::Builder::new().serve_connection(socket, router);
            let shutdown = async move {
                let _ = conn_shutdown_rx.changed().await;
            }
            .fuse();

            pin_mut!(conn);
            pin_mut!(shutdown);

            loop {
                tokio::select! {
                    _ = conn.as_mut() => break,
                    _ = &mut shutdown => conn.as_mut().graceful_shutdown(),
                }
            }

            drop(close_rx);
        });
    }

    drop(close_rx);
    drop(listener);

    close_tx.closed().await;
}

fn bind_socket(addr: SocketAddr) -> BootstrapResult<Socket> {
    let socket = Socket::new(
        if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        },
        Type::STREAM,
        None,
    )?;

    // No SO_REUSEPORT here: the mux election relies on a second bind of
    // the public port failing while the aggregator is alive.
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(1024)?;

    Ok(socket)
}
