use axum::serve::{Listener, ListenerExt};
use axum::{Router, routing::get};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tower_http::trace::TraceLayer;

use crate::handlers::{dispatch_handler, health_handler, metrics_handler};
use crate::state::AppState;

// Every path belongs to some service, so the dispatcher is the fallback
pub fn gateway_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(dispatch_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// Served on its own port so no service name is shadowed
pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// Upper bound on how long force-closed connections get to unwind
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Serve until `shutdown` fires, then stop accepting and give in-flight
/// requests up to `grace` to finish. Connections still open after that are
/// force-closed, which drops their handlers and any upstream calls with them.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
    grace: Duration,
) -> std::io::Result<()> {
    let force_close = CancellationToken::new();
    // no-op tap: axum only provides `Connected` for SocketAddr via TcpListener or TapIo
    let listener = ClosableListener::new(listener, force_close.clone()).tap_io(|_| {});

    let signal = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
    });

    tokio::select! {
        res = &mut server => return flatten(res),
        _ = shutdown.cancelled() => {}
    }

    tracing::info!(grace = ?grace, "shutting down, waiting for in-flight requests");

    if let Ok(res) = tokio::time::timeout(grace, &mut server).await {
        return flatten(res);
    }

    tracing::warn!("grace period elapsed, force-closing remaining connections");
    force_close.cancel();

    match tokio::time::timeout(FORCE_CLOSE_WAIT, &mut server).await {
        Ok(res) => flatten(res),
        Err(_) => {
            server.abort();
            Ok(())
        }
    }
}

/// TCP listener whose accepted connections all fail with
/// `ConnectionAborted` once `force_close` is cancelled.
#[derive(Debug)]
pub struct ClosableListener {
    inner: TcpListener,
    force_close: CancellationToken,
}

impl ClosableListener {
    pub fn new(inner: TcpListener, force_close: CancellationToken) -> Self {
        Self { inner, force_close }
    }
}

impl Listener for ClosableListener {
    type Io = ClosableStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        let (stream, addr) = Listener::accept(&mut self.inner).await;
        let io = ClosableStream {
            inner: stream,
            closed: Box::pin(self.force_close.clone().cancelled_owned()),
        };
        (io, addr)
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Listener::local_addr(&self.inner)
    }
}

pub struct ClosableStream {
    inner: TcpStream,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl ClosableStream {
    // also registers the waker, so an idle connection wakes up on force-close
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Option<std::io::Error> {
        match self.closed.as_mut().poll(cx) {
            Poll::Ready(()) => Some(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection force-closed on shutdown",
            )),
            Poll::Pending => None,
        }
    }
}

impl AsyncRead for ClosableStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if let Some(e) = this.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ClosableStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if let Some(e) = this.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if let Some(e) = this.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn flatten(res: Result<std::io::Result<()>, tokio::task::JoinError>) -> std::io::Result<()> {
    res.map_err(std::io::Error::other)?
}

/// Resolves on SIGINT or SIGTERM and cancels `shutdown`.
pub async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
        _ = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}
