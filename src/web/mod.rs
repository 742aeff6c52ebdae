//! The coordination server's listener: accepts TCP connections and hands
//! each one to [`api::call`], which owns all routing (both the `/api/*`
//! surface and the bare `/ws*` stream endpoints).

mod api;
mod util;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::app::AppState;

pub struct LiveServer {
    state: Arc<AppState>,
}

impl LiveServer {
    pub fn new(state: Arc<AppState>) -> Self {
        LiveServer { state }
    }

    /// Binds `address` and serves connections until the process is killed.
    /// Run from inside an already-running Tokio runtime, the same way the
    /// rest of the coordination server's async tasks are.
    pub async fn start(self, address: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(address).await?;

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, Infallible>(api::call(state, req).await) }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    tracing::error!(error = %err, "error serving connection");
                }
            });
        }
    }
}
