use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use crate::app::{self, AppState};
use crate::web::LiveServer;

const DEFAULT_BIND_ADDRESS: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const DEFAULT_PORT: u16 = 7420;

/// Starts the coordination server: the HTTP/WS API that a frontend or CLI
/// client drives to scan repos, materialize trees of worktrees, and manage
/// PTY-backed terminal sessions over them. Repos themselves aren't fixed at
/// startup — each is registered with the server the first time it's scanned
/// via `POST /api/scan`; `project` only anchors where the server's own log
/// files are written.
#[derive(Debug, Parser)]
pub struct ServeCommand {
    /// Directory to anchor the server's own log files under. Defaults to
    /// the current directory.
    pub project: Option<PathBuf>,

    /// The IP address to listen on. Defaults to `127.0.0.1`.
    #[clap(long)]
    pub address: Option<IpAddr>,

    /// The port to listen on. Defaults to `7420`.
    #[clap(long)]
    pub port: Option<u16>,
}

impl ServeCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let ip = self.address.unwrap_or(DEFAULT_BIND_ADDRESS.into());
        let port = self.port.unwrap_or(DEFAULT_PORT);
        let addr: SocketAddr = (ip, port).into();
        let host = if ip.is_loopback() { "localhost".to_owned() } else { ip.to_string() };

        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async move {
            let state = AppState::new();
            // No PTYs can already be live in a freshly-started process, but
            // §4.5 calls for this unconditionally before accepting
            // connections, so it runs here rather than being assumed.
            state.pty.cleanup();
            app::spawn_background_tasks(&state);

            tracing::info!("Listening: http://{host}:{port}");

            LiveServer::new(state).start(addr).await
        })
    }
}
