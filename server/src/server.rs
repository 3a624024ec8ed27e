//! Server lifecycle: construction, the accept loop, and graceful teardown
//!
//! [`MazeServer::bind`] builds the shared modules in dependency order
//! (client registry, maze, player table) and binds the listening socket.
//! [`MazeServer::run`] accepts connections until shutdown is requested,
//! then closes the listener, asks every service task to stop, waits for the
//! registry to drain, and releases the game state. Tests drive teardown
//! through a [`ShutdownHandle`]; the binary wires it to SIGHUP.

use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::maze::Maze;
use crate::player::PlayerTable;
use crate::registry::ClientRegistry;
use crate::service::client_service;

/// Maze used when no template file is given.
pub const DEFAULT_TEMPLATE: [&str; 8] = [
    "******************************",
    "***** %%%%%%%%% &&&&&&&&&&& **",
    "***** %%%%%%%%%        $$$$  *",
    "*           $$$$$$ $$$$$$$$$ *",
    "*##########                  *",
    "*########## @@@@@@@@@@@@@@@@@*",
    "*           @@@@@@@@@@@@@@@@@*",
    "******************************",
];

/// The process-wide game modules, shared by every service task.
pub struct ServerContext {
    pub registry: ClientRegistry,
    pub maze: Maze,
    pub players: PlayerTable,
}

/// Requests a graceful stop of a running [`MazeServer`]. Cloneable;
/// requesting shutdown more than once is harmless.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Notify>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.notify_one();
    }
}

/// A bound MazeWar server, ready to run.
pub struct MazeServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    shutdown: Arc<Notify>,
}

impl MazeServer {
    /// Initializes the game modules and binds the listening socket.
    pub async fn bind<S: AsRef<str>>(
        addr: &str,
        template: &[S],
    ) -> Result<MazeServer, Box<dyn Error>> {
        let registry = ClientRegistry::new();
        let maze = Maze::new(template)?;
        let players = PlayerTable::new();
        debug!("initial maze:\n{}", maze);

        let listener = TcpListener::bind(addr).await?;
        info!("server listening on {}", listener.local_addr()?);

        Ok(MazeServer {
            listener,
            ctx: Arc::new(ServerContext {
                registry,
                maze,
                players,
            }),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    /// Accepts connections, spawning one service task each, until shutdown
    /// is requested; then drains and tears down.
    ///
    /// Teardown order: close the listener, ask every live connection to
    /// stop reading, wait for the registry to drain, release the remaining
    /// player records.
    pub async fn run(self) {
        let MazeServer {
            listener,
            ctx,
            shutdown,
        } = self;

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("accepted connection from {}", addr);
                        tokio::spawn(client_service(Arc::clone(&ctx), stream));
                    }
                    Err(err) => {
                        error!("accept failed: {}", err);
                    }
                },
                _ = shutdown.notified() => break,
            }
        }

        info!("shutting down: closing listener, draining service tasks");
        drop(listener);
        ctx.registry.shutdown_all();
        ctx.registry.wait_for_empty().await;
        ctx.players.clear();
        info!("all service tasks drained; server stopped");
    }
}

/// Reads a maze template file: one row per line, newlines stripped.
/// Width validation happens when the maze is built from the rows.
pub fn load_template(path: &Path) -> io::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.lines().map(str::to_string).collect())
}
