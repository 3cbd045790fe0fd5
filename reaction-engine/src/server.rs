//! Control socket
//!
//! Unix domain socket, one request per connection. Bad requests are answered
//! with an error to that client only.

use reaction_core::protocol::{read_message, write_message};
use reaction_core::{ProtocolError, Request, Response};
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::control::Controller;
use crate::EngineError;

pub struct ControlServer {
    path: PathBuf,
    listener: UnixListener,
}

impl ControlServer {
    /// Bind the socket, replacing a stale one
    pub async fn bind(path: &Path) -> Result<Self, EngineError> {
        let socket_err = |source: std::io::Error| EngineError::Socket {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(socket_err)?;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(socket_err(e)),
        }

        let listener = UnixListener::bind(path).map_err(socket_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)).map_err(socket_err)?;
        }

        info!(path = %path.display(), "Control socket listening");
        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    /// Accept clients until `stop` turns true, then remove the socket
    pub async fn run(self, controller: Controller, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let controller = controller.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve(stream, &controller).await {
                                debug!(error = %e, "Client connection failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            debug!(path = %self.path.display(), error = %e, "Could not remove socket");
        }
        info!("Control socket closed");
    }
}

async fn serve(mut stream: UnixStream, controller: &Controller) -> Result<(), ProtocolError> {
    let response = match read_message::<Request, _>(&mut stream).await {
        Ok(request) => controller.handle(request).await,
        Err(ProtocolError::Io(e)) => return Err(ProtocolError::Io(e)),
        Err(e) => Response::Error {
            message: e.to_string(),
        },
    };
    write_message(&mut stream, &response).await
}
