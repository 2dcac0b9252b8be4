//! Control-point facade (C6): a cheap, cloneable handle the HTTP layer holds.
//! It never touches the device table - every call is a round trip over the
//! manager actor's command channel.

use tokio::sync::{mpsc, oneshot};

use crate::config::KasaDocument;
use crate::error::ManagerError;
use crate::manager::{Command, Status};

#[derive(Clone)]
pub struct Handle {
    commands: mpsc::Sender<Command>,
}

/// Raised when the manager actor has shut down and can no longer be reached.
#[derive(Debug, thiserror::Error)]
#[error("device manager is no longer running")]
pub struct ManagerGone;

impl Handle {
    pub fn new(commands: mpsc::Sender<Command>) -> Self {
        Self { commands }
    }

    pub async fn status(&self) -> Result<Status, ManagerGone> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Status { reply })
            .await
            .map_err(|_| ManagerGone)?;
        rx.await.map_err(|_| ManagerGone)
    }

    pub async fn set(
        &self,
        point: &str,
        state: bool,
        pulse: i64,
        cause: &str,
    ) -> Result<Result<Status, ManagerError>, ManagerGone> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Set {
                point: point.to_string(),
                state,
                pulse,
                cause: cause.to_string(),
                reply,
            })
            .await
            .map_err(|_| ManagerGone)?;
        rx.await.map_err(|_| ManagerGone)
    }

    pub async fn get_config(&self) -> Result<KasaDocument, ManagerGone> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::GetConfig { reply })
            .await
            .map_err(|_| ManagerGone)?;
        rx.await.map_err(|_| ManagerGone)
    }

    pub async fn set_config(&self, document: KasaDocument) -> Result<(), ManagerGone> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SetConfig { document, reply })
            .await
            .map_err(|_| ManagerGone)?;
        rx.await.map_err(|_| ManagerGone)
    }
}
