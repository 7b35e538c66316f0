//! Control server: answers IPC requests against a running scheduler

use std::sync::Arc;

use eyre::Result;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::daemon::VERSION;
use crate::ipc::{DaemonMessage, DaemonResponse, read_message, send_response};
use crate::scheduler::Scheduler;
use crate::service::JobService;

pub struct ControlServer {
    scheduler: Arc<Scheduler>,
    service: JobService,
    shutdown: CancellationToken,
}

impl ControlServer {
    /// `shutdown` is cancelled when a client asks the daemon to stop
    pub fn new(scheduler: Arc<Scheduler>, shutdown: CancellationToken) -> Self {
        let service = JobService::new(scheduler.store());
        Self {
            scheduler,
            service,
            shutdown,
        }
    }

    /// Produce the response for one request
    pub async fn handle(&self, msg: DaemonMessage) -> DaemonResponse {
        debug!(?msg, "ControlServer::handle: called");
        match msg {
            DaemonMessage::SubmitJob { name, score } => match self.service.submit(&name, score).await {
                Ok(id) => DaemonResponse::Submitted { id },
                Err(e) => DaemonResponse::Error { message: e.to_string() },
            },
            DaemonMessage::JobStatus { id } => match self.service.status(&id).await {
                Ok(job) => DaemonResponse::Status { job },
                Err(e) => DaemonResponse::Error { message: e.to_string() },
            },
            DaemonMessage::Pause => {
                self.scheduler.pause();
                DaemonResponse::Ok
            }
            DaemonMessage::Resume => {
                self.scheduler.unpause();
                DaemonResponse::Ok
            }
            DaemonMessage::ResetWindow => {
                self.scheduler.reset_window().await;
                DaemonResponse::Ok
            }
            DaemonMessage::Stats => DaemonResponse::Stats {
                stats: self.scheduler.stats().await,
            },
            DaemonMessage::Ping => DaemonResponse::Pong {
                version: VERSION.to_string(),
            },
            DaemonMessage::Shutdown => {
                info!("Shutdown requested over IPC");
                self.shutdown.cancel();
                DaemonResponse::Ok
            }
        }
    }

    async fn handle_connection(&self, stream: &mut UnixStream) -> Result<()> {
        let response = match read_message(stream).await {
            Ok(msg) => self.handle(msg).await,
            Err(e) => DaemonResponse::Error {
                message: format!("{:#}", e),
            },
        };
        send_response(stream, response).await
    }

    /// Accept connections until shutdown is requested
    pub async fn run(self: Arc<Self>, listener: UnixListener) {
        debug!("ControlServer::run: called");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((mut stream, _)) => {
                            debug!("ControlServer::run: connection accepted");
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(&mut stream).await {
                                    warn!(error = %e, "IPC connection error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "IPC accept error");
                        }
                    }
                }
            }
        }
        debug!("ControlServer::run: exiting");
    }
}
