//! Serves the line protocol: job submission and status queries over TCP.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::DateTime;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::QueueError;
use crate::line_reader::LineReader;
use crate::parser::ParsingError;
use crate::store::{JobStore, ListFilter};
use crate::types::job::{EnqueueOptions, JobId, Payload};
use crate::types::protocol::{Command, JobList, Response};
use crate::types::serialisable::WireSerialisable;
use crate::util::bytes_to_human_str;

/// Most jobs a single `list` reply will carry.
pub const MAX_LIST_LIMIT: usize = 1000;

pub struct Server {
    store: Arc<JobStore>,
    max_job_size: u32,
}

impl Server {
    pub fn new(store: Arc<JobStore>, max_job_size: u32) -> Self {
        Self {
            store,
            max_job_size,
        }
    }

    /// Accepts connections until `cancel` fires, handling each one as its
    /// own task. Returns once every connection has closed.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(addr = %listener.local_addr()?, "listening");

        // Every connection holds a sender; recv() yields None once they're
        // all gone.
        let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

        loop {
            let conn = match select! {
                accept = listener.accept() => accept,
                _ = cancel.cancelled() => break,
            } {
                Ok((conn, _)) => conn,
                Err(error) => {
                    warn!(%error, "failed to accept connection");
                    continue;
                },
            };

            tokio::spawn(Arc::clone(&self).begin_handle(
                cancel.clone(),
                shutdown_hold.clone(),
                conn,
            ));
        }

        drop(shutdown_hold);
        shutdown_wait.recv().await;

        Ok(())
    }

    #[instrument(
        name = "handle",
        err,
        fields(peer = %conn.peer_addr()?),
        skip_all
    )]
    async fn begin_handle(
        self: Arc<Self>,
        cancel: CancellationToken,
        _shutdown_hold: mpsc::Sender<()>,
        mut conn: TcpStream,
    ) -> Result<()> {
        debug!("accepted connection");

        conn.set_nodelay(true).context("setting NODELAY")?;

        let ret = self.handle_conn(cancel, &mut conn).await;

        conn.shutdown().await.context("during shutdown")?;

        debug!("closed connection");

        ret
    }

    /// Reads commands off `conn` and answers them in order until the peer
    /// quits, hangs up or the server shuts down.
    pub async fn handle_conn<T>(
        &self,
        cancel: CancellationToken,
        conn: &mut T,
    ) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (r, mut w) = tokio::io::split(conn);
        let mut r: LineReader<_> = r.into();

        loop {
            let line = select!(
               x = r.read_line() => match x? {
                    Some(x) => x,
                    None => return Ok(()),
               },
               _ = cancel.cancelled() => return Ok(()),
            );

            trace!(line = bytes_to_human_str(&line), "processing command");

            let cmd: Result<Command, ParsingError> =
                (&line as &[u8]).try_into();

            let resp = match cmd {
                Ok(cmd) => {
                    let body = match cmd.body_len() {
                        Some(n) if n > self.max_job_size => {
                            let skipped = select! {
                                x = r.skip(n as usize + 2) => x?,
                                _ = cancel.cancelled() => return Ok(()),
                            };
                            if !skipped {
                                return Ok(());
                            }
                            Err(Response::JobTooBig)
                        },
                        Some(n) => match select! {
                            x = r.read_body(n as usize) => x?,
                            _ = cancel.cancelled() => return Ok(()),
                        } {
                            None => return Ok(()),
                            Some((body, true)) => Ok(Some(body)),
                            Some((_, false)) => Err(Response::ExpectedCRLF),
                        },
                        None => Ok(None),
                    };

                    let resp = match body {
                        Ok(body) => match self.apply(cmd, body).await {
                            Some(resp) => resp,
                            None => return Ok(()),
                        },
                        Err(resp) => resp,
                    };
                    resp.serialise_wire()
                },
                Err(error) => error.serialise_wire(),
            };

            select! {
                x = w.write_all(&resp) => x?,
                _ = cancel.cancelled() => return Ok(()),
            };

            // Flush once per reply so pipelined requests get pipelined
            // responses.
            select! {
                x = w.flush() => x?,
                _ = cancel.cancelled() => return Ok(()),
            };
        }
    }

    /// Carries out one command. None means the client asked to leave.
    async fn apply(
        &self,
        cmd: Command,
        body: Option<Bytes>,
    ) -> Option<Response> {
        use Command::*;

        let resp = match cmd {
            Enqueue {
                queue,
                job_type,
                delay,
                max_attempts,
                ..
            } => {
                let options = EnqueueOptions::default()
                    .wait(Duration::from_secs(delay.into()));
                self.enqueue(&queue, &job_type, body, options, max_attempts)
                    .await
            },
            EnqueueAt {
                queue,
                job_type,
                at,
                max_attempts,
                ..
            } => {
                let Some(at) = i64::try_from(at)
                    .ok()
                    .and_then(|at| DateTime::from_timestamp(at, 0))
                else {
                    return Some(Response::BadFormat);
                };
                let options = EnqueueOptions::default().wait_until(at);
                self.enqueue(&queue, &job_type, body, options, max_attempts)
                    .await
            },
            Status { id } => match self.store.status(JobId(id)).await {
                Ok(job) => Response::OkStatus { data: job.into() },
                Err(error) => error_response(error),
            },
            List {
                queue,
                state,
                after,
                limit,
            } => {
                let filter = ListFilter { queue, state };
                let after = (after > 0).then_some(JobId(after));
                let limit = (limit as usize).clamp(1, MAX_LIST_LIMIT);

                let page = self.store.list(&filter, after, limit).await;
                Response::OkList {
                    data: JobList {
                        jobs: page.jobs.into_iter().map(Into::into).collect(),
                        next: page.next,
                    },
                }
            },
            Kill { id } => match self.store.kill(JobId(id)).await {
                Ok(()) => Response::Killed,
                Err(error) => error_response(error),
            },
            Stats => Response::OkStats {
                data: self.store.stats().await,
            },
            Quit => return None,
        };

        Some(resp)
    }

    async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        body: Option<Bytes>,
        options: EnqueueOptions,
        max_attempts: u32,
    ) -> Response {
        let payload: Payload = match body.map(|b| serde_json::from_slice(&b)) {
            Some(Ok(payload)) => payload,
            _ => return Response::BadFormat,
        };

        let options = match max_attempts {
            0 => options,
            n => options.max_attempts(n),
        };

        match self.store.submit(queue, job_type, payload, options).await {
            Ok(id) => Response::Inserted { id },
            Err(error) => error_response(error),
        }
    }
}

fn error_response(error: QueueError) -> Response {
    match error {
        QueueError::NotFound(_) => Response::NotFound,
        QueueError::NotKillable { .. } => Response::NotKillable,
        QueueError::InvalidName(_) => Response::BadFormat,
        error => {
            error!(%error, "store failure");
            Response::InternalError
        },
    }
}
