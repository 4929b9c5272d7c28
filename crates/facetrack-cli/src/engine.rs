use facetrack_core::{
    Embedding, ExtractionError, MatchSession, ProbeOutcome, ScanReport, SessionError,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum ScannerError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to spawn scanner thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("scanner thread exited")]
    ChannelClosed,
}

/// Messages sent from capture producers to the scanner thread.
enum ScanRequest {
    Capture {
        capture: Result<Embedding, ExtractionError>,
        reply: oneshot::Sender<Result<ProbeOutcome, SessionError>>,
    },
    Close {
        reply: oneshot::Sender<Result<ScanReport, SessionError>>,
    },
}

/// Clone-safe handle to the scanner thread.
#[derive(Clone)]
pub struct ScannerHandle {
    tx: mpsc::Sender<ScanRequest>,
}

impl ScannerHandle {
    /// Submit one extractor result and wait for its outcome.
    pub async fn submit(
        &self,
        capture: Result<Embedding, ExtractionError>,
    ) -> Result<ProbeOutcome, ScannerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ScanRequest::Capture {
                capture,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ScannerError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| ScannerError::ChannelClosed)??)
    }

    /// Close the session once every capture queued before it has been matched.
    pub async fn close(&self) -> Result<ScanReport, ScannerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ScanRequest::Close { reply: reply_tx })
            .await
            .map_err(|_| ScannerError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| ScannerError::ChannelClosed)??)
    }
}

/// Move an active session onto a dedicated OS thread.
///
/// Requests are handled strictly in arrival order, one at a time, so the
/// session's accumulator is never touched concurrently. The thread exits
/// when every handle has been dropped.
pub fn spawn_scanner(mut session: MatchSession) -> Result<ScannerHandle, ScannerError> {
    let (tx, mut rx) = mpsc::channel::<ScanRequest>(4);

    std::thread::Builder::new()
        .name("facetrack-scanner".into())
        .spawn(move || {
            tracing::info!("scanner thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    ScanRequest::Capture { capture, reply } => {
                        let _ = reply.send(session.submit_capture(capture));
                    }
                    ScanRequest::Close { reply } => {
                        let _ = reply.send(session.close());
                    }
                }
            }
            tracing::info!("scanner thread exiting");
        })?;

    Ok(ScannerHandle { tx })
}
