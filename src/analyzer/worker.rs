use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::debug;
use uuid::Uuid;

use super::{AnalyzerError, FileDescriptor, UploadOptions, UploadPlan, analyze};

#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub correlation_id: Uuid,
    pub files: Vec<FileDescriptor>,
    pub options: UploadOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzerMessage {
    Progress { correlation_id: Uuid, fraction: f64 },
    Completed { correlation_id: Uuid, plan: UploadPlan },
}

struct Envelope {
    request: AnalyzeRequest,
    reply: mpsc::UnboundedSender<AnalyzerMessage>,
}

/// Receiving end for one submission.
///
/// Yields progress in order, then the plan. If the worker stops first the
/// channel closes and no plan is delivered.
pub struct AnalysisTicket {
    correlation_id: Uuid,
    rx: mpsc::UnboundedReceiver<AnalyzerMessage>,
}

impl AnalysisTicket {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub async fn recv(&mut self) -> Option<AnalyzerMessage> {
        loop {
            let msg = self.rx.recv().await?;
            let id = match &msg {
                AnalyzerMessage::Progress { correlation_id, .. }
                | AnalyzerMessage::Completed { correlation_id, .. } => *correlation_id,
            };
            if id == self.correlation_id {
                return Some(msg);
            }
        }
    }

    /// Waits for the plan, forwarding each progress fraction to `on_progress`.
    pub async fn wait_with<F: FnMut(f64)>(mut self, mut on_progress: F) -> Option<UploadPlan> {
        while let Some(msg) = self.recv().await {
            match msg {
                AnalyzerMessage::Progress { fraction, .. } => on_progress(fraction),
                AnalyzerMessage::Completed { plan, .. } => return Some(plan),
            }
        }
        None
    }

    pub async fn wait(self) -> Option<UploadPlan> {
        self.wait_with(|_| {}).await
    }
}

/// Owns a background task that analyzes one submission at a time.
///
/// A stopped task is respawned by the next [`Self::submit`] or [`Self::retry`].
pub struct AnalyzerWorker {
    req_tx: mpsc::Sender<Envelope>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    last: Option<(Vec<FileDescriptor>, UploadOptions)>,
}

impl AnalyzerWorker {
    /// Spawns the worker; must be called inside a tokio runtime.
    pub fn spawn() -> Self {
        let (req_tx, stop_tx, task) = start_loop();
        Self {
            req_tx,
            stop_tx,
            task: Some(task),
            last: None,
        }
    }

    pub async fn submit(
        &mut self,
        files: Vec<FileDescriptor>,
        options: UploadOptions,
    ) -> Result<AnalysisTicket, AnalyzerError> {
        self.last = Some((files.clone(), options.clone()));
        self.dispatch(files, options).await
    }

    /// Re-runs the last submitted file set and options, even after [`Self::stop`].
    pub async fn retry(&mut self) -> Result<AnalysisTicket, AnalyzerError> {
        let (files, options) = self.last.clone().ok_or(AnalyzerError::NothingToRetry)?;
        self.dispatch(files, options).await
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Abandons in-flight work and waits for the task to exit.
    ///
    /// The last submission is kept for [`Self::retry`].
    pub async fn stop(&mut self) {
        self.stop_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub async fn shutdown(mut self) {
        self.stop().await;
    }

    async fn dispatch(
        &mut self,
        files: Vec<FileDescriptor>,
        options: UploadOptions,
    ) -> Result<AnalysisTicket, AnalyzerError> {
        if !self.is_running() {
            debug!("restarting analyzer worker");
            let (req_tx, stop_tx, task) = start_loop();
            self.req_tx = req_tx;
            self.stop_tx = stop_tx;
            self.task = Some(task);
        }

        let correlation_id = Uuid::new_v4();
        let (reply, rx) = mpsc::unbounded_channel();
        let request = AnalyzeRequest {
            correlation_id,
            files,
            options,
        };
        self.req_tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| AnalyzerError::WorkerStopped)?;
        Ok(AnalysisTicket { correlation_id, rx })
    }
}

impl Drop for AnalyzerWorker {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

fn start_loop() -> (mpsc::Sender<Envelope>, watch::Sender<bool>, JoinHandle<()>) {
    let (req_tx, req_rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(worker_loop(req_rx, stop_rx));
    (req_tx, stop_tx, task)
}

async fn worker_loop(mut req_rx: mpsc::Receiver<Envelope>, mut stop_rx: watch::Receiver<bool>) {
    loop {
        let envelope = tokio::select! {
            next = req_rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
            _ = stopped(&mut stop_rx) => break,
        };

        let Envelope { request, reply } = envelope;
        let id = request.correlation_id;
        let progress_tx = reply.clone();
        let work = analyze(&request.files, &request.options, move |fraction| {
            let _ = progress_tx.send(AnalyzerMessage::Progress {
                correlation_id: id,
                fraction,
            });
        });

        tokio::select! {
            plan = work => {
                debug!(correlation_id = %id, items = plan.items.len(), "analysis completed");
                let _ = reply.send(AnalyzerMessage::Completed { correlation_id: id, plan });
            }
            _ = stopped(&mut stop_rx) => {
                debug!(correlation_id = %id, "analysis abandoned");
                break;
            }
        }
    }
}

async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}
