//! Bounded admission queue feeding a fixed set of workers
//!
//! Enqueue never waits: a full queue rejects the request at once. The caller
//! then waits on the task's completion signal for the response. A worker
//! stays busy until its processor returns, which for a tunnel is after the
//! response was delivered.

use std::sync::Arc;

use async_trait::async_trait;
use hyper::{Request, Response};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::proxy::handler::ProxyBody;

/// Executes one admitted request to completion.
///
/// The processor must answer through `responder` exactly once. It may keep
/// working afterwards; the worker is held until `process` returns.
#[async_trait]
pub trait RequestProcessor<B: Send + 'static>: Send + Sync + 'static {
    async fn process(&self, request: Request<B>, responder: Responder);
}

/// Delivers a task's response to its waiting submitter
pub struct Responder {
    done: oneshot::Sender<Response<ProxyBody>>,
}

impl Responder {
    /// A responder and the receiver its submitter waits on
    pub fn channel() -> (Self, oneshot::Receiver<Response<ProxyBody>>) {
        let (done, response) = oneshot::channel();
        (Self { done }, response)
    }

    pub fn send(self, response: Response<ProxyBody>) {
        if self.done.send(response).is_err() {
            debug!("Submitter went away before the response was ready");
        }
    }
}

/// An admitted request and the responder its submitter waits on
pub struct RequestTask<B> {
    pub request: Request<B>,
    pub responder: Responder,
}

/// Fixed pool of workers behind a bounded queue
pub struct WorkerPool<B> {
    sender: mpsc::Sender<RequestTask<B>>,
    workers: usize,
}

impl<B: Send + 'static> WorkerPool<B> {
    /// Spawn `workers` workers sharing a queue of `capacity` slots
    pub fn start<P>(processor: Arc<P>, workers: usize, capacity: usize) -> Self
    where
        P: RequestProcessor<B>,
    {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        for id in 0..workers {
            tokio::spawn(run_worker(id, receiver.clone(), processor.clone()));
        }

        info!(workers, capacity = capacity.max(1), "Worker pool started");

        Self { sender, workers }
    }

    /// Queue a request without waiting.
    ///
    /// Returns the receiver for its response, or `QueueFull` when every slot
    /// is taken.
    pub fn submit(&self, request: Request<B>) -> Result<oneshot::Receiver<Response<ProxyBody>>> {
        let (responder, response) = Responder::channel();

        match self.sender.try_send(RequestTask { request, responder }) {
            Ok(()) => Ok(response),
            Err(mpsc::error::TrySendError::Full(_)) => Err(GatewayError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(GatewayError::Internal("worker pool stopped".to_string()))
            }
        }
    }

    /// Tasks waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

async fn run_worker<B, P>(
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<RequestTask<B>>>>,
    processor: Arc<P>,
) where
    B: Send + 'static,
    P: RequestProcessor<B>,
{
    loop {
        let task = receiver.lock().await.recv().await;
        let Some(task) = task else {
            break;
        };

        processor.process(task.request, task.responder).await;
    }

    debug!(worker = id, "Worker stopped");
}
