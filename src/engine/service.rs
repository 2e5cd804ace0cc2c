//! Async front end for [`LLMEngine`].
//!
//! A background tokio task drives ticks on the blocking pool and routes each
//! [`StepOutput`] to the channel of the request it belongs to. Callers submit
//! from any task and stream tokens from the returned receiver; dropping the
//! receiver aborts the request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::executor::ModelExecutor;
use super::llm::{GenerationRequest, LLMEngine, StepOutput};
use crate::core::sequence::RequestId;
use crate::error::{Error, Result};

type Routes = Arc<Mutex<HashMap<RequestId, UnboundedSender<StepOutput>>>>;

fn lock_routes(routes: &Routes) -> MutexGuard<'_, HashMap<RequestId, UnboundedSender<StepOutput>>> {
    routes.lock().expect("route table lock poisoned")
}

/// Engine running on a background task.
pub struct EngineService<M: ModelExecutor + 'static> {
    engine: Arc<LLMEngine<M>>,
    routes: Routes,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<M: ModelExecutor + 'static> EngineService<M> {
    /// Spawn the engine loop. Must be called from within a tokio runtime.
    pub fn start(engine: LLMEngine<M>) -> Self {
        let engine = Arc::new(engine);
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(run_loop(
            Arc::clone(&engine),
            Arc::clone(&routes),
            Arc::clone(&shutdown),
        ));
        info!("engine service started");

        Self {
            engine,
            routes,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// The wrapped engine, for introspection.
    pub fn engine(&self) -> &Arc<LLMEngine<M>> {
        &self.engine
    }

    /// Submit a request and get a stream of its outputs.
    ///
    /// The stream ends after the output with `finished == true`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown), or
    /// the engine's admission error for an invalid request.
    pub fn submit(
        &self,
        request: GenerationRequest,
    ) -> Result<(RequestId, UnboundedReceiver<StepOutput>)> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        // Hold the route table across admission so the first token cannot be
        // dispatched before the route exists.
        let mut routes = lock_routes(&self.routes);
        let request_id = self.engine.add_request(request)?;
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(request_id, tx);
        Ok((request_id, rx))
    }

    /// Cancel a waiting or running request.
    ///
    /// Its stream receives a final output with reason `Aborted`.
    pub fn cancel(&self, request_id: RequestId) -> Result<()> {
        let output = self.engine.abort_request(request_id)?;
        if let Some(tx) = lock_routes(&self.routes).remove(&request_id) {
            let _ = tx.send(output);
        }
        Ok(())
    }

    /// Stop the loop and abort every request still in flight.
    ///
    /// Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let handle = self
            .handle
            .lock()
            .expect("service handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("engine loop terminated abnormally: {e}");
            }
        }

        abort_all(&self.engine, &self.routes);
        info!("engine service stopped");
    }
}

impl<M: ModelExecutor + 'static> Drop for EngineService<M> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
    }
}

async fn run_loop<M: ModelExecutor + 'static>(
    engine: Arc<LLMEngine<M>>,
    routes: Routes,
    shutdown: Arc<AtomicBool>,
) {
    let idle_backoff = Duration::from_millis(engine.config().idle_backoff_ms);

    while !shutdown.load(Ordering::Acquire) {
        if !engine.has_pending_requests() {
            tokio::time::sleep(idle_backoff).await;
            continue;
        }

        let ticking = Arc::clone(&engine);
        let result = match tokio::task::spawn_blocking(move || ticking.step()).await {
            Ok(result) => result,
            Err(e) => Err(Error::Model(format!("engine step panicked: {e}"))),
        };

        match result {
            Ok(outputs) => dispatch(&engine, &routes, outputs),
            Err(e) => {
                error!("engine step failed, aborting in-flight requests: {e}");
                abort_all(&engine, &routes);
            }
        }

        tokio::task::yield_now().await;
    }
}

/// Send outputs to their streams. Requests whose receiver is gone are aborted.
fn dispatch<M: ModelExecutor>(engine: &LLMEngine<M>, routes: &Routes, outputs: Vec<StepOutput>) {
    let mut orphaned = Vec::new();
    {
        let mut routes = lock_routes(routes);
        for output in outputs {
            let request_id = output.request_id;
            let finished = output.finished;
            let sent = match routes.get(&request_id) {
                Some(tx) => tx.send(output).is_ok(),
                None => false,
            };
            if finished {
                routes.remove(&request_id);
            } else if !sent {
                routes.remove(&request_id);
                orphaned.push(request_id);
            }
        }
    }

    for request_id in orphaned {
        debug!(request_id, "receiver dropped, aborting request");
        let _ = engine.abort_request(request_id);
    }
}

fn abort_all<M: ModelExecutor>(engine: &LLMEngine<M>, routes: &Routes) {
    let drained: Vec<_> = lock_routes(routes).drain().collect();
    for (request_id, tx) in drained {
        if let Ok(output) = engine.abort_request(request_id) {
            let _ = tx.send(output);
        }
    }
}
