use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use cascade_types::{SessionId, SessionRole};

use crate::error::{SessionError, SessionResult};
use crate::merge::{HeldEvent, MergeBus};
use crate::session::Session;

/// Outcome of saving one session into its backing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HopReport {
    /// Position in the cascade; 0 is the session the save started from.
    pub hop: usize,
    pub session: SessionId,
    pub role: SessionRole,
    /// Number of change records handed to the backing.
    pub saved: usize,
    /// Sequence of the hop's commit event, `None` for an empty save.
    pub sequence: Option<u64>,
}

/// Outcome of a cascading save that reached the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CascadeReport {
    pub hops: Vec<HopReport>,
}

impl CascadeReport {
    /// Total change records saved across all hops.
    pub fn total_saved(&self) -> usize {
        self.hops.iter().map(|h| h.saved).sum()
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }
}

/// Completion callback of an asynchronous cascade.
pub type CascadeCallback = Box<dyn FnOnce(SessionResult<CascadeReport>) + Send + 'static>;

/// Saves sessions hop by hop up their parent chain.
///
/// Each hop runs on the owning thread of the session being saved. Commit
/// events of a cascade are held until the last hop succeeds and are then
/// published in hop order; a cascade that fails withdraws them, so
/// subscribers never see changes that did not reach the store. The first
/// failing hop ends the cascade; earlier hops stay committed.
pub struct SaveCoordinator {
    bus: Arc<MergeBus>,
    max_depth: usize,
}

impl SaveCoordinator {
    pub fn new(bus: Arc<MergeBus>, max_depth: usize) -> Self {
        Self { bus, max_depth }
    }

    /// Save only `session`'s pending changes into its immediate backing
    /// and publish the commit event.
    pub fn save(&self, session: &Arc<Session>) -> SessionResult<HopReport> {
        let (report, held) = self.save_hop(0, session)?;
        if let Some(held) = held {
            held.release();
        }
        Ok(report)
    }

    fn save_hop(
        &self,
        hop: usize,
        session: &Arc<Session>,
    ) -> SessionResult<(HopReport, Option<HeldEvent>)> {
        let target = Arc::clone(session);
        let bus = Arc::clone(&self.bus);
        session
            .dispatcher()
            .perform_and_wait(move || run_hop(hop, &target, &bus))?
    }

    /// Save `session`, then each ancestor up to and including `store`.
    /// Blocks until the chain resolves.
    ///
    /// Any hop failure, including the first, is reported as
    /// [`SessionError::Propagation`].
    pub fn save_cascading(&self, session: &Arc<Session>) -> SessionResult<CascadeReport> {
        let chain = session.ancestry(self.max_depth)?;
        let mut hops = Vec::with_capacity(chain.len());
        let mut held = Vec::with_capacity(chain.len());
        for (hop, current) in chain.iter().enumerate() {
            match self.save_hop(hop, current) {
                Ok((report, event)) => {
                    hops.push(report);
                    held.extend(event);
                }
                // Dropping `held` withdraws the earlier hops' events.
                Err(source) => return Err(propagation(hop, current, source)),
            }
        }
        release_all(held);
        let report = CascadeReport { hops };
        info!(
            session = %session.id(),
            hops = report.hop_count(),
            saved = report.total_saved(),
            "cascading save complete"
        );
        Ok(report)
    }

    /// Non-blocking cascading save.
    ///
    /// Each hop is queued on its session's thread only after the previous
    /// hop finished. `on_complete` runs exactly once, on the thread of the
    /// last hop attempted, or on the caller's thread if the chain could not
    /// be resolved.
    pub fn save_cascading_async<F>(&self, session: &Arc<Session>, on_complete: F)
    where
        F: FnOnce(SessionResult<CascadeReport>) + Send + 'static,
    {
        let chain = match session.ancestry(self.max_depth) {
            Ok(chain) => chain,
            Err(err) => {
                on_complete(Err(err));
                return;
            }
        };
        debug!(session = %session.id(), hops = chain.len(), "async cascade started");
        CascadePipeline {
            chain,
            next: 0,
            hops: Vec::new(),
            held: Vec::new(),
            bus: Arc::clone(&self.bus),
            on_complete: Some(Box::new(on_complete)),
        }
        .schedule();
    }

    /// [`save_cascading_async`](Self::save_cascading_async) as a future.
    pub fn save_cascading_future(&self, session: &Arc<Session>) -> CascadeFuture {
        let (tx, rx) = oneshot::channel();
        self.save_cascading_async(session, move |result| {
            let _ = tx.send(result);
        });
        CascadeFuture { rx }
    }
}

impl std::fmt::Debug for SaveCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveCoordinator")
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

fn run_hop(
    hop: usize,
    session: &Session,
    bus: &Arc<MergeBus>,
) -> SessionResult<(HopReport, Option<HeldEvent>)> {
    let event = session.commit()?;
    let report = HopReport {
        hop,
        session: session.id(),
        role: session.role(),
        saved: event.as_ref().map_or(0, |e| e.len()),
        sequence: event.as_ref().map(|e| e.sequence),
    };
    debug!(hop, session = %report.session, role = %report.role, saved = report.saved, "hop saved");
    Ok((report, event.map(|e| bus.hold(e))))
}

fn release_all(held: Vec<HeldEvent>) {
    for event in held {
        event.release();
    }
}

fn propagation(hop: usize, session: &Session, source: SessionError) -> SessionError {
    warn!(
        hop,
        session = %session.id(),
        role = %session.role(),
        error = %source,
        "cascading save failed"
    );
    SessionError::Propagation {
        hop,
        session: session.id(),
        role: session.role(),
        committed: hop,
        source: Box::new(source),
    }
}

/// One asynchronous cascade in flight. It moves from thread to thread,
/// running one hop per stop.
struct CascadePipeline {
    chain: Vec<Arc<Session>>,
    next: usize,
    hops: Vec<HopReport>,
    held: Vec<HeldEvent>,
    bus: Arc<MergeBus>,
    on_complete: Option<CascadeCallback>,
}

impl CascadePipeline {
    fn schedule(mut self) {
        let Some(session) = self.chain.get(self.next).cloned() else {
            release_all(std::mem::take(&mut self.held));
            let hops = std::mem::take(&mut self.hops);
            self.complete(Ok(CascadeReport { hops }));
            return;
        };
        // On failure the job, and this pipeline with it, is dropped and
        // completes with `DispatcherClosed`.
        let _ = session.dispatcher().perform(move || self.step());
    }

    fn step(mut self) {
        let hop = self.next;
        let session = Arc::clone(&self.chain[hop]);
        match run_hop(hop, &session, &self.bus) {
            Ok((report, event)) => {
                self.hops.push(report);
                self.held.extend(event);
                self.next += 1;
                self.schedule();
            }
            Err(source) => {
                self.held.clear();
                self.complete(Err(propagation(hop, &session, source)));
            }
        }
    }

    fn complete(&mut self, result: SessionResult<CascadeReport>) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(result);
        }
    }
}

impl Drop for CascadePipeline {
    fn drop(&mut self) {
        if self.on_complete.is_none() {
            return;
        }
        let hop = self.next;
        let err = match self.chain.get(hop).cloned() {
            Some(session) => {
                let closed = SessionError::DispatcherClosed {
                    name: session.dispatcher().name().to_string(),
                };
                propagation(hop, &session, closed)
            }
            None => SessionError::DispatcherClosed {
                name: "cascade".into(),
            },
        };
        self.complete(Err(err));
    }
}

/// Resolves when an asynchronous cascade completes.
#[derive(Debug)]
pub struct CascadeFuture {
    rx: oneshot::Receiver<SessionResult<CascadeReport>>,
}

impl CascadeFuture {
    /// Block the calling thread until the cascade completes. Must not be
    /// called from inside an async runtime.
    pub fn wait(self) -> SessionResult<CascadeReport> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(cancelled()))
    }
}

impl Future for CascadeFuture {
    type Output = SessionResult<CascadeReport>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(cancelled())))
    }
}

fn cancelled() -> SessionError {
    SessionError::DispatcherClosed {
        name: "cascade".into(),
    }
}
