//! Accept loop: bind, race accept against shutdown, admission-control the
//! result, and hand each connection to its own task.
//!
//! Grounded on the teacher's `httproxy::start::handle_local_target` /
//! `accept_or_shutdown` for the accept-or-shutdown race and per-connection
//! `inflight_guard` spawn shape, and on
//! `segmentedproxy.server.ThreadedTCPServer` for the bounded-admission
//! behavior (`BoundedSemaphore.acquire(blocking=False)` -> reject and close
//! rather than queue).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use smol::future;
use smol::net::{TcpListener, TcpStream};

use crate::config::Settings;
use crate::dns::Resolver;
use crate::handler::handle_connection;
use crate::init::GracefulShutdown;
use crate::segmentation::SegmentationEngine;

/// Non-blocking admission control bounding the number of connections being
/// actively served. `try_acquire` never waits; callers reject the
/// connection on `None` rather than queuing it, matching a Python
/// `BoundedSemaphore.acquire(blocking=False)`.
struct AdmissionControl {
    limit: usize,
    inflight: AtomicUsize,
}

struct AdmissionPermit {
    control: Arc<AdmissionControl>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.control.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AdmissionControl {
    fn new(limit: usize) -> Self {
        Self { limit, inflight: AtomicUsize::new(0) }
    }

    fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let mut current = self.inflight.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return None;
            }
            match self.inflight.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(AdmissionPermit { control: self.clone() }),
                Err(observed) => current = observed,
            }
        }
    }
}

pub async fn run(settings: Arc<Settings>, resolver: Arc<dyn Resolver>, engine: Arc<SegmentationEngine>, shutdown: GracefulShutdown) -> anyhow::Result<()> {
    let bind_addr = settings.listen_addr().map_err(anyhow::Error::msg)?;
    let listener = TcpListener::bind(bind_addr).await?;
    log::info!("segproxy listening on {bind_addr}");

    let admission = Arc::new(AdmissionControl::new(settings.max_connections));

    loop {
        let Some((stream, peer)) = accept_or_shutdown(&listener, &shutdown).await? else {
            break;
        };

        let Some(permit) = admission.try_acquire() else {
            log::warn!("too many connections; rejecting {peer}");
            drop(stream);
            continue;
        };

        let settings = settings.clone();
        let resolver = resolver.clone();
        let engine = engine.clone();
        let guard = shutdown.inflight_guard();

        smol::spawn(async move {
            handle_connection(stream, peer, &settings, resolver.as_ref(), &engine).await;
            drop(permit);
            drop(guard);
        })
        .detach();
    }

    log::info!("no longer accepting new connections; draining in-flight work");
    shutdown.wait_inflight_zero().await;
    Ok(())
}

async fn accept_or_shutdown(listener: &TcpListener, shutdown: &GracefulShutdown) -> std::io::Result<Option<(TcpStream, SocketAddr)>> {
    let accept_fut = async { listener.accept().await.map(Some) };
    let shutdown_fut = async {
        shutdown.wait_shutting_down().await;
        Ok(None)
    };
    future::or(accept_fut, shutdown_fut).await
}
