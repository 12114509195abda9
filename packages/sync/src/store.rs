//! The live incident sync store.
//!
//! Owns the authoritative in-memory incident list, the WebSocket
//! connection lifecycle, and the REST bootstrap fetch. One supervision
//! task per store drives everything: bootstrap, connect, pump frames,
//! reconnect with exponential backoff, and give up once the attempt
//! budget is spent. Consumers read cloned snapshots and watch the
//! [`ConnectionState`] channel.
//!
//! Failure containment, in order of severity:
//! - a failed bootstrap fetch is recorded and the live connection
//!   proceeds anyway;
//! - a malformed frame is logged and dropped, the connection stays up;
//! - a dropped connection reconnects with capped exponential backoff;
//!   exhausted attempts leave the store `Disconnected` until the caller
//!   intervenes.

use std::sync::{Arc, RwLock};

use futures::StreamExt;
use green_sentinel_api::{ApiError, IncidentApi};
use green_sentinel_config::ClientConfig;
use green_sentinel_incident_models::{ConnectionState, Incident, IncidentState, StreamEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::feed::IncidentFeed;

/// Handle to a running sync store.
///
/// Constructed per consumer with [`IncidentSyncStore::start`]; there is
/// no process-wide instance. At most one live connection exists per
/// store. Dropping the handle aborts the supervision task, so the
/// socket is released on every exit path; [`IncidentSyncStore::shutdown`]
/// is the graceful variant.
pub struct IncidentSyncStore {
    config: ClientConfig,
    api: Arc<IncidentApi>,
    feed: Arc<RwLock<IncidentFeed>>,
    last_error: Arc<RwLock<Option<String>>>,
    status_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl IncidentSyncStore {
    /// Starts a store: sets status `Connecting`, then bootstraps from
    /// the REST API and opens the live connection on a background task.
    #[must_use]
    pub fn start(config: ClientConfig, api: IncidentApi) -> Self {
        let api = Arc::new(api);
        let feed = Arc::new(RwLock::new(IncidentFeed::new(config.max_incidents)));
        let last_error = Arc::new(RwLock::new(None));
        let (status_tx, status_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            api: Arc::clone(&api),
            config: config.clone(),
            feed: Arc::clone(&feed),
            last_error: Arc::clone(&last_error),
            status: status_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run());

        Self {
            config,
            api,
            feed,
            last_error,
            status_rx,
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Snapshot of the current incidents, newest first, length bounded
    /// by the configured maximum.
    #[must_use]
    pub fn incidents(&self) -> Vec<Incident> {
        self.feed.read().expect("feed lock poisoned").snapshot()
    }

    /// Current connection state.
    #[must_use]
    pub fn status(&self) -> ConnectionState {
        *self.status_rx.borrow()
    }

    /// A watch receiver that observes connection state changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.status_rx.clone()
    }

    /// The most recent bootstrap or connection error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().expect("error lock poisoned").clone()
    }

    /// Optimistic local state change, applied immediately without
    /// waiting for server confirmation. Races with inbound stream
    /// frames by arrival order; the last write wins.
    pub fn update_local_state(&self, id: i64, state: IncidentState) {
        self.feed
            .write()
            .expect("feed lock poisoned")
            .set_state(id, state);
    }

    /// Requests a state transition: applies the change optimistically,
    /// then issues the `PATCH`. If the request fails, the authoritative
    /// record is refetched and re-applied so the optimistic write does
    /// not linger.
    ///
    /// # Errors
    ///
    /// Returns the original [`ApiError`] from the `PATCH`; the rollback
    /// refetch is best-effort and only logged.
    pub async fn transition_state(&self, id: i64, state: IncidentState) -> Result<(), ApiError> {
        self.update_local_state(id, state);
        match self.api.update_state(id, state).await {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!("State transition for incident {id} failed: {err}; refetching");
                match self.api.get_incident(id).await {
                    Ok(authoritative) => {
                        self.feed
                            .write()
                            .expect("feed lock poisoned")
                            .apply(StreamEvent::Updated(authoritative));
                    }
                    Err(refetch_err) => {
                        log::warn!("Could not refetch incident {id}: {refetch_err}");
                    }
                }
                Err(err)
            }
        }
    }

    /// Manually repeats the bootstrap fetch, replacing the feed
    /// contents. The recovery path for a failed bootstrap.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the fetch fails; the previous feed
    /// contents are kept in that case.
    pub async fn refetch(&self) -> Result<(), ApiError> {
        match self
            .api
            .list_incidents(self.config.state_filter, self.config.max_incidents)
            .await
        {
            Ok(page) => {
                self.feed
                    .write()
                    .expect("feed lock poisoned")
                    .bootstrap(page.incidents);
                self.last_error.write().expect("error lock poisoned").take();
                Ok(())
            }
            Err(err) => {
                *self.last_error.write().expect("error lock poisoned") =
                    Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Gracefully tears the store down: closes the live connection,
    /// cancels any pending reconnect, and waits for the supervision
    /// task to finish. In-flight fetch results are discarded.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for IncidentSyncStore {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// How a connection session ended.
enum SessionEnd {
    /// Teardown was requested; stop without reconnecting.
    Shutdown,
    /// The connection was established and then lost; the attempt
    /// counter resets before the next backoff.
    Dropped,
    /// The connection never opened.
    Failed,
}

/// One select round of the frame pump.
enum PumpStep {
    Shutdown,
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

/// State owned by the supervision task.
struct Worker {
    api: Arc<IncidentApi>,
    config: ClientConfig,
    feed: Arc<RwLock<IncidentFeed>>,
    last_error: Arc<RwLock<Option<String>>>,
    status: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(self) {
        self.bootstrap().await;

        let policy = self.config.reconnect;
        let mut attempt: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.status.send_replace(ConnectionState::Connecting);
            match self.connect_and_pump().await {
                SessionEnd::Shutdown => break,
                SessionEnd::Dropped => attempt = 0,
                SessionEnd::Failed => {}
            }
            self.status.send_replace(ConnectionState::Disconnected);

            if attempt >= policy.max_attempts {
                log::error!(
                    "Live connection lost and {attempt} reconnect attempts exhausted; giving up"
                );
                self.record_error("live connection lost; reconnect attempts exhausted");
                return;
            }
            let delay = policy.delay_for(attempt);
            attempt += 1;
            log::info!(
                "Reconnecting in {delay:?} (attempt {attempt}/{})",
                policy.max_attempts
            );
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
        self.status.send_replace(ConnectionState::Closed);
    }

    /// Initial REST fetch. A failure here is recorded but never blocks
    /// the live connection; teardown during the fetch discards the
    /// in-flight result.
    async fn bootstrap(&self) {
        let mut shutdown = self.shutdown.clone();
        let fetch = self
            .api
            .list_incidents(self.config.state_filter, self.config.max_incidents);
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => {
                log::debug!("Shutdown during bootstrap; discarding in-flight result");
            }
            result = fetch => match result {
                Ok(page) => {
                    log::info!(
                        "Bootstrapped {} incidents ({} total server-side)",
                        page.incidents.len(),
                        page.total
                    );
                    self.feed
                        .write()
                        .expect("feed lock poisoned")
                        .bootstrap(page.incidents);
                    self.last_error.write().expect("error lock poisoned").take();
                }
                Err(err) => {
                    log::warn!("Bootstrap fetch failed: {err}; continuing to the live stream");
                    self.record_error(&err.to_string());
                }
            }
        }
    }

    /// Opens one connection and pumps frames until it ends.
    async fn connect_and_pump(&self) -> SessionEnd {
        let url = self.config.ws_url();
        log::debug!("Connecting to {url}");
        let mut shutdown = self.shutdown.clone();

        let connected = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return SessionEnd::Shutdown,
            result = connect_async(url.as_str()) => result,
        };
        let mut stream = match connected {
            Ok((stream, _response)) => stream,
            Err(err) => {
                log::warn!("Live connection to {url} failed: {err}");
                self.record_error(&err.to_string());
                return SessionEnd::Failed;
            }
        };

        log::info!("Live connection established");
        self.status.send_replace(ConnectionState::Connected);

        loop {
            let step = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => PumpStep::Shutdown,
                frame = stream.next() => PumpStep::Frame(frame),
            };
            match step {
                PumpStep::Shutdown => {
                    if let Err(err) = stream.close(None).await {
                        log::debug!("Error closing live connection: {err}");
                    }
                    return SessionEnd::Shutdown;
                }
                PumpStep::Frame(Some(Ok(Message::Text(text)))) => self.apply_frame(text.as_str()),
                PumpStep::Frame(Some(Ok(Message::Close(_))) | None) => {
                    log::info!("Live connection closed by server");
                    return SessionEnd::Dropped;
                }
                PumpStep::Frame(Some(Err(err))) => {
                    log::warn!("Live connection error: {err}");
                    self.record_error(&err.to_string());
                    return SessionEnd::Dropped;
                }
                // ping/pong/binary frames carry nothing for us
                PumpStep::Frame(Some(Ok(_))) => {}
            }
        }
    }

    /// Applies one text frame to the feed. Malformed frames are dropped
    /// per-message and never touch connection state.
    fn apply_frame(&self, text: &str) {
        match StreamEvent::parse_frame(text) {
            Ok(event) => {
                log::debug!("Applying stream event for incident {}", event.id());
                self.feed.write().expect("feed lock poisoned").apply(event);
            }
            Err(err) => log::warn!("Dropping malformed frame: {err}"),
        }
    }

    fn record_error(&self, message: &str) {
        *self.last_error.write().expect("error lock poisoned") = Some(message.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::time::Duration;

    use futures::SinkExt;
    use green_sentinel_config::ReconnectPolicy;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::WebSocketStream;

    /// Loopback stand-in for the backend: the first connection is
    /// answered as the HTTP bootstrap fetch, every later connection is
    /// accepted as a WebSocket client and handed to the test.
    struct TestBackend {
        addr: SocketAddr,
        ws_rx: mpsc::Receiver<WebSocketStream<TcpStream>>,
    }

    async fn spawn_backend(
        bootstrap_status: u16,
        bootstrap_body: &'static str,
        accept_ws: bool,
    ) -> TestBackend {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (ws_tx, ws_rx) = mpsc::channel(8);

        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                respond_http(socket, bootstrap_status, bootstrap_body).await;
            }
            while let Ok((socket, _)) = listener.accept().await {
                if !accept_ws {
                    drop(socket);
                    continue;
                }
                match tokio_tungstenite::accept_async(socket).await {
                    Ok(ws) => {
                        if ws_tx.send(ws).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => log::debug!("Test handshake failed: {err}"),
                }
            }
        });

        TestBackend { addr, ws_rx }
    }

    async fn respond_http(mut socket: TcpStream, status: u16, body: &str) {
        let mut buf = [0u8; 2048];
        let _ = socket.read(&mut buf).await;
        let reason = match status {
            200 => "OK",
            404 => "Not Found",
            _ => "Status",
        };
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\n\
             content-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;
    }

    fn test_config(addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            api_host: addr.to_string(),
            state_filter: None,
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
                max_attempts: 5,
            },
            ..ClientConfig::default()
        }
    }

    fn start_store(config: &ClientConfig) -> IncidentSyncStore {
        IncidentSyncStore::start(config.clone(), IncidentApi::from_config(config))
    }

    async fn wait_for_status(store: &IncidentSyncStore, want: ConnectionState) {
        let mut rx = store.watch_status();
        timeout(Duration::from_secs(5), rx.wait_for(|status| *status == want))
            .await
            .expect("timed out waiting for connection state")
            .expect("status channel closed");
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn bootstraps_then_applies_stream_frames() {
        let mut backend =
            spawn_backend(200, r#"[{"id": 1, "confidence": 0.9}]"#, true).await;
        let config = test_config(backend.addr);
        let store = start_store(&config);

        let mut ws = timeout(Duration::from_secs(5), backend.ws_rx.recv())
            .await
            .unwrap()
            .unwrap();
        wait_for_status(&store, ConnectionState::Connected).await;
        assert_eq!(store.incidents().len(), 1);

        ws.send(Message::text(r#"{"id": 2, "confidence": 0.7}"#))
            .await
            .unwrap();
        ws.send(Message::text(
            r#"{"type": "update", "payload": {"id": 1, "state": "finished"}}"#,
        ))
        .await
        .unwrap();

        wait_until(|| {
            let incidents = store.incidents();
            incidents.len() == 2
                && incidents[0].id == 2
                && incidents[1].state == IncidentState::Finished
        })
        .await;

        store.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_without_killing_the_connection() {
        let mut backend = spawn_backend(200, "[]", true).await;
        let config = test_config(backend.addr);
        let store = start_store(&config);

        let mut ws = timeout(Duration::from_secs(5), backend.ws_rx.recv())
            .await
            .unwrap()
            .unwrap();
        wait_for_status(&store, ConnectionState::Connected).await;

        ws.send(Message::text("definitely not json")).await.unwrap();
        ws.send(Message::text(r#"{"id": 3}"#)).await.unwrap();

        // the valid frame after the malformed one still applies
        wait_until(|| store.incidents().first().is_some_and(|i| i.id == 3)).await;
        assert_eq!(store.status(), ConnectionState::Connected);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn reconnects_after_server_close() {
        let mut backend = spawn_backend(200, "[]", true).await;
        let config = test_config(backend.addr);
        let store = start_store(&config);

        let ws = timeout(Duration::from_secs(5), backend.ws_rx.recv())
            .await
            .unwrap()
            .unwrap();
        wait_for_status(&store, ConnectionState::Connected).await;

        drop(ws);

        // the backoff fires and a second connection arrives
        let _ws2 = timeout(Duration::from_secs(2), backend.ws_rx.recv())
            .await
            .expect("no reconnect attempt within the backoff window")
            .unwrap();
        wait_for_status(&store, ConnectionState::Connected).await;

        store.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_after_close_cancels_pending_reconnect() {
        let mut backend = spawn_backend(200, "[]", true).await;
        let mut config = test_config(backend.addr);
        config.reconnect.base_delay = Duration::from_millis(200);
        let store = start_store(&config);

        let ws = timeout(Duration::from_secs(5), backend.ws_rx.recv())
            .await
            .unwrap()
            .unwrap();
        wait_for_status(&store, ConnectionState::Connected).await;

        let status = store.watch_status();
        drop(ws);
        store.shutdown().await;

        assert_eq!(*status.borrow(), ConnectionState::Closed);
        let reconnect = timeout(Duration::from_millis(600), backend.ws_rx.recv()).await;
        assert!(reconnect.is_err(), "no reconnect may fire after teardown");
    }

    #[tokio::test]
    async fn bootstrap_failure_does_not_block_live_connection() {
        let mut backend = spawn_backend(404, r#"{"detail": "nope"}"#, true).await;
        let config = test_config(backend.addr);
        let store = start_store(&config);

        let _ws = timeout(Duration::from_secs(5), backend.ws_rx.recv())
            .await
            .unwrap()
            .unwrap();
        wait_for_status(&store, ConnectionState::Connected).await;

        // the fetch failure is surfaced but the stream is live
        assert!(store.last_error().is_some());
        assert!(store.incidents().is_empty());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_reconnect_attempts_leave_store_disconnected() {
        let backend = spawn_backend(200, "[]", false).await;
        let mut config = test_config(backend.addr);
        config.reconnect.max_attempts = 2;
        let store = start_store(&config);

        wait_until(|| {
            store.status() == ConnectionState::Disconnected
                && store
                    .last_error()
                    .is_some_and(|err| err.contains("exhausted"))
        })
        .await;

        store.shutdown().await;
    }

    #[tokio::test]
    async fn optimistic_local_update_loses_to_later_stream_frame() {
        let mut backend =
            spawn_backend(200, r#"[{"id": 1, "state": "travelling"}]"#, true).await;
        let config = test_config(backend.addr);
        let store = start_store(&config);

        let mut ws = timeout(Duration::from_secs(5), backend.ws_rx.recv())
            .await
            .unwrap()
            .unwrap();
        wait_for_status(&store, ConnectionState::Connected).await;

        store.update_local_state(1, IncidentState::Onsite);
        assert_eq!(store.incidents()[0].state, IncidentState::Onsite);

        ws.send(Message::text(
            r#"{"type": "update", "payload": {"id": 1, "state": "finished"}}"#,
        ))
        .await
        .unwrap();

        wait_until(|| store.incidents()[0].state == IncidentState::Finished).await;

        store.shutdown().await;
    }
}
