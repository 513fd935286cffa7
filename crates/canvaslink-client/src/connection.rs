//! Connection manager: owns the WebSocket, the reconnect state machine, and
//! the routing between wire frames and the correlation table.
//!
//! The manager runs as a single spawned task. A [`Link`] is the caller-facing
//! handle; it talks to the task over channels, so dropping or closing the
//! link tears the task down cleanly.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use canvaslink_protocol::{ChannelId, Envelope, ProgressEvent, WireMessage};

use crate::backoff::BackoffPolicy;
use crate::config::LinkConfig;
use crate::dispatcher::{CommandDispatcher, Outbound, PendingTable};
use crate::error::LinkError;
use crate::scheduler::{Scheduler, TokioScheduler};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Observable lifecycle of the channel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// A reconnect attempt is waiting out its backoff delay.
    ReconnectScheduled { attempt: u32 },
    /// Past the persistent-retry threshold; still retrying, but the caller
    /// may want to surface the outage.
    PersistentRetry { attempt: u32 },
}

enum Control {
    SetAutoReconnect(bool),
    Shutdown,
}

/// How a connected session ended.
enum SessionEnd {
    Shutdown,
    SocketLost,
    OutboundClosed,
}

/// Handle to a channel connection. Cheap accessors hand out clones of the
/// dispatcher and state watch; the inbound request and progress streams can
/// each be taken exactly once.
pub struct Link {
    dispatcher: CommandDispatcher,
    state_rx: watch::Receiver<ConnectionState>,
    control_tx: mpsc::UnboundedSender<Control>,
    outbound_tx: mpsc::Sender<Outbound>,
    requests_rx: Option<mpsc::Receiver<Envelope>>,
    progress_rx: Option<mpsc::UnboundedReceiver<ProgressEvent>>,
    task: JoinHandle<()>,
}

impl Link {
    /// Connect to the relay and join `channel`, retrying per the configured
    /// backoff policy.
    pub fn connect(config: LinkConfig, channel: impl Into<ChannelId>) -> Self {
        Self::connect_with_scheduler(config, channel, Arc::new(TokioScheduler))
    }

    /// Like [`Link::connect`], with reconnect delays driven by the given
    /// scheduler.
    pub fn connect_with_scheduler(
        config: LinkConfig,
        channel: impl Into<ChannelId>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let channel = channel.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (requests_tx, requests_rx) = mpsc::channel(64);
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let table = PendingTable::default();
        let dispatcher = CommandDispatcher::new(
            outbound_tx.clone(),
            table.clone(),
            Some(state_rx.clone()),
            config.request_timeout,
        );

        let manager = ConnectionManager {
            url: config.url(),
            channel,
            auto_reconnect: config.auto_reconnect,
            backoff: BackoffPolicy::new(config.backoff.clone()),
            scheduler,
            table,
            state_tx,
            requests_tx,
            progress_tx,
        };
        let task = tokio::spawn(manager.run(outbound_rx, control_rx));

        Self {
            dispatcher,
            state_rx,
            control_tx,
            outbound_tx,
            requests_rx: Some(requests_rx),
            progress_rx: Some(progress_rx),
            task,
        }
    }

    pub fn dispatcher(&self) -> CommandDispatcher {
        self.dispatcher.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch receiver over the connection state.
    pub fn states(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the connection state satisfies `predicate` and return it.
    pub async fn wait_for_state(
        &self,
        predicate: impl Fn(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut rx = self.state_rx.clone();
        loop {
            let matched = {
                let state = rx.borrow();
                predicate(&state).then(|| state.clone())
            };
            if let Some(state) = matched {
                return state;
            }
            if rx.changed().await.is_err() {
                let state = rx.borrow().clone();
                return state;
            }
        }
    }

    /// Enable or disable reconnect-on-loss. Disabling while a reconnect is
    /// pending cancels its timer.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        let _ = self.control_tx.send(Control::SetAutoReconnect(enabled));
    }

    /// Stream of inbound command requests addressed to this party. Returns
    /// `None` after the first call.
    pub fn take_requests(&mut self) -> Option<mpsc::Receiver<Envelope>> {
        self.requests_rx.take()
    }

    /// Stream of inbound progress events. Returns `None` after the first
    /// call.
    pub fn take_progress(&mut self) -> Option<mpsc::UnboundedReceiver<ProgressEvent>> {
        self.progress_rx.take()
    }

    /// Handle for sending response envelopes back through the channel.
    pub fn responder(&self) -> Responder {
        Responder {
            outbound: self.outbound_tx.clone(),
        }
    }

    /// Sender that forwards progress events onto the wire. Events are
    /// dropped once the link closes.
    pub fn progress_sink(&self) -> mpsc::UnboundedSender<ProgressEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbound = self.outbound_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if outbound.send(Outbound::Progress(event)).await.is_err() {
                    break;
                }
            }
        });
        tx
    }

    /// Shut the connection down and wait for the manager task to finish.
    pub async fn close(self) {
        let _ = self.control_tx.send(Control::Shutdown);
        let _ = self.task.await;
    }
}

/// Sends response envelopes back through the channel.
#[derive(Clone)]
pub struct Responder {
    outbound: mpsc::Sender<Outbound>,
}

impl Responder {
    pub async fn send(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.outbound
            .send(Outbound::Envelope(envelope))
            .await
            .map_err(|_| LinkError::Closed)
    }
}

struct ConnectionManager {
    url: String,
    channel: ChannelId,
    auto_reconnect: bool,
    backoff: BackoffPolicy,
    scheduler: Arc<dyn Scheduler>,
    table: PendingTable,
    state_tx: watch::Sender<ConnectionState>,
    requests_tx: mpsc::Sender<Envelope>,
    progress_tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ConnectionManager {
    async fn run(
        mut self,
        mut outbound_rx: mpsc::Receiver<Outbound>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) {
        let mut attempt: u32 = 0;
        'reconnect: loop {
            self.state_tx.send_replace(ConnectionState::Connecting);
            match connect_async(self.url.as_str()).await {
                Ok((socket, _)) => {
                    let (mut sink, mut stream) = socket.split();
                    let join = WireMessage::Join {
                        channel: self.channel.clone(),
                    };
                    if send_frame(&mut sink, &join).await.is_ok() {
                        attempt = 0;
                        self.state_tx.send_replace(ConnectionState::Connected);
                        tracing::info!(channel = %self.channel, url = %self.url, "connected");

                        let end = self
                            .session(&mut sink, &mut stream, &mut outbound_rx, &mut control_rx)
                            .await;
                        // Nothing in flight can complete across a socket
                        // boundary: correlation ids do not survive reconnect.
                        self.table.fail_all(|| LinkError::ConnectionLost);
                        match end {
                            SessionEnd::Shutdown | SessionEnd::OutboundClosed => {
                                self.state_tx.send_replace(ConnectionState::Disconnected);
                                return;
                            }
                            SessionEnd::SocketLost => {
                                tracing::warn!(channel = %self.channel, "connection lost");
                            }
                        }
                    } else {
                        tracing::warn!(channel = %self.channel, "join frame failed to send");
                    }
                }
                Err(err) => {
                    tracing::warn!(url = %self.url, error = %err, "connect failed");
                }
            }

            if !self.auto_reconnect {
                if !self.park_until_reenabled(&mut control_rx).await {
                    return;
                }
                attempt = 0;
                continue 'reconnect;
            }

            attempt += 1;
            let delay = self.backoff.delay_for(attempt);
            let state = if self.backoff.in_persistent_retry(attempt) {
                ConnectionState::PersistentRetry { attempt }
            } else {
                ConnectionState::ReconnectScheduled { attempt }
            };
            let timer = self.scheduler.schedule_after(delay);
            let cancel = timer.cancel_handle();
            // State goes out only once the timer is registered, so observers
            // of `ReconnectScheduled` can rely on a pending delay existing.
            self.state_tx.send_replace(state);
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );
            let mut fired = pin!(timer.wait());
            loop {
                tokio::select! {
                    did_fire = &mut fired => {
                        if did_fire {
                            continue 'reconnect;
                        }
                        // Timer cancelled: reconnect was switched off.
                        if !self.park_until_reenabled(&mut control_rx).await {
                            return;
                        }
                        attempt = 0;
                        continue 'reconnect;
                    }
                    control = control_rx.recv() => match control {
                        Some(Control::SetAutoReconnect(enabled)) => {
                            self.auto_reconnect = enabled;
                            if !enabled {
                                cancel.cancel();
                            }
                        }
                        Some(Control::Shutdown) | None => {
                            cancel.cancel();
                            self.state_tx.send_replace(ConnectionState::Disconnected);
                            return;
                        }
                    },
                }
            }
        }
    }

    /// Sit in `Disconnected` until reconnect is re-enabled. Returns false on
    /// shutdown.
    async fn park_until_reenabled(
        &mut self,
        control_rx: &mut mpsc::UnboundedReceiver<Control>,
    ) -> bool {
        self.state_tx.send_replace(ConnectionState::Disconnected);
        loop {
            match control_rx.recv().await {
                Some(Control::SetAutoReconnect(true)) => {
                    self.auto_reconnect = true;
                    return true;
                }
                Some(Control::SetAutoReconnect(false)) => continue,
                Some(Control::Shutdown) | None => return false,
            }
        }
    }

    async fn session(
        &mut self,
        sink: &mut WsSink,
        stream: &mut WsSource,
        outbound_rx: &mut mpsc::Receiver<Outbound>,
        control_rx: &mut mpsc::UnboundedReceiver<Control>,
    ) -> SessionEnd {
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => match outbound {
                    Some(traffic) => {
                        let frame = self.wrap_outbound(traffic);
                        if send_frame(sink, &frame).await.is_err() {
                            return SessionEnd::SocketLost;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::OutboundClosed;
                    }
                },
                control = control_rx.recv() => match control {
                    Some(Control::SetAutoReconnect(enabled)) => {
                        self.auto_reconnect = enabled;
                    }
                    Some(Control::Shutdown) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.route_frame(text.as_str()),
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return SessionEnd::SocketLost;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::SocketLost,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "socket error");
                        return SessionEnd::SocketLost;
                    }
                },
                _ = sweep.tick() => {
                    let expired = self.table.reject_expired(tokio::time::Instant::now());
                    if expired > 0 {
                        tracing::debug!(expired, "swept expired requests");
                    }
                }
            }
        }
    }

    fn route_frame(&self, raw: &str) {
        let frame: WireMessage = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed frame");
                return;
            }
        };
        match frame {
            WireMessage::Message { message, .. } => {
                if matches!(message, Envelope::Request { .. }) {
                    if self.requests_tx.try_send(message).is_err() {
                        tracing::warn!("inbound request dropped: queue full or no executor");
                    }
                } else {
                    self.table.resolve_envelope(message);
                }
            }
            WireMessage::CommandProgress(event) => {
                let _ = self.progress_tx.send(event);
            }
            WireMessage::System { channel, message } => {
                tracing::debug!(channel = %channel, message = %message, "system notice");
            }
            WireMessage::Error { message } => {
                tracing::warn!(message = %message, "relay error");
            }
            WireMessage::Join { .. } => {}
        }
    }

    fn wrap_outbound(&self, traffic: Outbound) -> WireMessage {
        match traffic {
            Outbound::Envelope(envelope) => WireMessage::Message {
                id: uuid::Uuid::new_v4().to_string(),
                channel: self.channel.clone(),
                message: envelope,
            },
            Outbound::Progress(event) => WireMessage::CommandProgress(event),
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &WireMessage) -> Result<(), LinkError> {
    let json = serde_json::to_string(frame)?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|_| LinkError::ConnectionLost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;

    async fn dead_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn failed_connects_walk_the_backoff_ladder() {
        let scheduler = ManualScheduler::new();
        let config = LinkConfig {
            host: "127.0.0.1".to_string(),
            port: dead_port().await,
            ..LinkConfig::default()
        };
        let link = Link::connect_with_scheduler(config, "ladder", scheduler.clone());

        let state = link
            .wait_for_state(|s| matches!(s, ConnectionState::ReconnectScheduled { .. }))
            .await;
        assert_eq!(state, ConnectionState::ReconnectScheduled { attempt: 1 });
        assert_eq!(scheduler.scheduled().len(), 1);

        for attempt in 2..=5u32 {
            assert!(scheduler.fire_next());
            let state = link
                .wait_for_state(|s| {
                    matches!(s,
                        ConnectionState::ReconnectScheduled { attempt: a }
                        | ConnectionState::PersistentRetry { attempt: a } if *a == attempt)
                })
                .await;
            if attempt >= 5 {
                assert_eq!(state, ConnectionState::PersistentRetry { attempt });
            } else {
                assert_eq!(state, ConnectionState::ReconnectScheduled { attempt });
            }
        }

        link.close().await;
    }

    #[tokio::test]
    async fn disabling_reconnect_cancels_the_pending_timer() {
        let scheduler = ManualScheduler::new();
        let config = LinkConfig {
            host: "127.0.0.1".to_string(),
            port: dead_port().await,
            ..LinkConfig::default()
        };
        let link = Link::connect_with_scheduler(config, "parked", scheduler.clone());

        link.wait_for_state(|s| matches!(s, ConnectionState::ReconnectScheduled { .. }))
            .await;
        link.set_auto_reconnect(false);
        let state = link
            .wait_for_state(|s| *s == ConnectionState::Disconnected)
            .await;
        assert_eq!(state, ConnectionState::Disconnected);

        // Nothing left for the scheduler to drive.
        assert!(!scheduler.fire_next());
        link.close().await;
    }

    #[tokio::test]
    async fn dispatch_while_disconnected_is_rejected_up_front() {
        let config = LinkConfig {
            host: "127.0.0.1".to_string(),
            port: dead_port().await,
            auto_reconnect: false,
            ..LinkConfig::default()
        };
        let link = Link::connect(config, "offline");
        link.wait_for_state(|s| *s == ConnectionState::Disconnected)
            .await;

        let err = link
            .dispatcher()
            .dispatch("get_selection", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::ConnectionLost));
        link.close().await;
    }
}
