//! WebSocket connection state machine.
//!
//! A [`Connection`] is the shared handle to one client socket: its state,
//! its bounded outbound queue and the trips it is attached to. The socket
//! itself is owned by two tasks started from [`drive`]: a writer that
//! drains the outbound queue and sends pings, and a reader (the calling
//! task) that enforces the pong deadline and the size limit and hands
//! frames to the dispatcher. Each attached trip adds one delivery task that
//! moves events from its bus subscription into the outbound queue.
//!
//! Every way out of a connection goes through [`Connection::close`], which
//! records the first reason only, and then through one exit procedure:
//! registry detach, bus unsubscribe, supervisor removal.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Error as WsError;

use super::dispatch;
use super::messages::ErrorFrame;
use crate::app_state::AppState;
use crate::bus::{ClosedBy, EventBus, Subscription, SubscriptionHandle};
use crate::domain::{ConnectionId, Event, EventId, MemberRole, TripId, UserId};
use crate::error::AppError;
use crate::session::SessionRegistry;

/// How many recently delivered event ids each connection remembers.
const RECENT_EVENTS: usize = 128;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Socket upgraded, not yet registered.
    Connecting,
    /// Registered; membership being verified.
    Authenticating,
    /// Attached to its trips and exchanging frames.
    Attached,
    /// A close reason has been recorded; tasks are winding down.
    Closing,
    /// Fully torn down.
    Closed,
}

impl ConnectionState {
    /// Returns `true` if `next` is a legal successor.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Authenticating | Self::Closing | Self::Closed)
                | (Self::Authenticating, Self::Attached | Self::Closing | Self::Closed)
                | (Self::Attached, Self::Closing | Self::Closed)
                | (Self::Closing, Self::Closed)
        )
    }

    /// Returns `true` before a close reason exists.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating | Self::Attached)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Server-initiated orderly close.
    Normal,
    /// The client closed the socket.
    ClientClosed,
    /// Nothing heard within the pong deadline.
    PongTimeout,
    /// Inbound message above the size limit.
    Oversize,
    /// Outbound queue stayed full past the write deadline.
    WriteStall,
    /// Evicted by the event bus for not keeping up.
    SlowConsumer,
    /// No active membership in the trip.
    NotMember,
    /// The node is shutting down.
    ServerShutdown,
    /// Socket error.
    TransportError,
}

impl CloseReason {
    /// Machine string, also sent as the close frame reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::ClientClosed => "client_closed",
            Self::PongTimeout => "pong_timeout",
            Self::Oversize => "oversize",
            Self::WriteStall => "write_stall",
            Self::SlowConsumer => "slow_consumer",
            Self::NotMember => "not_member",
            Self::ServerShutdown => "server_shutdown",
            Self::TransportError => "transport_error",
        }
    }

    /// WebSocket close code (RFC 6455 section 7.4.1).
    #[must_use]
    pub const fn close_code(self) -> u16 {
        match self {
            Self::Normal | Self::ClientClosed => 1000,
            Self::ServerShutdown => 1001,
            Self::NotMember => 1008,
            Self::Oversize => 1009,
            Self::PongTimeout | Self::WriteStall | Self::SlowConsumer | Self::TransportError => 1011,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the connection is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionScope {
    /// `/trips/{tripId}/ws/events`.
    Trip(TripId),
    /// `/ws`: every trip with an active membership.
    AllTrips,
}

/// Per-trip bookkeeping owned by a connection.
#[derive(Debug)]
pub(crate) struct TripAttachment {
    pub(crate) handle: SubscriptionHandle,
    pub(crate) delivery: AbortHandle,
    pub(crate) role: MemberRole,
}

/// Shared handle to one client connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    scope: ConnectionScope,
    created_at: DateTime<Utc>,
    outbound: mpsc::Sender<String>,
    write_wait: Duration,
    state: watch::Sender<ConnectionState>,
    close_reason: Mutex<Option<CloseReason>>,
    last_seen: Mutex<Instant>,
    recent: Mutex<VecDeque<EventId>>,
    trips: Mutex<HashMap<TripId, TripAttachment>>,
}

impl Connection {
    /// Creates a connection in `Connecting` with an outbound queue of
    /// `queue` frames. The receiver belongs to the writer.
    #[must_use]
    pub fn new(
        user_id: UserId,
        scope: ConnectionScope,
        queue: usize,
        write_wait: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            user_id,
            scope,
            created_at: Utc::now(),
            outbound: tx,
            write_wait,
            state,
            close_reason: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENTS)),
            trips: Mutex::new(HashMap::new()),
        });
        (conn, rx)
    }

    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Authenticated user.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Endpoint binding.
    #[must_use]
    pub const fn scope(&self) -> ConnectionScope {
        self.scope
    }

    /// When the socket was accepted.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Recorded close reason, if any.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to `next` if that is a legal transition.
    pub fn advance(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Records `reason` and moves to `Closing`. Only the first call has any
    /// effect; returns whether this call was it.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut slot = self
                .close_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.advance(ConnectionState::Closing);
        tracing::debug!(connection = %self.id, user_id = %self.user_id, %reason, "connection closing");
        true
    }

    /// Final transition after the exit procedure.
    pub fn mark_closed(&self) {
        self.advance(ConnectionState::Closed);
    }

    /// Resolves once a close reason has been recorded.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| !s.is_open()).await;
    }

    /// Resolves once the exit procedure has finished and the state is
    /// `Closed`.
    pub async fn terminated(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Records inbound activity.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Frames queued but not yet written.
    #[must_use]
    pub fn outbound_pending(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }

    /// Queues a text frame, waiting at most the write deadline for room.
    /// A stalled queue closes the connection with `write_stall`.
    ///
    /// # Errors
    ///
    /// Returns the close reason if the frame was not queued.
    pub async fn send_text(&self, text: String) -> Result<(), CloseReason> {
        if !self.state().is_open() {
            return Err(self.close_reason().unwrap_or(CloseReason::Normal));
        }
        match tokio::time::timeout(self.write_wait, self.outbound.send(text)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.close(CloseReason::TransportError);
                Err(CloseReason::TransportError)
            }
            Err(_) => {
                tracing::warn!(connection = %self.id, user_id = %self.user_id, "outbound queue stalled");
                self.close(CloseReason::WriteStall);
                Err(CloseReason::WriteStall)
            }
        }
    }

    /// Serializes and queues `frame`.
    ///
    /// # Errors
    ///
    /// Returns the close reason if the frame was not queued.
    pub async fn send_json<T: Serialize>(&self, frame: &T) -> Result<(), CloseReason> {
        match serde_json::to_string(frame) {
            Ok(text) => self.send_text(text).await,
            Err(e) => {
                tracing::error!(connection = %self.id, error = %e, "failed to encode frame");
                Ok(())
            }
        }
    }

    /// Queues an error frame for `err`.
    pub async fn send_error(&self, err: &AppError) {
        let _ = self.send_json(&ErrorFrame::from(err)).await;
    }

    /// Delivers an event unless this connection already delivered the same
    /// event id (it may arrive through both the bus and a registry fanout).
    /// Returns `false` once the connection can no longer take frames.
    pub async fn deliver(&self, event: &Event) -> bool {
        if !self.remember(event.id) {
            return true;
        }
        self.send_json(event).await.is_ok()
    }

    fn remember(&self, id: EventId) -> bool {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.contains(&id) {
            return false;
        }
        if recent.len() == RECENT_EVENTS {
            recent.pop_front();
        }
        recent.push_back(id);
        true
    }

    /// Trips this connection is attached to.
    #[must_use]
    pub fn attached_trips(&self) -> Vec<TripId> {
        self.trips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Role the user held in `trip` when it was attached.
    #[must_use]
    pub fn role_in(&self, trip: TripId) -> Option<MemberRole> {
        self.trips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&trip)
            .map(|a| a.role)
    }

    pub(crate) fn add_trip(&self, trip: TripId, attachment: TripAttachment) -> Result<(), TripAttachment> {
        let mut trips = self.trips.lock().unwrap_or_else(PoisonError::into_inner);
        if trips.contains_key(&trip) {
            return Err(attachment);
        }
        trips.insert(trip, attachment);
        Ok(())
    }

    pub(crate) fn take_trip(&self, trip: TripId) -> Option<TripAttachment> {
        self.trips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&trip)
    }

    pub(crate) fn take_all_trips(&self) -> Vec<(TripId, TripAttachment)> {
        self.trips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect()
    }
}

/// Attaches `conn` to `trip`: registry entry, bus subscription and a
/// delivery task. Returns the caller's role.
///
/// # Errors
///
/// Returns [`AppError::NotMember`] without an active membership, or
/// [`AppError::Unavailable`] if the bus is shut down or the lookup times out.
pub async fn attach_trip(
    state: &AppState,
    conn: &Arc<Connection>,
    trip: TripId,
) -> Result<MemberRole, AppError> {
    if let Some(role) = conn.role_in(trip) {
        return Ok(role);
    }
    let role = state.registry.attach(trip, conn).await?;
    let subscription = match state
        .bus
        .subscribe(trip, conn.user_id(), state.subscribe_options())
        .await
    {
        Ok(sub) => sub,
        Err(e) => {
            state.registry.detach(trip, conn.user_id(), conn.id()).await;
            return Err(e.into());
        }
    };
    let handle = subscription.handle();
    let task = tokio::spawn(delivery_loop(Arc::clone(conn), subscription));
    let attachment = TripAttachment {
        handle,
        delivery: task.abort_handle(),
        role,
    };
    if let Err(duplicate) = conn.add_trip(trip, attachment) {
        duplicate.delivery.abort();
        state.bus.unsubscribe(duplicate.handle).await;
    }
    tracing::debug!(connection = %conn.id(), %trip, %role, "attached to trip");
    Ok(role)
}

/// Drops `conn`'s interest in `trip` after the user lost access. A
/// connection bound to that trip alone is closed with `not_member`.
pub async fn release_trip(
    registry: &SessionRegistry,
    bus: &EventBus,
    conn: &Arc<Connection>,
    trip: TripId,
) {
    if conn.scope() == ConnectionScope::Trip(trip) {
        conn.close(CloseReason::NotMember);
        return;
    }
    if let Some(attachment) = conn.take_trip(trip) {
        registry.detach(trip, conn.user_id(), conn.id()).await;
        attachment.delivery.abort();
        bus.unsubscribe(attachment.handle).await;
    }
}

async fn delivery_loop(conn: Arc<Connection>, subscription: Subscription) {
    loop {
        tokio::select! {
            () = conn.closed() => break,
            next = subscription.recv() => match next {
                Some(event) => {
                    // A stalled socket must still notice its own eviction.
                    let delivered = tokio::select! {
                        delivered = conn.deliver(&event) => delivered,
                        () = subscription.evicted() => {
                            conn.close(CloseReason::SlowConsumer);
                            false
                        }
                    };
                    if !delivered {
                        break;
                    }
                }
                None => {
                    match subscription.closed_by() {
                        Some(ClosedBy::SlowConsumer) => {
                            conn.close(CloseReason::SlowConsumer);
                        }
                        Some(ClosedBy::ShutDown) => {
                            conn.close(CloseReason::ServerShutdown);
                        }
                        _ => {}
                    }
                    break;
                }
            }
        }
    }
}

/// Runs a connection to completion over `socket`, then performs the exit
/// procedure.
pub async fn drive(
    socket: WebSocket,
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<String>,
    state: AppState,
) {
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        Arc::clone(&conn),
        outbound,
        state.config.ws.ping_period,
    ));
    let writer_abort = writer.abort_handle();

    let reason = read_loop(stream, &conn, &state).await;
    conn.close(reason);
    finish(&state, &conn).await;

    if tokio::time::timeout(state.config.ws.write_wait, writer).await.is_err() {
        writer_abort.abort();
    }
    conn.mark_closed();
    tracing::info!(
        connection = %conn.id(),
        user_id = %conn.user_id(),
        reason = %conn.close_reason().unwrap_or(reason),
        "ws connection closed"
    );
}

/// Exit procedure: registry detach, then bus unsubscribe, then supervisor
/// removal. Safe to call more than once.
pub async fn finish(state: &AppState, conn: &Arc<Connection>) {
    for (trip, attachment) in conn.take_all_trips() {
        state.registry.detach(trip, conn.user_id(), conn.id()).await;
        attachment.delivery.abort();
        state.bus.unsubscribe(attachment.handle).await;
    }
    state.supervisor.remove(conn.id()).await;
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    conn: &Arc<Connection>,
    state: &AppState,
) -> CloseReason {
    let pong_wait = state.config.ws.pong_wait;
    let max_bytes = state.config.ws.max_message_bytes;
    loop {
        let next = tokio::select! {
            () = conn.closed() => return conn.close_reason().unwrap_or(CloseReason::Normal),
            next = tokio::time::timeout(pong_wait, stream.next()) => next,
        };
        let Ok(frame) = next else {
            return CloseReason::PongTimeout;
        };
        match frame {
            None | Some(Ok(Message::Close(_))) => return CloseReason::ClientClosed,
            Some(Err(e)) => {
                let inner = e.into_inner();
                if is_capacity_error(inner.as_ref()) {
                    return CloseReason::Oversize;
                }
                tracing::debug!(connection = %conn.id(), error = %inner, "ws read error");
                return CloseReason::TransportError;
            }
            Some(Ok(Message::Text(text))) => {
                conn.touch();
                if text.len() > max_bytes {
                    return CloseReason::Oversize;
                }
                dispatch::handle_text(state, conn, text.as_str()).await;
            }
            Some(Ok(Message::Binary(bytes))) => {
                conn.touch();
                if bytes.len() > max_bytes {
                    return CloseReason::Oversize;
                }
                conn.send_error(&AppError::Validation("binary frames are not supported".to_string()))
                    .await;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.touch(),
        }
    }
}

/// Whether a socket read failed because a frame or message exceeded the
/// configured size limit.
fn is_capacity_error(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    matches!(err.downcast_ref::<WsError>(), Some(WsError::Capacity(_)))
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    conn: Arc<Connection>,
    mut outbound: mpsc::Receiver<String>,
    ping_period: Duration,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
    loop {
        tokio::select! {
            biased;
            () = conn.closed() => break,
            frame = outbound.recv() => {
                let Some(text) = frame else { break };
                if sink.send(Message::text(text)).await.is_err() {
                    conn.close(CloseReason::TransportError);
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    conn.close(CloseReason::TransportError);
                    break;
                }
            }
        }
    }

    // Flush whatever was queued before the close, then say goodbye.
    while let Ok(text) = outbound.try_recv() {
        if sink.send(Message::text(text)).await.is_err() {
            break;
        }
    }
    let reason = conn.close_reason().unwrap_or(CloseReason::Normal);
    let frame = CloseFrame {
        code: reason.close_code(),
        reason: Utf8Bytes::from_static(reason.as_str()),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::EventType;

    #[test]
    fn size_limit_errors_are_told_apart_by_variant() {
        use tokio_tungstenite::tungstenite::error::CapacityError;

        let too_long = axum::Error::new(WsError::Capacity(CapacityError::MessageTooLong {
            size: 2_000_000,
            max_size: 65_536,
        }));
        assert!(is_capacity_error(too_long.into_inner().as_ref()));

        let reset = axum::Error::new(WsError::ConnectionClosed);
        assert!(!is_capacity_error(reset.into_inner().as_ref()));

        let other = axum::Error::new(std::io::Error::other("message too long"));
        assert!(!is_capacity_error(other.into_inner().as_ref()));
    }

    #[tokio::test]
    async fn stalled_socket_is_closed_when_its_subscription_is_evicted() {
        use crate::config::{AppConfig, SocketOverflow};
        use crate::domain::Membership;
        use crate::store::{MemoryStore, Store};

        let mut config = AppConfig::default();
        config.ws.overflow = SocketOverflow::Disconnect;
        config.event_bus.subscriber_capacity = 2;
        let store = Arc::new(MemoryStore::new());
        let state = AppState::with_store(config, Arc::clone(&store) as Arc<dyn Store>);
        let user = UserId::new();
        let trip = TripId::new();
        store
            .put_membership(Membership::active(trip, user, MemberRole::Member))
            .await;

        // Nobody drains `_rx`, and the enqueue wait outlasts the test.
        let (conn, _rx) = Connection::new(user, ConnectionScope::Trip(trip), 1, Duration::from_secs(30));
        let Ok(_) = attach_trip(&state, &conn, trip).await else {
            panic!("attach failed");
        };
        for _ in 0..8 {
            let event = Event::new(
                EventType::ChatMessageSent,
                trip,
                user,
                "test",
                serde_json::json!({"content": "hi"}),
            );
            let _ = state.bus.publish(event).await;
            tokio::task::yield_now().await;
        }
        let Ok(()) = tokio::time::timeout(Duration::from_secs(2), conn.closed()).await else {
            panic!("connection should have been closed");
        };
        assert_eq!(conn.close_reason(), Some(CloseReason::SlowConsumer));
    }

    fn conn(queue: usize) -> (Arc<Connection>, mpsc::Receiver<String>) {
        Connection::new(
            UserId::new(),
            ConnectionScope::AllTrips,
            queue,
            Duration::from_millis(50),
        )
    }

    fn event() -> Event {
        Event::new(
            EventType::ChatMessageSent,
            TripId::new(),
            UserId::new(),
            "test",
            serde_json::json!({"content": "hi"}),
        )
    }

    #[test]
    fn state_machine_only_moves_forward() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Authenticating));
        assert!(Authenticating.can_transition_to(Attached));
        assert!(Attached.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Closing));
        assert!(!Attached.can_transition_to(Authenticating));
        assert!(!Closing.can_transition_to(Attached));
    }

    #[test]
    fn close_codes() {
        assert_eq!(CloseReason::Oversize.close_code(), 1009);
        assert_eq!(CloseReason::NotMember.close_code(), 1008);
        assert_eq!(CloseReason::ServerShutdown.close_code(), 1001);
        assert_eq!(CloseReason::SlowConsumer.as_str(), "slow_consumer");
    }

    #[test]
    fn close_is_idempotent() {
        let (conn, _rx) = conn(4);
        assert!(conn.advance(ConnectionState::Authenticating));
        assert!(conn.advance(ConnectionState::Attached));
        assert!(conn.close(CloseReason::PongTimeout));
        assert!(!conn.close(CloseReason::ClientClosed));
        assert_eq!(conn.close_reason(), Some(CloseReason::PongTimeout));
        assert_eq!(conn.state(), ConnectionState::Closing);
        conn.mark_closed();
        conn.mark_closed();
        assert!(!conn.close(CloseReason::Normal));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_delivered_once() {
        let (conn, mut rx) = conn(4);
        let ev = event();
        assert!(conn.deliver(&ev).await);
        assert!(conn.deliver(&ev).await);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_stalls_and_closes() {
        let (conn, _rx) = conn(1);
        assert!(conn.send_text("a".to_string()).await.is_ok());
        assert_eq!(conn.outbound_pending(), 1);
        assert_eq!(conn.send_text("b".to_string()).await, Err(CloseReason::WriteStall));
        assert_eq!(conn.close_reason(), Some(CloseReason::WriteStall));
        assert_eq!(conn.send_text("c".to_string()).await, Err(CloseReason::WriteStall));
    }

    #[tokio::test]
    async fn closed_resolves_after_close() {
        let (conn, _rx) = conn(1);
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.closed().await })
        };
        conn.close(CloseReason::ServerShutdown);
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter).await.is_ok());
    }
}
