//! The per-peer KCP connection
//!
//! One connection owns a sending worker, a receiving worker, an RTT
//! estimator, and two timer tasks: the data updater ticks every `tti`
//! milliseconds while either worker has work, the ping updater keeps the
//! conversation alive every few seconds and drives the close handshake to
//! completion. Incoming datagrams are fed in by the UDP demultiplexer via
//! [`Connection::input`]; everything outgoing funnels through the
//! buffered segment writer.
//!
//! Closing is a two-phase exchange: a ping carrying the close option
//! half-closes the write side, a Terminate command tears the conversation
//! down. The state machine is monotone; once `Terminated` is reached the
//! underlying socket slot is recycled or dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::buf::MultiBuffer;
use crate::error::KcpError;
use crate::header::Authenticator;

use super::config::KcpConfig;
use super::io::{DatagramLink, SegmentWriter};
use super::receiving::ReceivingWorker;
use super::segment::{
    read_segment, CmdOnlySegment, Command, Segment, DATA_SEGMENT_OVERHEAD, SEGMENT_OPTION_CLOSE,
};
use super::sending::SendingWorker;

/// No payload in either direction for this long starts a graceful close.
const IDLE_TIMEOUT: u32 = 30_000;
/// A half-closed connection stops draining and terminates after this long.
const READY_TO_CLOSE_TIMEOUT: u32 = 15_000;
/// Grace period granted to a terminating peer before we terminate too.
const PEER_TERMINATING_TIMEOUT: u32 = 4_000;
/// Terminate commands are repeated this long before giving up on the ack.
const TERMINATING_TIMEOUT: u32 = 8_000;
/// A ping goes out at least this often on an active connection.
const PING_INTERVAL: u32 = 3_000;
/// Ping updater cadence once termination started.
const TERMINATING_PING_INTERVAL: u64 = 1_000;

fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// Connection lifecycle states. Transitions are monotone: there is no way
/// back toward `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum State {
    /// Carrying traffic
    Active = 0,
    /// Local side closed; draining in-flight data
    ReadyToClose = 1,
    /// Peer half-closed its write side
    PeerClosed = 2,
    /// Exchanging Terminate commands
    Terminating = 3,
    /// Peer signalled Terminate while we were active
    PeerTerminating = 4,
    /// Fully torn down
    Terminated = 5,
}

impl State {
    fn from_i32(v: i32) -> Self {
        match v {
            0 => Self::Active,
            1 => Self::ReadyToClose,
            2 => Self::PeerClosed,
            3 => Self::Terminating,
            4 => Self::PeerTerminating,
            _ => Self::Terminated,
        }
    }
}

/// RFC 6298 round-trip estimator with the peer-reported override.
pub struct RoundTripInfo {
    variation: u32,
    srtt: u32,
    rto: u32,
    min_rtt: u32,
    updated_timestamp: u32,
}

impl RoundTripInfo {
    fn new(min_rtt: u32) -> Self {
        Self {
            variation: 0,
            srtt: 0,
            rto: 100,
            min_rtt,
            updated_timestamp: 0,
        }
    }

    fn update(&mut self, rtt: u32, current: u32) {
        if rtt > i32::MAX as u32 {
            return;
        }
        if self.srtt == 0 {
            self.srtt = rtt;
            self.variation = rtt / 2;
        } else {
            let delta = self.srtt.abs_diff(rtt);
            self.variation = (3 * self.variation + delta) / 4;
            self.srtt = (7 * self.srtt + rtt) / 8;
            if self.srtt < self.min_rtt {
                self.srtt = self.min_rtt;
            }
        }
        let rto = (self.srtt + (4 * self.variation).max(self.min_rtt)) * 5 / 4;
        self.rto = rto.clamp(self.min_rtt, 10_000);
        self.updated_timestamp = current;
    }

    /// Adopt the RTO the peer measured, at most once per ping interval.
    fn update_peer_rto(&mut self, rto: u32, current: u32) {
        if current.wrapping_sub(self.updated_timestamp) < PING_INTERVAL {
            return;
        }
        self.updated_timestamp = current;
        self.rto = rto.clamp(self.min_rtt, 10_000);
    }

    fn timeout(&self) -> u32 {
        self.rto
    }

    #[cfg(test)]
    fn smoothed(&self) -> u32 {
        self.srtt
    }
}

/// Gets told when a connection reaches `Terminated`, so the owner can
/// drop its demux entry or recycle the socket slot.
pub trait TerminationObserver: Send + Sync {
    /// Called exactly once per connection.
    fn on_terminated(&self, conv: u16, remote: SocketAddr, reusable: bool);
}

struct Updater {
    notify: Arc<Notify>,
    interval: Arc<AtomicU64>,
}

impl Updater {
    fn new(interval_ms: u64) -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            interval: Arc::new(AtomicU64::new(interval_ms)),
        }
    }

    fn wake(&self) {
        self.notify.notify_one();
    }

    fn set_interval(&self, interval_ms: u64) {
        self.interval.store(interval_ms, Ordering::Relaxed);
    }
}

/// The data updater ticks every `tti` while either worker has work; it
/// parks on its notifier otherwise and exits for good once termination
/// starts (the ping updater owns the endgame).
fn spawn_data_updater(conn: &Arc<Connection>) {
    let weak: Weak<Connection> = Arc::downgrade(conn);
    let notify = Arc::clone(&conn.data_updater.notify);
    let interval = Arc::clone(&conn.data_updater.interval);
    tokio::spawn(async move {
        loop {
            notify.notified().await;
            loop {
                let Some(conn) = weak.upgrade() else { return };
                if matches!(conn.state(), State::Terminating | State::Terminated) {
                    return;
                }
                let has_work = conn.sending.lock().update_necessary()
                    || conn.receiving.lock().update_necessary();
                if !has_work {
                    break;
                }
                conn.flush().await;
                drop(conn);
                let sleep_ms = interval.load(Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            }
        }
    });
}

/// The ping updater runs until the connection is fully terminated,
/// dropping to a one-second cadence once the close handshake starts.
fn spawn_ping_updater(conn: &Arc<Connection>) {
    let weak: Weak<Connection> = Arc::downgrade(conn);
    let notify = Arc::clone(&conn.ping_updater.notify);
    let interval = Arc::clone(&conn.ping_updater.interval);
    tokio::spawn(async move {
        loop {
            notify.notified().await;
            loop {
                let Some(conn) = weak.upgrade() else { return };
                if conn.state() == State::Terminated {
                    return;
                }
                conn.flush().await;
                drop(conn);
                let sleep_ms = interval.load(Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            }
        }
    });
}

/// A reliable bidirectional byte stream over unreliable datagrams.
pub struct Connection {
    conv: u16,
    config: KcpConfig,
    mss: usize,

    state: AtomicI32,
    state_begin_time: AtomicU32,
    last_incoming_time: AtomicU32,
    last_payload_time: AtomicU32,
    last_ping_time: AtomicU32,
    since: Instant,

    local_addr: SocketAddr,
    remote_addr: SocketAddr,

    data_input: Notify,
    data_output: Notify,

    sending: parking_lot::Mutex<SendingWorker>,
    receiving: parking_lot::Mutex<ReceivingWorker>,
    round_trip: parking_lot::Mutex<RoundTripInfo>,
    output: parking_lot::Mutex<SegmentWriter>,
    link: Arc<dyn DatagramLink>,

    read_deadline: parking_lot::Mutex<Option<Instant>>,
    write_deadline: parking_lot::Mutex<Option<Instant>>,

    data_updater: Updater,
    ping_updater: Updater,

    reusable: AtomicBool,
    terminated_once: AtomicBool,
    observer: parking_lot::Mutex<Option<Arc<dyn TerminationObserver>>>,
}

impl Connection {
    /// Create a connection and start its updater tasks.
    pub fn new(
        conv: u16,
        config: KcpConfig,
        authenticator: &Arc<dyn Authenticator>,
        link: Arc<dyn DatagramLink>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        observer: Option<Arc<dyn TerminationObserver>>,
    ) -> Arc<Self> {
        debug!("kcp: creating connection {} to {}", conv, remote_addr);
        let mss = config.mss(authenticator.overhead());
        let ack_limit = (mss + DATA_SEGMENT_OVERHEAD - 13) / 8;
        let conn = Arc::new(Self {
            conv,
            mss,
            state: AtomicI32::new(State::Active as i32),
            state_begin_time: AtomicU32::new(0),
            last_incoming_time: AtomicU32::new(0),
            last_payload_time: AtomicU32::new(0),
            last_ping_time: AtomicU32::new(0),
            since: Instant::now(),
            local_addr,
            remote_addr,
            data_input: Notify::new(),
            data_output: Notify::new(),
            sending: parking_lot::Mutex::new(SendingWorker::new(
                conv,
                config.sending_window_size(),
                config.sending_queue_size() as usize,
                mss,
                config.congestion,
            )),
            receiving: parking_lot::Mutex::new(ReceivingWorker::new(
                conv,
                config.receiving_window_size(),
                config.receiving_queue_size() as usize,
                ack_limit,
            )),
            round_trip: parking_lot::Mutex::new(RoundTripInfo::new(config.tti)),
            output: parking_lot::Mutex::new(SegmentWriter::new(
                config.mtu as usize,
                Arc::clone(authenticator),
            )),
            link,
            read_deadline: parking_lot::Mutex::new(None),
            write_deadline: parking_lot::Mutex::new(None),
            data_updater: Updater::new(u64::from(config.tti)),
            ping_updater: Updater::new(u64::from(PING_INTERVAL)),
            reusable: AtomicBool::new(false),
            terminated_once: AtomicBool::new(false),
            observer: parking_lot::Mutex::new(observer),
            config,
        });

        spawn_data_updater(&conn);
        spawn_ping_updater(&conn);
        conn.ping_updater.wake();

        conn
    }

    /// Milliseconds since the connection was created.
    fn elapsed(&self) -> u32 {
        self.since.elapsed().as_millis() as u32
    }

    /// Conversation id shared with the peer.
    #[must_use]
    pub fn conversation(&self) -> u16 {
        self.conv
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        State::from_i32(self.state.load(Ordering::Acquire))
    }

    /// Local socket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer socket address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Mark whether the underlying socket slot should return to the reuse
    /// pool on termination.
    pub fn set_reusable(&self, reusable: bool) {
        self.reusable.store(reusable, Ordering::Relaxed);
    }

    /// Whether the socket slot returns to the reuse pool.
    #[must_use]
    pub fn reusable(&self) -> bool {
        self.config.connection_reuse && self.reusable.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: State) {
        let current = self.elapsed();
        self.state.store(state as i32, Ordering::Release);
        self.state_begin_time.store(current, Ordering::Release);
        debug!(
            "kcp: connection {} entering {:?} at {}ms",
            self.conv, state, current
        );

        match state {
            State::Active => {}
            State::ReadyToClose => self.receiving.lock().close_read(),
            State::PeerClosed => self.sending.lock().close_write(),
            State::Terminating => {
                self.receiving.lock().close_read();
                self.sending.lock().close_write();
                self.ping_updater.set_interval(TERMINATING_PING_INTERVAL);
            }
            State::PeerTerminating => {
                self.sending.lock().close_write();
                self.ping_updater.set_interval(TERMINATING_PING_INTERVAL);
            }
            State::Terminated => {
                self.receiving.lock().close_read();
                self.sending.lock().close_write();
                self.data_input.notify_waiters();
                self.data_input.notify_one();
                self.data_output.notify_waiters();
                self.data_output.notify_one();
                self.data_updater.wake();
                self.ping_updater.wake();
                if !self.terminated_once.swap(true, Ordering::AcqRel) {
                    if let Some(observer) = self.observer.lock().take() {
                        observer.on_terminated(self.conv, self.remote_addr, self.reusable());
                    }
                }
            }
        }
    }

    fn handle_close_option(&self, option: u8) {
        if option & SEGMENT_OPTION_CLOSE == 0 {
            return;
        }
        match self.state() {
            State::Active => self.set_state(State::PeerClosed),
            State::ReadyToClose => self.set_state(State::Terminating),
            _ => {}
        }
    }

    fn handle_terminate_command(&self) {
        match self.state() {
            State::Active | State::PeerClosed => self.set_state(State::PeerTerminating),
            State::ReadyToClose => self.set_state(State::Terminating),
            State::Terminating => self.set_state(State::Terminated),
            _ => {}
        }
    }

    /// Feed one authenticated UDP payload into the state machine. Called
    /// from the demultiplexer; malformed trailing bytes end the parse
    /// loop silently.
    pub fn input(&self, mut data: &[u8]) {
        let current = self.elapsed();
        self.last_incoming_time.store(current, Ordering::Relaxed);

        while let Some((segment, rest)) = read_segment(data) {
            data = rest;
            if segment.conversation() != self.conv {
                return;
            }
            let option = segment.option();
            match segment {
                Segment::Data(seg) => {
                    trace!("kcp: connection {} data segment {}", self.conv, seg.number);
                    self.handle_close_option(option);
                    self.last_payload_time.store(current, Ordering::Relaxed);
                    self.receiving.lock().process_segment(seg);
                    self.data_input.notify_one();
                    self.data_updater.wake();
                }
                Segment::Ack(seg) => {
                    self.handle_close_option(option);
                    self.last_payload_time.store(current, Ordering::Relaxed);
                    let samples = self.sending.lock().process_segment(current, &seg);
                    {
                        let mut round_trip = self.round_trip.lock();
                        for rtt in samples {
                            round_trip.update(rtt, current);
                        }
                    }
                    self.data_output.notify_one();
                    self.data_updater.wake();
                }
                Segment::Cmd(seg) => {
                    self.handle_close_option(option);
                    if seg.command == Command::Terminate {
                        self.handle_terminate_command();
                    }
                    self.sending.lock().process_receiving_next(seg.receiving_next);
                    self.receiving.lock().process_sending_next(seg.sending_next);
                    self.round_trip.lock().update_peer_rto(seg.peer_rto, current);
                }
            }
        }
    }

    /// Read the next chunk of in-order payload. `Ok(None)` is end of
    /// stream; [`KcpError::IoTimeout`] leaves buffered data intact.
    pub async fn read(&self) -> Result<Option<MultiBuffer>, KcpError> {
        loop {
            match self.state() {
                State::ReadyToClose | State::Terminating | State::Terminated => {
                    return Ok(None);
                }
                _ => {}
            }
            let data = self.receiving.lock().read();
            if !data.is_empty() {
                return Ok(Some(data));
            }
            if self.state() == State::PeerTerminating {
                return Ok(None);
            }

            let deadline = *self.read_deadline.lock();
            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, self.data_input.notified())
                        .await
                        .is_err()
                    {
                        return Err(KcpError::IoTimeout);
                    }
                }
                None => self.data_input.notified().await,
            }
        }
    }

    /// Write payload, blocking while the sending queue is full. Consumes
    /// the buffers; fails once the connection left `Active`.
    pub async fn write(&self, data: MultiBuffer) -> Result<(), KcpError> {
        let mut data = data;
        loop {
            if self.state() != State::Active {
                data.release();
                return Err(KcpError::ClosedConnection);
            }
            let accepted = self.sending.lock().push(&mut data);
            if accepted > 0 {
                self.data_updater.wake();
            }
            if data.is_empty() {
                return Ok(());
            }

            let deadline = *self.write_deadline.lock();
            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, self.data_output.notified())
                        .await
                        .is_err()
                    {
                        data.release();
                        return Err(KcpError::IoTimeout);
                    }
                }
                None => self.data_output.notified().await,
            }
        }
    }

    /// Bound how long [`read`](Connection::read) may wait.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<(), KcpError> {
        if self.state() != State::Active {
            return Err(KcpError::ClosedConnection);
        }
        *self.read_deadline.lock() = deadline;
        Ok(())
    }

    /// Bound how long [`write`](Connection::write) may wait.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<(), KcpError> {
        if self.state() != State::Active {
            return Err(KcpError::ClosedConnection);
        }
        *self.write_deadline.lock() = deadline;
        Ok(())
    }

    /// Begin a graceful close. Non-blocking: the updaters run the
    /// handshake to completion.
    pub fn close(&self) -> Result<(), KcpError> {
        self.data_input.notify_waiters();
        self.data_output.notify_waiters();

        match self.state() {
            State::ReadyToClose | State::Terminating | State::Terminated => {
                Err(KcpError::ClosedConnection)
            }
            State::Active => {
                debug!("kcp: closing connection {} to {}", self.conv, self.remote_addr);
                self.set_state(State::ReadyToClose);
                self.data_updater.wake();
                self.ping_updater.wake();
                Ok(())
            }
            State::PeerClosed => {
                self.set_state(State::Terminating);
                self.ping_updater.wake();
                Ok(())
            }
            State::PeerTerminating => {
                self.set_state(State::Terminated);
                Ok(())
            }
        }
    }

    /// Force the state machine to `Terminated` immediately.
    pub fn terminate(&self) {
        if self.state() != State::Terminated {
            self.set_state(State::Terminated);
        }
    }

    /// One pass of the timer-driven engine: idle detection, close
    /// handshake progress, ack and data emission, keep-alive.
    async fn flush(&self) {
        let current = self.elapsed();
        let state = self.state();
        if state == State::Terminated {
            return;
        }

        if state == State::Active
            && time_diff(current, self.last_payload_time.load(Ordering::Relaxed)) >= IDLE_TIMEOUT as i32
        {
            let _ = self.close();
        }

        if self.state() == State::ReadyToClose && self.sending.lock().is_empty() {
            // the close-flagged ping must reach the wire before the first
            // Terminate, so the peer sees the half-close
            self.send_command(Command::Ping, current);
            self.set_state(State::Terminating);
        }

        match self.state() {
            State::Terminating => {
                let begin = self.state_begin_time.load(Ordering::Acquire);
                self.send_command(Command::Terminate, current);
                self.transmit().await;
                if time_diff(current, begin) > TERMINATING_TIMEOUT as i32 {
                    self.set_state(State::Terminated);
                }
                return;
            }
            State::PeerTerminating => {
                let begin = self.state_begin_time.load(Ordering::Acquire);
                if time_diff(current, begin) > PEER_TERMINATING_TIMEOUT as i32 {
                    self.set_state(State::Terminating);
                }
            }
            State::ReadyToClose => {
                let begin = self.state_begin_time.load(Ordering::Acquire);
                if time_diff(current, begin) > READY_TO_CLOSE_TIMEOUT as i32 {
                    self.set_state(State::Terminating);
                }
            }
            _ => {}
        }

        let mut dirty = false;
        {
            let mut receiving = self.receiving.lock();
            dirty |= receiving.is_updated();
            if let Some(ack) = receiving.flush(current) {
                self.output.lock().write(&ack);
            }
            receiving.clear_updated();
        }
        {
            let rto = self.round_trip.lock().timeout();
            let mut sending = self.sending.lock();
            dirty |= sending.is_updated();
            let mut output = self.output.lock();
            sending.flush(current, rto, |seg| output.write(seg));
        }

        let ping_due = time_diff(
            current,
            self.last_ping_time.load(Ordering::Relaxed).wrapping_add(PING_INTERVAL),
        ) >= 0;
        if dirty || ping_due {
            self.send_command(Command::Ping, current);
        }

        self.transmit().await;
    }

    fn send_command(&self, command: Command, current: u32) {
        let segment = CmdOnlySegment {
            conv: self.conv,
            option: if self.state() == State::ReadyToClose {
                SEGMENT_OPTION_CLOSE
            } else {
                0
            },
            command,
            sending_next: self.sending.lock().first_unacknowledged(),
            receiving_next: self.receiving.lock().next_number(),
            peer_rto: self.round_trip.lock().timeout(),
        };
        self.output.lock().write(&segment);
        self.last_ping_time.store(current, Ordering::Relaxed);
    }

    async fn transmit(&self) {
        let ready = self.output.lock().take_ready();
        for mut datagram in ready {
            if let Err(err) = self.link.send(datagram.bytes()).await {
                // transient datagram loss is the protocol's business to
                // absorb, not a reason to tear the connection
                debug!("kcp: connection {} send failed: {}", self.conv, err);
            }
            datagram.release();
        }
    }

    /// Current retransmission timeout, for tests and diagnostics.
    #[must_use]
    pub fn retransmission_timeout(&self) -> u32 {
        self.round_trip.lock().timeout()
    }

    /// Whether nothing is queued or in flight on the sending side.
    #[must_use]
    pub fn sending_idle(&self) -> bool {
        self.sending.lock().is_empty()
    }

    /// Maximum per-segment payload on this connection.
    #[must_use]
    pub fn mss(&self) -> usize {
        self.mss
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!("kcp: connection {} dropped", self.conv);
    }
}
