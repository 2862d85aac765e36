//! In-memory relay for unit tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

use crate::relaytun::tunnel::{
    client::ClientOptions,
    protocol::{CloseCode, Frame, MAX_DATA_PAYLOAD, RelayCodec, encode_frame},
    transport::{BoxedLink, DialRequest, LinkError, RelayDialer, RelayLink},
};

/// Fault plan applied by the mock relay.
#[derive(Debug, Clone)]
pub(crate) struct RelayPlan {
    pub handshake_delay: Duration,
    /// Reject this many connect handshakes with NOT_AUTHORIZED.
    pub deny_connects: u32,
    /// Refuse this many dials outright.
    pub unreachable_dials: u32,
    /// Absolute inbound offsets at which the link is cut after acking up to the offset.
    pub drop_at: Vec<u64>,
    pub expire_sessions: bool,
    pub echo: bool,
    pub ack_data: bool,
    pub greeting: Option<Bytes>,
}

impl Default for RelayPlan {
    fn default() -> Self {
        Self {
            handshake_delay: Duration::ZERO,
            deny_connects: 0,
            unreachable_dials: 0,
            drop_at: Vec::new(),
            expire_sessions: false,
            echo: false,
            ack_data: true,
            greeting: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SessionLog {
    pub received: Vec<u8>,
    pub sent: Vec<u8>,
    pub client_acked: u64,
}

#[derive(Default)]
struct RelayState {
    plan: RelayPlan,
    dials: u32,
    handshakes: u32,
    pings: u32,
    tokens: Vec<String>,
    resumes: Vec<(String, u64, u64)>,
    sessions: HashMap<String, SessionLog>,
    links: HashMap<String, mpsc::UnboundedSender<Wire>>,
    next_sid: u32,
    drops_done: usize,
}

#[derive(Clone)]
pub(crate) struct MockRelay {
    state: Arc<Mutex<RelayState>>,
}

enum Wire {
    Msg(Bytes),
    Ping,
    Close(Option<u32>, String),
}

impl MockRelay {
    pub fn new(plan: RelayPlan) -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                plan,
                ..RelayState::default()
            })),
        }
    }

    pub fn dialer(&self) -> Arc<dyn RelayDialer> {
        Arc::new(self.clone())
    }

    pub fn update(&self, f: impl FnOnce(&mut RelayPlan)) {
        f(&mut self.state.lock().unwrap().plan);
    }

    pub fn dials(&self) -> u32 {
        self.state.lock().unwrap().dials
    }

    pub fn handshakes(&self) -> u32 {
        self.state.lock().unwrap().handshakes
    }

    pub fn pings(&self) -> u32 {
        self.state.lock().unwrap().pings
    }

    pub fn tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().tokens.clone()
    }

    pub fn resumes(&self) -> Vec<(String, u64, u64)> {
        self.state.lock().unwrap().resumes.clone()
    }

    pub fn session(&self, sid: &str) -> Option<SessionLog> {
        self.state.lock().unwrap().sessions.get(sid).cloned()
    }

    pub fn received(&self, sid: &str) -> Vec<u8> {
        self.session(sid).map(|s| s.received).unwrap_or_default()
    }

    pub fn total_received(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.sessions.values().map(|s| s.received.len()).sum()
    }

    pub fn has_open_link(&self, sid: &str) -> bool {
        self.state.lock().unwrap().links.contains_key(sid)
    }

    /// Sends data from the far end to the client over the session's current link.
    pub fn push(&self, sid: &str, data: &[u8]) {
        let mut st = self.state.lock().unwrap();
        let Some(tx) = st.links.get(sid).cloned() else {
            panic!("no open link for {sid}");
        };
        for chunk in data.chunks(MAX_DATA_PAYLOAD) {
            let _ = tx.send(Wire::Msg(frame(Frame::Data(Bytes::copy_from_slice(chunk)))));
        }
        if let Some(s) = st.sessions.get_mut(sid) {
            s.sent.extend_from_slice(data);
        }
    }

    /// Sends a long-close frame on the session's current link.
    pub fn close_session(&self, sid: &str, code: CloseCode, reason: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(tx) = st.links.remove(sid) {
            let _ = tx.send(Wire::Msg(frame(Frame::Close {
                code,
                reason: reason.to_string(),
            })));
        }
    }

    /// Cuts the session's current link without a close code.
    pub fn cut(&self, sid: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(tx) = st.links.remove(sid) {
            let _ = tx.send(Wire::Close(None, "cut".into()));
        }
    }
}

fn frame(f: Frame) -> Bytes {
    encode_frame(f).expect("mock relay frame encodes")
}

#[async_trait]
impl RelayDialer for MockRelay {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn dial(&self, req: &DialRequest) -> Result<BoxedLink, LinkError> {
        {
            let mut st = self.state.lock().unwrap();
            st.dials += 1;
            if st.plan.unreachable_dials > 0 {
                st.plan.unreachable_dials -= 1;
                return Err(LinkError::Unreachable("mock relay refused".into()));
            }
            st.tokens.push(req.bearer_token.clone());
        }

        let (c2s_tx, c2s_rx) = mpsc::unbounded_channel();
        let (s2c_tx, s2c_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve_link(self.clone(), c2s_rx, s2c_tx));
        Ok(Box::new(MemoryLink {
            tx: c2s_tx,
            rx: s2c_rx,
        }))
    }
}

struct MemoryLink {
    tx: mpsc::UnboundedSender<Wire>,
    rx: mpsc::UnboundedReceiver<Wire>,
}

#[async_trait]
impl RelayLink for MemoryLink {
    async fn send(&mut self, msg: Bytes) -> Result<(), LinkError> {
        self.tx
            .send(Wire::Msg(msg))
            .map_err(|_| LinkError::Io("mock link closed".into()))
    }

    async fn recv(&mut self) -> Result<Bytes, LinkError> {
        loop {
            match self.rx.recv().await {
                Some(Wire::Msg(b)) => return Ok(b),
                Some(Wire::Ping) => continue,
                Some(Wire::Close(code, reason)) => return Err(LinkError::Closed { code, reason }),
                None => {
                    return Err(LinkError::Closed {
                        code: None,
                        reason: "mock link dropped".into(),
                    });
                }
            }
        }
    }

    async fn ping(&mut self) -> Result<(), LinkError> {
        self.tx
            .send(Wire::Ping)
            .map_err(|_| LinkError::Io("mock link closed".into()))
    }

    async fn close(&mut self) {
        let _ = self.tx.send(Wire::Close(Some(1000), String::new()));
    }
}

enum Step {
    Continue,
    End,
}

async fn serve_link(
    relay: MockRelay,
    mut from_client: mpsc::UnboundedReceiver<Wire>,
    to_client: mpsc::UnboundedSender<Wire>,
) {
    let mut rx = BytesMut::new();
    let mut sid: Option<String> = None;

    'link: while let Some(w) = from_client.recv().await {
        let b = match w {
            Wire::Msg(b) => b,
            Wire::Ping => {
                relay.state.lock().unwrap().pings += 1;
                continue;
            }
            Wire::Close(..) => break,
        };
        rx.extend_from_slice(&b);

        while let Some(f) = RelayCodec.decode(&mut rx).expect("client sent a malformed frame") {
            let step = match f {
                Frame::ConnectRequest { .. } => {
                    let delay = {
                        let mut st = relay.state.lock().unwrap();
                        st.handshakes += 1;
                        st.plan.handshake_delay
                    };
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    on_connect(&relay, &to_client, &mut sid)
                }
                Frame::ReconnectRequest {
                    session_id,
                    ack_offset,
                    bytes_received,
                } => on_reconnect(
                    &relay,
                    &to_client,
                    &mut sid,
                    session_id,
                    ack_offset,
                    bytes_received,
                ),
                Frame::Data(payload) => on_data(&relay, &to_client, sid.as_deref(), payload),
                Frame::Ack(n) => {
                    let mut st = relay.state.lock().unwrap();
                    if let Some(s) = sid.as_ref().and_then(|id| st.sessions.get_mut(id)) {
                        s.client_acked = n;
                    }
                    Step::Continue
                }
                other => panic!("mock relay got unexpected {} frame", other.kind()),
            };
            if let Step::End = step {
                break 'link;
            }
        }
    }

    if let Some(id) = sid {
        let mut st = relay.state.lock().unwrap();
        if st.links.get(&id).is_some_and(|tx| tx.same_channel(&to_client)) {
            st.links.remove(&id);
        }
    }
}

fn on_connect(
    relay: &MockRelay,
    to_client: &mpsc::UnboundedSender<Wire>,
    sid: &mut Option<String>,
) -> Step {
    let mut st = relay.state.lock().unwrap();
    if st.plan.deny_connects > 0 {
        st.plan.deny_connects -= 1;
        let _ = to_client.send(Wire::Msg(frame(Frame::Close {
            code: CloseCode::NOT_AUTHORIZED,
            reason: "caller lacks tunnel permission".into(),
        })));
        return Step::End;
    }

    st.next_sid += 1;
    let id = format!("S{}", st.next_sid);
    let mut log = SessionLog::default();
    let _ = to_client.send(Wire::Msg(frame(Frame::ConnectSuccess {
        session_id: id.clone(),
    })));
    if let Some(g) = st.plan.greeting.clone() {
        let _ = to_client.send(Wire::Msg(frame(Frame::Data(g.clone()))));
        log.sent.extend_from_slice(&g);
    }
    st.sessions.insert(id.clone(), log);
    st.links.insert(id.clone(), to_client.clone());
    *sid = Some(id);
    Step::Continue
}

fn on_reconnect(
    relay: &MockRelay,
    to_client: &mpsc::UnboundedSender<Wire>,
    sid: &mut Option<String>,
    session_id: String,
    ack_offset: u64,
    bytes_received: u64,
) -> Step {
    let mut st = relay.state.lock().unwrap();
    st.resumes
        .push((session_id.clone(), ack_offset, bytes_received));

    let expired = st.plan.expire_sessions;
    let Some(log) = st.sessions.get(&session_id).filter(|_| !expired).cloned() else {
        let _ = to_client.send(Wire::Msg(frame(Frame::Close {
            code: CloseCode::SID_UNKNOWN,
            reason: "unknown session".into(),
        })));
        return Step::End;
    };

    let _ = to_client.send(Wire::Msg(frame(Frame::ReconnectSuccess {
        ack_offset: log.received.len() as u64,
    })));
    let from = (bytes_received as usize).min(log.sent.len());
    for chunk in log.sent[from..].chunks(MAX_DATA_PAYLOAD) {
        let _ = to_client.send(Wire::Msg(frame(Frame::Data(Bytes::copy_from_slice(chunk)))));
    }
    st.links.insert(session_id.clone(), to_client.clone());
    *sid = Some(session_id);
    Step::Continue
}

fn on_data(
    relay: &MockRelay,
    to_client: &mpsc::UnboundedSender<Wire>,
    sid: Option<&str>,
    payload: Bytes,
) -> Step {
    let mut st = relay.state.lock().unwrap();
    let Some(id) = sid else {
        panic!("data before handshake");
    };
    let cut = st.plan.drop_at.get(st.drops_done).copied();
    let plan = st.plan.clone();
    let Some(log) = st.sessions.get_mut(id) else {
        return Step::End;
    };

    let start = log.received.len() as u64;
    let end = start + payload.len() as u64;
    if let Some(cut) = cut.filter(|c| *c < end) {
        let keep = cut.saturating_sub(start) as usize;
        log.received.extend_from_slice(&payload[..keep]);
        if plan.echo && keep > 0 {
            log.sent.extend_from_slice(&payload[..keep]);
            let _ = to_client.send(Wire::Msg(frame(Frame::Data(payload.slice(..keep)))));
        }
        let acked = log.received.len() as u64;
        if acked > 0 {
            let _ = to_client.send(Wire::Msg(frame(Frame::Ack(acked))));
        }
        st.drops_done += 1;
        return Step::End;
    }

    log.received.extend_from_slice(&payload);
    if plan.ack_data {
        let _ = to_client.send(Wire::Msg(frame(Frame::Ack(end))));
    }
    if plan.echo {
        log.sent.extend_from_slice(&payload);
        let _ = to_client.send(Wire::Msg(frame(Frame::Data(payload))));
    }
    Step::Continue
}

/// Client options with short timeouts for tests.
pub(crate) fn fast_options() -> ClientOptions {
    ClientOptions {
        handshake_timeout: Duration::from_millis(500),
        connect_attempts: 3,
        reconnect_attempts: 4,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        keepalive_interval: Duration::ZERO,
        send_high_water: 1 << 20,
        ack_threshold: 1 << 20,
    }
}

pub(crate) async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
