use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use async_trait::async_trait;
use wasm_bindgen::{closure::Closure, JsCast};
use web_sys::{CloseEvent, ErrorEvent, MessageEvent, WebSocket};

use crate::error::{CoreError, Result};
use crate::signer::SignedEvent;
use crate::store::EventStore;
use crate::types::{random_hex, CancelToken, Filter, NostrEvent};

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// 指数バックオフ管理
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current_delay: u32,
    max_delay: u32,
    min_delay: u32,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self {
            current_delay: 1,
            max_delay: 60,
            min_delay: 1,
        }
    }

    pub fn next_delay(&mut self) -> u32 {
        let delay = self.current_delay;
        self.current_delay = (self.current_delay * 2).min(self.max_delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current_delay = self.min_delay;
    }
}

/// Relay接続
pub struct RelayConnection {
    pub url: String,
    ws: Option<WebSocket>,
    state: Rc<RefCell<ConnectionState>>,
    backoff: ExponentialBackoff,
    retry_delay: f64,
    last_connect_attempt: f64,
    message_queue: Rc<RefCell<Vec<RelayMessage>>>,
    // クロージャを保持してドロップされないようにする
    _on_open: Option<Closure<dyn FnMut()>>,
    _on_message: Option<Closure<dyn FnMut(MessageEvent)>>,
    _on_error: Option<Closure<dyn FnMut(ErrorEvent)>>,
    _on_close: Option<Closure<dyn FnMut(CloseEvent)>>,
}

impl RelayConnection {
    pub fn new(url: String) -> Self {
        Self {
            url,
            ws: None,
            state: Rc::new(RefCell::new(ConnectionState::Disconnected)),
            backoff: ExponentialBackoff::new(),
            retry_delay: 0.0,
            last_connect_attempt: 0.0,
            message_queue: Rc::new(RefCell::new(Vec::new())),
            _on_open: None,
            _on_message: None,
            _on_error: None,
            _on_close: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    /// 接続試行
    pub async fn connect(&mut self) -> Result<()> {
        let current_state = *self.state.borrow();
        if current_state == ConnectionState::Connecting
            || current_state == ConnectionState::Connected
        {
            return Ok(());
        }

        *self.state.borrow_mut() = ConnectionState::Connecting;
        self.retry_delay = self.backoff.next_delay() as f64;
        self.last_connect_attempt = now_seconds();

        let ws = WebSocket::new(&self.url)?;
        ws.set_binary_type(web_sys::BinaryType::Arraybuffer);

        // 状態を共有
        let state = self.state.clone();
        let message_queue = self.message_queue.clone();
        let url = self.url.clone();

        // onopen ハンドラー
        {
            let state = state.clone();
            let url = url.clone();
            let on_open = Closure::wrap(Box::new(move || {
                log::info!("WebSocket connected to {}", url);
                *state.borrow_mut() = ConnectionState::Connected;
            }) as Box<dyn FnMut()>);
            ws.set_onopen(Some(on_open.as_ref().unchecked_ref()));
            self._on_open = Some(on_open);
        }

        // onmessage ハンドラー
        {
            let message_queue = message_queue.clone();
            let on_message = Closure::wrap(Box::new(move |event: MessageEvent| {
                if let Some(text) = event.data().as_string() {
                    match RelayMessage::parse(&text) {
                        Ok(msg) => {
                            message_queue.borrow_mut().push(msg);
                        }
                        Err(e) => {
                            log::warn!("Failed to parse relay message: {:?}", e);
                        }
                    }
                }
            }) as Box<dyn FnMut(MessageEvent)>);
            ws.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
            self._on_message = Some(on_message);
        }

        // onerror ハンドラー
        {
            let url = url.clone();
            let on_error = Closure::wrap(Box::new(move |_event: ErrorEvent| {
                log::error!("WebSocket error on {}", url);
            }) as Box<dyn FnMut(ErrorEvent)>);
            ws.set_onerror(Some(on_error.as_ref().unchecked_ref()));
            self._on_error = Some(on_error);
        }

        // onclose ハンドラー
        {
            let state = state.clone();
            let url = url.clone();
            let on_close = Closure::wrap(Box::new(move |_event: CloseEvent| {
                log::info!("WebSocket closed for {}", url);
                *state.borrow_mut() = ConnectionState::Disconnected;
            }) as Box<dyn FnMut(CloseEvent)>);
            ws.set_onclose(Some(on_close.as_ref().unchecked_ref()));
            self._on_close = Some(on_close);
        }

        self.ws = Some(ws);
        Ok(())
    }

    /// メッセージ送信
    pub fn send(&self, msg: &str) -> Result<()> {
        if let Some(ws) = &self.ws {
            if *self.state.borrow() == ConnectionState::Connected {
                ws.send_with_str(msg)?;
                return Ok(());
            }
        }
        Err(CoreError::RelayError(format!("{} is not connected", self.url)))
    }

    /// 受信メッセージを取得（キューをクリア）
    pub fn drain_messages(&self) -> Vec<RelayMessage> {
        self.message_queue.borrow_mut().drain(..).collect()
    }

    /// 再接続が必要か
    pub fn needs_reconnect(&self) -> bool {
        if *self.state.borrow() == ConnectionState::Connected {
            return false;
        }

        let elapsed = now_seconds() - self.last_connect_attempt;
        elapsed >= self.retry_delay
    }

    /// 接続成功後にバックオフを初期化
    pub fn reset_backoff(&mut self) {
        self.backoff.reset();
    }
}

/// Relayメッセージ型
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event { sub_id: String, event: NostrEvent },
    Eose { sub_id: String },
    Ok { event_id: String, accepted: bool, message: String },
    Notice { message: String },
}

impl RelayMessage {
    /// JSONからパース
    pub fn parse(json: &str) -> Result<Self> {
        let arr: Vec<serde_json::Value> = serde_json::from_str(json)?;

        if arr.is_empty() {
            return Err(CoreError::ParseError("Empty message array".to_string()));
        }

        let msg_type = arr[0]
            .as_str()
            .ok_or_else(|| CoreError::ParseError("Message type not a string".to_string()))?;

        match msg_type {
            "EVENT" => {
                if arr.len() < 3 {
                    return Err(CoreError::ParseError("Invalid EVENT message".to_string()));
                }
                let sub_id = arr[1]
                    .as_str()
                    .ok_or_else(|| CoreError::ParseError("sub_id not a string".to_string()))?
                    .to_string();
                let event: NostrEvent = serde_json::from_value(arr[2].clone())?;
                Ok(RelayMessage::Event { sub_id, event })
            }
            "EOSE" => {
                if arr.len() < 2 {
                    return Err(CoreError::ParseError("Invalid EOSE message".to_string()));
                }
                let sub_id = arr[1]
                    .as_str()
                    .ok_or_else(|| CoreError::ParseError("sub_id not a string".to_string()))?
                    .to_string();
                Ok(RelayMessage::Eose { sub_id })
            }
            "OK" => {
                if arr.len() < 4 {
                    return Err(CoreError::ParseError("Invalid OK message".to_string()));
                }
                let event_id = arr[1]
                    .as_str()
                    .ok_or_else(|| CoreError::ParseError("event_id not a string".to_string()))?
                    .to_string();
                let accepted = arr[2]
                    .as_bool()
                    .ok_or_else(|| CoreError::ParseError("accepted not a bool".to_string()))?;
                let message = arr[3].as_str().unwrap_or("").to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "NOTICE" => {
                if arr.len() < 2 {
                    return Err(CoreError::ParseError("Invalid NOTICE message".to_string()));
                }
                let message = arr[1]
                    .as_str()
                    .ok_or_else(|| CoreError::ParseError("message not a string".to_string()))?
                    .to_string();
                Ok(RelayMessage::Notice { message })
            }
            _ => Err(CoreError::ParseError(format!(
                "Unknown message type: {}",
                msg_type
            ))),
        }
    }
}

/// 問い合わせ毎の受信箱
#[derive(Default)]
struct SubInbox {
    events: Vec<NostrEvent>,
    seen: HashSet<String>,
    eose_count: usize,
    expected_eose: usize,
}

/// Relay群に対するEventStore実装
///
/// 1問い合わせ = 1サブスクリプション。EOSEが揃うかタイムアウトで完了し、
/// 複数の問い合わせが同時に走ってもsub_id毎に受信箱へ振り分ける
pub struct RelayPool {
    relays: RefCell<Vec<RelayConnection>>,
    inboxes: RefCell<HashMap<String, SubInbox>>,
    acks: RefCell<HashMap<String, (bool, String)>>,
}

impl RelayPool {
    pub fn new(relay_urls: Vec<String>) -> Self {
        let relays = relay_urls.into_iter().map(RelayConnection::new).collect();
        Self {
            relays: RefCell::new(relays),
            inboxes: RefCell::new(HashMap::new()),
            acks: RefCell::new(HashMap::new()),
        }
    }

    /// 全Relayに接続
    pub async fn connect_all(&self) {
        let mut relays = self.relays.borrow_mut();
        for relay in relays.iter_mut() {
            if let Err(e) = relay.connect().await {
                log::error!("Failed to connect to {}: {:?}", relay.url, e);
            }
        }
    }

    /// 定期処理（再接続チェック）
    pub async fn maintain(&self) {
        let mut relays = self.relays.borrow_mut();
        for relay in relays.iter_mut() {
            if relay.is_connected() {
                relay.reset_backoff();
            } else if relay.needs_reconnect() {
                log::info!("Reconnecting to {}", relay.url);
                if let Err(e) = relay.connect().await {
                    log::error!("Failed to connect to {}: {:?}", relay.url, e);
                }
            }
        }
    }

    pub fn connected_count(&self) -> usize {
        self.relays.borrow().iter().filter(|r| r.is_connected()).count()
    }

    /// 受信メッセージをsub_id毎の受信箱へ振り分け
    fn pump(&self) {
        let mut messages = Vec::new();
        {
            let relays = self.relays.borrow();
            for relay in relays.iter() {
                messages.extend(relay.drain_messages());
            }
        }

        for msg in messages {
            match msg {
                RelayMessage::Event { sub_id, event } => {
                    if let Some(inbox) = self.inboxes.borrow_mut().get_mut(&sub_id) {
                        // 複数Relayから届く同一イベントはIDで重複排除
                        if inbox.seen.insert(event.id.clone()) {
                            inbox.events.push(event);
                        }
                    }
                }
                RelayMessage::Eose { sub_id } => {
                    if let Some(inbox) = self.inboxes.borrow_mut().get_mut(&sub_id) {
                        inbox.eose_count += 1;
                    }
                }
                RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                } => {
                    self.acks.borrow_mut().insert(event_id, (accepted, message));
                }
                RelayMessage::Notice { message } => {
                    log::info!("Relay notice: {}", message);
                }
            }
        }
    }

    /// 接続済みRelayへ送信し、送れた本数を返す
    fn send_to_connected(&self, msg: &str) -> usize {
        let relays = self.relays.borrow();
        let mut sent = 0;
        for relay in relays.iter() {
            if relay.is_connected() {
                if let Err(e) = relay.send(msg) {
                    log::warn!("Failed to send to {}: {}", relay.url, e);
                } else {
                    sent += 1;
                }
            }
        }
        sent
    }
}

#[async_trait(?Send)]
impl EventStore for RelayPool {
    async fn query(
        &self,
        filters: &[Filter],
        timeout_ms: u32,
        cancel: &CancelToken,
    ) -> Result<Vec<NostrEvent>> {
        let sub_id = format!("q{}", random_hex(8)?);
        let mut req = vec![serde_json::json!("REQ"), serde_json::json!(sub_id)];
        for filter in filters {
            req.push(filter.to_json());
        }
        let req_json = serde_json::Value::Array(req).to_string();

        let sent = self.send_to_connected(&req_json);
        if sent == 0 {
            return Err(CoreError::Unavailable("no connected relays".to_string()));
        }
        self.inboxes.borrow_mut().insert(
            sub_id.clone(),
            SubInbox {
                expected_eose: sent,
                ..Default::default()
            },
        );

        let deadline = now_millis() + timeout_ms as f64;
        let outcome = loop {
            if cancel.is_cancelled() {
                break Err(CoreError::Cancelled);
            }
            self.pump();
            let done = self
                .inboxes
                .borrow()
                .get(&sub_id)
                .map(|i| i.eose_count >= i.expected_eose)
                .unwrap_or(true);
            if done {
                break Ok(());
            }
            if now_millis() >= deadline {
                break Err(CoreError::Unavailable(format!("query {} timed out", sub_id)));
            }
            sleep_ms(50).await;
        };

        let close = format!(r#"["CLOSE","{}"]"#, sub_id);
        let _ = self.send_to_connected(&close);
        let inbox = self.inboxes.borrow_mut().remove(&sub_id);

        outcome?;

        let mut events = inbox.map(|i| i.events).unwrap_or_default();
        events.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(events)
    }

    async fn publish(&self, event: &SignedEvent, timeout_ms: u32) -> Result<()> {
        let msg = format!(r#"["EVENT",{}]"#, event.to_json());
        let sent = self.send_to_connected(&msg);
        if sent == 0 {
            return Err(CoreError::Unavailable("no connected relays".to_string()));
        }

        let deadline = now_millis() + timeout_ms as f64;
        loop {
            self.pump();
            if let Some((accepted, message)) = self.acks.borrow_mut().remove(&event.id) {
                if accepted {
                    log::info!("Event {} accepted", event.id);
                    return Ok(());
                }
                log::warn!("Event {} rejected: {}", event.id, message);
                return Err(CoreError::PublishError(message));
            }
            if now_millis() >= deadline {
                return Err(CoreError::PublishError(format!(
                    "no OK received for event {}",
                    event.id
                )));
            }
            sleep_ms(50).await;
        }
    }
}

/// 現在時刻（秒）
fn now_seconds() -> f64 {
    now_millis() / 1000.0
}

/// 現在時刻（ミリ秒）
fn now_millis() -> f64 {
    #[cfg(target_arch = "wasm32")]
    {
        js_sys::Date::now()
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as f64)
            .unwrap_or(0.0)
    }
}

/// イベントループを塞がずに待つ
async fn sleep_ms(ms: i32) {
    #[cfg(target_arch = "wasm32")]
    {
        let promise = js_sys::Promise::new(&mut |resolve, _| {
            if let Some(window) = web_sys::window() {
                let _ = window
                    .set_timeout_with_callback_and_timeout_and_arguments_0(&resolve, ms);
            }
        });
        let _ = wasm_bindgen_futures::JsFuture::from(promise).await;
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }
}
