//! Control session: handshake state and response demultiplexing.
//!
//! Incoming frames carry no request IDs; they are routed by ApiType alone,
//! relying on the discipline that at most one Auth and one Info request is
//! in flight (the handshake is a strict sequence, and both channel
//! receivers sit behind a mutex). The channels are buffered to 100 so the
//! receive loop never blocks on a redundant or duplicated response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::auth::{SessionUser, User};
use crate::contract::{auth_command_data, ApiType, FileServerInfo, Message, Status, INFO_COMMAND};
use crate::protocol::{code, timeouts};
use crate::retry::Retry;
use crate::transport::TranClient;

const RESPONSE_CHANNEL_CAP: usize = 100;

/// Where a received frame went.
#[derive(Debug)]
pub enum Dispatched {
    /// Routed onto the auth channel.
    Auth,
    /// Routed onto the info channel.
    Info,
    /// A sync message; the caller owns enqueueing (monitor side only).
    Sync(Message),
    /// The peer rejected a streaming operation for lack of auth;
    /// re-login in place without tearing the connection down.
    Unauthorized,
    /// Unknown or unparseable; logged and dropped.
    Discarded,
}

pub struct ControlSession {
    client: Arc<TranClient>,
    user: Option<parking_lot::Mutex<SessionUser>>,
    authorized: AtomicBool,
    auth_tx: mpsc::Sender<Status>,
    auth_rx: tokio::sync::Mutex<mpsc::Receiver<Status>>,
    info_tx: mpsc::Sender<Message>,
    info_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    handshake_timeout: Duration,
    auth_time: parking_lot::Mutex<Option<Instant>>,
    retry: Retry,
}

impl ControlSession {
    pub fn new(client: Arc<TranClient>, users: Vec<User>, retry: Retry) -> Self {
        let (auth_tx, auth_rx) = mpsc::channel(RESPONSE_CHANNEL_CAP);
        let (info_tx, info_rx) = mpsc::channel(RESPONSE_CHANNEL_CAP);
        Self {
            client,
            // only the first configured user authenticates this session
            user: users.into_iter().next().map(|u| parking_lot::Mutex::new(SessionUser::new(u))),
            authorized: AtomicBool::new(false),
            auth_tx,
            auth_rx: tokio::sync::Mutex::new(auth_rx),
            info_tx,
            info_rx: tokio::sync::Mutex::new(info_rx),
            handshake_timeout: timeouts::HANDSHAKE,
            auth_time: parking_lot::Mutex::new(None),
            retry,
        }
    }

    /// Shrink the handshake timeout; used by tests.
    pub fn with_handshake_timeout(mut self, t: Duration) -> Self {
        self.handshake_timeout = t;
        self
    }

    pub fn client(&self) -> &Arc<TranClient> {
        &self.client
    }

    pub fn has_user(&self) -> bool {
        self.user.is_some()
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    pub fn set_authorized(&self, v: bool) {
        self.authorized.store(v, Ordering::SeqCst);
    }

    pub fn auth_time(&self) -> Option<Instant> {
        *self.auth_time.lock()
    }

    /// Classify one received frame. The receive loop is the only caller.
    pub fn dispatch(&self, data: Vec<u8>) -> Dispatched {
        let status: Status = match serde_json::from_slice(&data) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "unmarshal received frame error");
                return Dispatched::Discarded;
            }
        };
        if status.code == code::UNAUTHORIZED && status.api_type != ApiType::Auth {
            return Dispatched::Unauthorized;
        }
        match status.api_type {
            ApiType::Auth => {
                // non-blocking: drop redundant replies rather than stall the reader
                let _ = self.auth_tx.try_send(status);
                Dispatched::Auth
            }
            ApiType::Info => {
                let _ = self.info_tx.try_send(Message::new(data));
                Dispatched::Info
            }
            ApiType::SyncMessage => Dispatched::Sync(Message::new(data)),
            ApiType::Unknown => {
                tracing::warn!(
                    frame = %String::from_utf8_lossy(&data),
                    "received an unknown frame, discarded"
                );
                Dispatched::Discarded
            }
        }
    }

    /// Send the auth command and wait for the reply. Anonymous sessions
    /// (no configured user) skip straight to success.
    pub async fn auth(&self) -> Result<()> {
        let Some(user) = &self.user else {
            return Ok(());
        };
        let data = {
            let mut u = user.lock();
            auth_command_data(u.refreshed())?
        };

        // The write runs in the background under retry while we wait on the
        // channel, so a fast reply cannot be missed.
        let client = self.client.clone();
        let retry = self.retry.clone();
        tokio::spawn(async move {
            let res = retry
                .do_retry(
                    || {
                        let client = client.clone();
                        let data = data.clone();
                        async move { client.write(&data).await }
                    },
                    "send auth request",
                )
                .await;
            if let Err(e) = res {
                tracing::error!(error = %e, "send auth request error");
            }
        });

        let status = {
            let mut rx = self.auth_rx.lock().await;
            timeout(self.handshake_timeout, rx.recv())
                .await
                .map_err(|_| anyhow!("auth timeout for {:?}", self.handshake_timeout))?
                .ok_or_else(|| anyhow!("auth channel closed"))?
        };
        if !status.is_success() {
            bail!("receive auth command response error => {}", status.message);
        }

        self.set_authorized(true);
        *self.auth_time.lock() = Some(Instant::now());
        tracing::info!(message = %status.message, "auth success, current client is authorized");
        Ok(())
    }

    /// Send the info command and wait for the FileServerInfo reply.
    pub async fn fetch_info(&self) -> Result<FileServerInfo> {
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.write(INFO_COMMAND).await {
                tracing::error!(error = %e, "write info command error");
            }
        });

        let msg = {
            let mut rx = self.info_rx.lock().await;
            timeout(self.handshake_timeout, rx.recv())
                .await
                .map_err(|_| anyhow!("info timeout for {:?}", self.handshake_timeout))?
                .ok_or_else(|| anyhow!("info channel closed"))?
        };
        let info: FileServerInfo = serde_json::from_slice(&msg.data)?;
        if !info.status.is_success() {
            bail!("receive info command response error => {}", info.status.message);
        }
        Ok(info)
    }
}
