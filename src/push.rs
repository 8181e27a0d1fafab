//! Push-client synchronizer: local filesystem events become staged HTTP
//! uploads against the remote file server.
//!
//! The control connection is used for the handshake only (connect → auth →
//! info) and then closed; pushes go over HTTP with cookie auth and a single
//! auto-login retry on 401.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use walkdir::WalkDir;

use crate::auth::User;
use crate::checksum;
use crate::contract::{push, Action, ApiResult, FileInfo, FsDirValue, PushData};
use crate::file_list::file_times;
use crate::http::HttpClient;
use crate::ignore::IgnorePolicy;
use crate::retry::Retry;
use crate::session::{ControlSession, Dispatched};
use crate::syncer::Syncer;
use crate::transport::TranClient;
use crate::vfs::Vfs;

pub struct PushClientSync {
    source: Vfs,
    dest: Vfs,
    source_abs: PathBuf,
    session: Arc<ControlSession>,
    http: HttpClient,
    user: Option<User>,
    push_addr: parking_lot::Mutex<String>,
    /// Local mirror applied before each push when the destination has not
    /// disabled local sync. A mirror failure aborts the push (fail-closed).
    local: Option<Arc<dyn Syncer>>,
    ignore: Arc<dyn IgnorePolicy>,
}

impl PushClientSync {
    /// Build the client and run the handshake: connect → auth → info.
    /// On success the control connection is closed and the push address is
    /// ready.
    pub async fn connect(
        source: Vfs,
        dest: Vfs,
        users: Vec<User>,
        local: Option<Arc<dyn Syncer>>,
        ignore: Arc<dyn IgnorePolicy>,
        retry: Retry,
    ) -> Result<Arc<Self>> {
        let source_abs = source.abs().context("resolve source root")?;
        let client = TranClient::new(dest.host(), dest.port(), dest.tls());
        let user = users.first().cloned();
        let session = Arc::new(ControlSession::new(client, users, retry));

        let s = Arc::new(Self {
            source,
            dest,
            source_abs,
            session,
            http: HttpClient::new()?,
            user,
            push_addr: parking_lot::Mutex::new(String::new()),
            local,
            ignore,
        });
        s.start().await?;
        Ok(s)
    }

    pub fn source(&self) -> &Vfs {
        &self.source
    }

    pub fn dest(&self) -> &Vfs {
        &self.dest
    }

    pub fn push_addr(&self) -> String {
        self.push_addr.lock().clone()
    }

    async fn start(&self) -> Result<()> {
        self.session.client().connect().await?;
        Self::spawn_receive(self.session.clone());
        self.session.auth().await?;
        let info = self.session.fetch_info().await?;
        *self.push_addr.lock() = format!("{}{}", info.server_addr, info.push_addr);
        self.session.client().close().await
    }

    /// Handshake-only receive loop: routes auth and info replies, discards
    /// everything else, exits once the connection closes.
    fn spawn_receive(session: Arc<ControlSession>) {
        tokio::spawn(async move {
            loop {
                if session.client().is_closed() {
                    break;
                }
                match session.client().read_all().await {
                    Err(e) => {
                        if session.client().is_closed() {
                            break;
                        }
                        tracing::error!(error = %e, "push client read data error");
                    }
                    Ok(frame) => {
                        if let Dispatched::Sync(msg) = session.dispatch(frame) {
                            tracing::warn!(frame = %msg.preview(), "push client received and discarded data");
                        }
                    }
                }
            }
        });
    }

    fn local_mirror(&self) -> Option<&Arc<dyn Syncer>> {
        if self.dest.local_sync_disabled() {
            None
        } else {
            self.local.as_ref()
        }
    }

    async fn is_dir_path(&self, path: &Path) -> Result<bool> {
        let md = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("stat {}", path.display()))?;
        Ok(md.is_dir())
    }

    fn rel_path(&self, path: &Path) -> Result<String> {
        let rel = path
            .strip_prefix(&self.source_abs)
            .with_context(|| format!("{} is outside the source root", path.display()))?;
        Ok(rel.to_string_lossy().replace('\\', "/"))
    }

    async fn send(&self, act: Action, path: &Path) -> Result<()> {
        let mut is_dir = false;
        if act != Action::Remove && act != Action::Rename {
            is_dir = self.is_dir_path(path).await?;
        }

        let mut size: i64 = 0;
        let mut hash = String::new();
        if act == Action::Write {
            if is_dir {
                return Ok(());
            }
            let md = tokio::fs::metadata(path)
                .await
                .with_context(|| format!("stat {}", path.display()))?;
            size = md.len() as i64;
            if size > 0 {
                let p = path.to_path_buf();
                hash = tokio::task::spawn_blocking(move || checksum::md5_hex_file(&p))
                    .await
                    .context("hash task panicked")??;
            }
        }

        let now = Utc::now().timestamp();
        let (mut c_time, mut a_time, mut m_time) = (now, now, now);
        if act == Action::Write || act == Action::Create {
            let md = tokio::fs::symlink_metadata(path)
                .await
                .with_context(|| format!("stat {}", path.display()))?;
            (c_time, a_time, m_time) = file_times(&md);
        }

        let req = PushData {
            action: act,
            file_info: FileInfo {
                path: self.rel_path(path)?,
                is_dir: FsDirValue::from_bool(is_dir),
                size,
                hash,
                hash_values: Vec::new(),
                c_time,
                a_time,
                m_time,
                link_to: String::new(),
            },
        };
        let file_info_json = serde_json::to_string(&req)?;

        let resp = self.post_with_auth(act, path, &file_info_json).await?;
        let body = resp.bytes().await.context("read push response")?;
        let api: ApiResult = serde_json::from_slice(&body).context("parse push response")?;
        if !api.is_success() {
            bail!("send a request to the push server error => {}", api.message);
        }
        Ok(())
    }

    /// POST the event; on 401 with a configured user, sign in and retry
    /// exactly once.
    async fn post_with_auth(
        &self,
        act: Action,
        path: &Path,
        file_info_json: &str,
    ) -> Result<reqwest::Response> {
        let url = self.push_addr();
        let send_file = act == Action::Write;
        let fields = [(push::FIELD_FILE_INFO, file_info_json.to_string())];

        let resp = if send_file {
            self.http
                .post_multipart(&url, &fields, push::FIELD_UP_FILE, path)
                .await?
        } else {
            self.http.post_form(&url, &fields).await?
        };

        if resp.status() == StatusCode::UNAUTHORIZED {
            if let Some(user) = &self.user {
                let parsed = reqwest::Url::parse(&url).context("parse push url")?;
                let host = match (parsed.host_str(), parsed.port()) {
                    (Some(h), Some(p)) => format!("{}:{}", h, p),
                    (Some(h), None) => h.to_string(),
                    _ => bail!("push url has no host: {}", url),
                };
                let cookies = self
                    .http
                    .sign_in(parsed.scheme(), &host, user.user_name(), user.password())
                    .await?;
                if cookies.is_empty() {
                    bail!("file server is unauthorized");
                }
                self.http.set_cookies(cookies);
                tracing::debug!(url = %url, "auto login file server success maybe, retry the push");
                let retried = if send_file {
                    self.http
                        .post_multipart(&url, &fields, push::FIELD_UP_FILE, path)
                        .await?
                } else {
                    self.http.post_form(&url, &fields).await?
                };
                return Ok(retried);
            }
        } else if resp.status() == StatusCode::NOT_FOUND {
            bail!("the push server is unsupported => {}", url);
        }
        Ok(resp)
    }
}

#[async_trait]
impl Syncer for PushClientSync {
    async fn create(&self, path: &str) -> Result<()> {
        if let Some(local) = self.local_mirror() {
            local.create(path).await?;
        }
        self.send(Action::Create, Path::new(path)).await
    }

    async fn write(&self, path: &str) -> Result<()> {
        if let Some(local) = self.local_mirror() {
            local.write(path).await?;
        }
        if self.is_dir_path(Path::new(path)).await? {
            // a Write on a directory means its subtree changed
            self.sync_once(path).await
        } else {
            self.send(Action::Write, Path::new(path)).await
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        if let Some(local) = self.local_mirror() {
            local.remove(path).await?;
        }
        self.send(Action::Remove, Path::new(path)).await
    }

    async fn rename(&self, path: &str) -> Result<()> {
        // a rename event names the vanished old path; locally that is a remove
        if let Some(local) = self.local_mirror() {
            local.remove(path).await?;
        }
        self.send(Action::Rename, Path::new(path)).await
    }

    async fn chmod(&self, path: &str) -> Result<()> {
        tracing::debug!(path, "chmod is not pushed");
        Ok(())
    }

    async fn symlink(&self, target: &str, link: &str) -> Result<()> {
        // symlinks are not pushed; only the monitor side dispatches them
        tracing::debug!(link_target = target, link, "symlink is not pushed");
        Ok(())
    }

    async fn is_dir(&self, path: &str) -> Result<bool> {
        self.is_dir_path(Path::new(path)).await
    }

    async fn sync_once(&self, root: &str) -> Result<()> {
        let abs = if Path::new(root).is_absolute() {
            PathBuf::from(root)
        } else {
            std::env::current_dir()
                .context("resolve working directory")?
                .join(root)
        };

        let mut it = WalkDir::new(&abs)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        while let Some(next) = it.next() {
            let entry = next.context("walk source tree")?;
            if entry.path() == abs {
                continue;
            }
            let path_str = entry.path().to_string_lossy().into_owned();
            if self
                .ignore
                .match_path(&path_str, "push client sync", "sync once")
            {
                if entry.file_type().is_dir() {
                    it.skip_current_dir();
                }
                continue;
            }
            if entry.file_type().is_dir() {
                self.create(&path_str).await?;
            } else {
                self.create(&path_str).await?;
                self.write(&path_str).await?;
            }
        }
        Ok(())
    }
}
