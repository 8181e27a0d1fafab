//! Shared data model for the control channel and the push endpoint.
//!
//! Everything that crosses a process boundary lives here: frame payloads
//! (Status, FileServerInfo, sync messages), the push form payload, and the
//! query-parameter vocabulary. Payloads serialize as JSON with PascalCase
//! keys so both peers agree on the encoding.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::auth::HashUser;
use crate::protocol::{api, code};

/// Filesystem actions carried by sync messages and push requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    Create = 1,
    Write = 2,
    Remove = 3,
    Rename = 4,
    Chmod = 5,
    Symlink = 6,
}

impl Action {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Create),
            2 => Some(Self::Write),
            3 => Some(Self::Remove),
            4 => Some(Self::Rename),
            5 => Some(Self::Chmod),
            6 => Some(Self::Symlink),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Write => "write",
            Self::Remove => "remove",
            Self::Rename => "rename",
            Self::Chmod => "chmod",
            Self::Symlink => "symlink",
        }
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u8::deserialize(deserializer)?;
        Action::from_u8(v).ok_or_else(|| D::Error::custom(format!("unknown action {}", v)))
    }
}

/// Frame routing tag. Matched by value, not by request ID: at most one Auth
/// and one Info request may be in flight at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiType {
    Unknown,
    Auth,
    Info,
    SyncMessage,
}

impl ApiType {
    pub fn from_i32(v: i32) -> Self {
        match v {
            api::AUTH => Self::Auth,
            api::INFO => Self::Info,
            api::SYNC_MESSAGE => Self::SyncMessage,
            _ => Self::Unknown,
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Unknown => api::UNKNOWN,
            Self::Auth => api::AUTH,
            Self::Info => api::INFO,
            Self::SyncMessage => api::SYNC_MESSAGE,
        }
    }
}

impl Serialize for ApiType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

impl<'de> Deserialize<'de> for ApiType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(ApiType::from_i32(i32::deserialize(deserializer)?))
    }
}

/// Tri-value directory flag: a peer may not know whether a path is a
/// directory (Remove and Rename skip the stat).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum FsDirValue {
    Unknown = -1,
    NotDir = 0,
    Dir = 1,
}

impl FsDirValue {
    pub fn from_bool(is_dir: bool) -> Self {
        if is_dir {
            Self::Dir
        } else {
            Self::NotDir
        }
    }

    pub fn from_i8(v: i8) -> Self {
        match v {
            1 => Self::Dir,
            0 => Self::NotDir,
            _ => Self::Unknown,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir)
    }

    /// String form used in fetch-URL query strings.
    pub fn as_query_value(&self) -> &'static str {
        match self {
            Self::Unknown => "-1",
            Self::NotDir => "0",
            Self::Dir => "1",
        }
    }
}

impl Serialize for FsDirValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(*self as i8)
    }
}

impl<'de> Deserialize<'de> for FsDirValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(FsDirValue::from_i8(i8::deserialize(deserializer)?))
    }
}

/// Generic response frame. `api_type` routes it, `code` carries the domain
/// result (zero success, negative error).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Status {
    pub api_type: ApiType,
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn new(api_type: ApiType, code: i32, message: impl Into<String>) -> Self {
        Self {
            api_type,
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == code::SUCCESS
    }
}

/// A raw frame payload held for deferred parsing (the receive loop never
/// unmarshals sync messages; the processor does).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn preview(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// One checkpoint in a resumable-verification hash sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct HashValue {
    pub offset: u64,
    pub hash: String,
}

/// Per-path snapshot exchanged on the wire and in push requests.
///
/// Invariant: for a directory, `size == 0` and `hash` is empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct FileInfo {
    /// Relative, forward-slash normalized path.
    pub path: String,
    pub is_dir: FsDirValue,
    pub size: i64,
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hash_values: Vec<HashValue>,
    pub c_time: i64,
    pub a_time: i64,
    pub m_time: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link_to: String,
}

/// The sole response to an InfoCommand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct FileServerInfo {
    #[serde(flatten)]
    pub status: Status,
    /// HTTP origin of the file server, e.g. `http://host:port`.
    pub server_addr: String,
    /// Path of the push endpoint under `server_addr`.
    pub push_addr: String,
    /// Remote root path used by the monitor's SyncOnce.
    pub source_path: String,
}

/// A change event streamed to the monitor side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct MonitorMessage {
    #[serde(flatten)]
    pub status: Status,
    pub action: Action,
    /// Fetch-URL prefix; the processor appends the escaped path and query.
    pub base_url: String,
    #[serde(flatten)]
    pub file_info: FileInfo,
}

/// Payload of the push endpoint's `FileInfo` form field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PushData {
    pub action: Action,
    pub file_info: FileInfo,
}

/// Generic HTTP API envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiResult<T = serde_json::Value> {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: code::SUCCESS,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == code::SUCCESS
    }
}

// Form field names on the push endpoint
pub mod push {
    pub const FIELD_FILE_INFO: &str = "FileInfo";
    pub const FIELD_UP_FILE: &str = "UpFile";
}

// Query parameter names for fetch URLs and the file-list endpoint
pub mod param {
    pub const PATH: &str = "path";
    pub const DIR: &str = "dir";
    pub const SIZE: &str = "size";
    pub const HASH: &str = "hash";
    pub const CTIME: &str = "ctime";
    pub const ATIME: &str = "atime";
    pub const MTIME: &str = "mtime";
    pub const NEED_HASH: &str = "needHash";
    pub const NEED_CHECKPOINT: &str = "needCheckpoint";
    pub const HASH_VALUES: &str = "hashValues";
    pub const VALUE_TRUE: &str = "true";
}

/// Fixed literal requesting server info.
pub const INFO_COMMAND: &[u8] = b"info";

/// Auth command prefix; the body is the marshalled HashUser.
pub const AUTH_COMMAND_PREFIX: &[u8] = b"auth";

/// Build the auth command payload for a (freshly refreshed) HashUser.
pub fn auth_command_data(user: &HashUser) -> anyhow::Result<Vec<u8>> {
    let body = serde_json::to_vec(user)?;
    let mut data = Vec::with_capacity(AUTH_COMMAND_PREFIX.len() + body.len());
    data.extend_from_slice(AUTH_COMMAND_PREFIX);
    data.extend_from_slice(&body);
    Ok(data)
}
