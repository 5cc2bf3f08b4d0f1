//! Core vocabulary shared by every harness component: roles, transports and
//! the per-role process state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of process participating in a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Injector,
    TcpClient,
    CacheClient,
    I2pClient,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Injector => "injector",
            Self::TcpClient => "tcp_client",
            Self::CacheClient => "cache_client",
            Self::I2pClient => "i2p_client",
        };
        write!(f, "{label}")
    }
}

/// Underlying communication mechanism a role uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Tcp,
    I2p,
    IpfsCache,
}

impl Transport {
    pub const ALL: [Transport; 3] = [Transport::Tcp, Transport::I2p, Transport::IpfsCache];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::I2p => "i2p",
            Self::IpfsCache => "ipfs_cache",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "i2p" => Ok(Self::I2p),
            "ipfs_cache" | "ipfs-cache" | "ipfs" => Ok(Self::IpfsCache),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Payload-free discriminant of [`ProcessState`], used as an await target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    NotStarted,
    Starting,
    Listening,
    Ready,
    Degraded,
    Failed,
    Exited,
}

impl StateKind {
    /// Position on the forward-only lifecycle. `Degraded` shares the rank of
    /// `Ready` because it is a detour, not a step further.
    pub fn rank(&self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Starting => 1,
            Self::Listening => 2,
            Self::Ready | Self::Degraded => 3,
            Self::Failed | Self::Exited => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Exited)
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Exited => "exited",
        };
        write!(f, "{label}")
    }
}

/// The harness's belief about a process's operational phase.
///
/// `Starting` is the "running, nothing observed yet" state and `Ready` is
/// "ready for traffic".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Listening,
    Ready,
    Degraded,
    Failed(String),
    Exited(Option<i32>),
}

impl ProcessState {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::NotStarted => StateKind::NotStarted,
            Self::Starting => StateKind::Starting,
            Self::Listening => StateKind::Listening,
            Self::Ready => StateKind::Ready,
            Self::Degraded => StateKind::Degraded,
            Self::Failed(_) => StateKind::Failed,
            Self::Exited(_) => StateKind::Exited,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// Builds the live state matching an advance target.
    pub(crate) fn from_live_kind(kind: StateKind) -> Option<Self> {
        match kind {
            StateKind::Starting => Some(Self::Starting),
            StateKind::Listening => Some(Self::Listening),
            StateKind::Ready => Some(Self::Ready),
            StateKind::Degraded => Some(Self::Degraded),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            Self::Exited(Some(code)) => write!(f, "exited (code {code})"),
            Self::Exited(None) => write!(f, "exited (signal)"),
            other => write!(f, "{}", other.kind()),
        }
    }
}
