//! Shared protocol constants for the filesync framed transport

pub const VERSION: u32 = 1;

// Frame header: payload length as zero-padded ASCII decimal
pub const HEADER_LEN: usize = 8;

// Largest payload an 8-digit header can describe
pub const MAX_FRAME_SIZE: usize = 99_999_999;

// Create request content_len sentinels
pub const DIR_LEN: u32 = 0;
pub const FILE_LEN: u32 = 1;

// Dispatch queue capacity and worker pool size
pub const SYNC_FILE_NUM_ONETIME: usize = 30;

// Heartbeat failures tolerated before a client is declared lost
pub const MAX_RETRY_TIME: u32 = 30;

// Seconds between heartbeats
pub const HEART_BEAT_INTERVAL: u64 = 10;

pub const HEART_BEAT_LISTENER_PORT: u16 = 6001;

// Message type IDs (numeric values are part of the wire format)
pub mod msg {
    pub const FILE_CREATE_REQ: u32 = 1001;
    pub const FILE_WRITE_REQ: u32 = 1002;
    pub const FILE_REMOVE_REQ: u32 = 1003;
    pub const FILE_RENAME_REQ: u32 = 1004;
    pub const FILE_CHMOD_REQ: u32 = 1005;
    pub const FILE_EXIST_REQ: u32 = 1006;

    pub const COMMON_RESP_OK: u32 = 2000;
    pub const COMMON_RESP_FAIL: u32 = 2001;

    pub const HEART_BEAT_REQ: u32 = 3000;
    pub const HEART_BEAT_RES: u32 = 3001;
}

/// Wire message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    FileCreate,
    FileWrite,
    FileRemove,
    FileRename,
    FileChmod,
    FileExist,
    RespOk,
    RespFail,
    HeartbeatReq,
    HeartbeatRes,
}

impl MsgType {
    pub fn id(self) -> u32 {
        match self {
            MsgType::FileCreate => msg::FILE_CREATE_REQ,
            MsgType::FileWrite => msg::FILE_WRITE_REQ,
            MsgType::FileRemove => msg::FILE_REMOVE_REQ,
            MsgType::FileRename => msg::FILE_RENAME_REQ,
            MsgType::FileChmod => msg::FILE_CHMOD_REQ,
            MsgType::FileExist => msg::FILE_EXIST_REQ,
            MsgType::RespOk => msg::COMMON_RESP_OK,
            MsgType::RespFail => msg::COMMON_RESP_FAIL,
            MsgType::HeartbeatReq => msg::HEART_BEAT_REQ,
            MsgType::HeartbeatRes => msg::HEART_BEAT_RES,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Some(match id {
            msg::FILE_CREATE_REQ => MsgType::FileCreate,
            msg::FILE_WRITE_REQ => MsgType::FileWrite,
            msg::FILE_REMOVE_REQ => MsgType::FileRemove,
            msg::FILE_RENAME_REQ => MsgType::FileRename,
            msg::FILE_CHMOD_REQ => MsgType::FileChmod,
            msg::FILE_EXIST_REQ => MsgType::FileExist,
            msg::COMMON_RESP_OK => MsgType::RespOk,
            msg::COMMON_RESP_FAIL => MsgType::RespFail,
            msg::HEART_BEAT_REQ => MsgType::HeartbeatReq,
            msg::HEART_BEAT_RES => MsgType::HeartbeatRes,
            _ => return None,
        })
    }

    /// Short name used in log lines
    pub fn name(self) -> &'static str {
        match self {
            MsgType::FileCreate => "createReq",
            MsgType::FileWrite => "writeReq",
            MsgType::FileRemove => "removeReq",
            MsgType::FileRename => "renameReq",
            MsgType::FileChmod => "chmodReq",
            MsgType::FileExist => "existReq",
            MsgType::RespOk => "respOk",
            MsgType::RespFail => "respFail",
            MsgType::HeartbeatReq => "heartBeatReq",
            MsgType::HeartbeatRes => "heartBeatResp",
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.id())
    }
}

// Centralized timeout constants for consistent behavior across listeners and dialers
pub mod timeouts {
    // Outbound connection establishment (ms)
    pub const DIAL_MS: u64 = 5_000;

    // Base timeout for frame header reads on request/reply connections (ms)
    pub const FRAME_HEADER_MS: u64 = 5_000;

    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 5_000;

    // Base timeout for payload reads (ms)
    pub const READ_BASE_MS: u64 = 5_000;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 100;

    // 5s base + 100ms per 1MB payload (ceil)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64).div_ceil(1_048_576);
        WRITE_BASE_MS + mb * PER_MB_MS
    }

    // 5s base + 100ms per 1MB payload (ceil)
    pub fn read_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64).div_ceil(1_048_576);
        READ_BASE_MS + mb * PER_MB_MS
    }
}
