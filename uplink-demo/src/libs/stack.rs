//! Boundary contracts between the application and the network stack.

use std::{fmt, ops::BitOr};

use thiserror::Error;

use super::{Task, dispatcher::EventPoster};

/// Events reported asynchronously by the network stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoraEvent {
    Connected,
    Disconnected,
    TxDone,
    TxTimeout,
    TxError,
    TxCryptoError,
    TxSchedulingError,
    RxDone,
    RxTimeout,
    RxError,
    JoinFailure,
    UplinkRequired,
    /// Raw code outside `0..=11`. Build events from codes with [`LoraEvent::from`] so that known
    /// codes never end up here.
    Unknown(u8),
}

impl LoraEvent {
    pub fn code(&self) -> u8 {
        match self {
            LoraEvent::Connected => 0,
            LoraEvent::Disconnected => 1,
            LoraEvent::TxDone => 2,
            LoraEvent::TxTimeout => 3,
            LoraEvent::TxError => 4,
            LoraEvent::TxCryptoError => 5,
            LoraEvent::TxSchedulingError => 6,
            LoraEvent::RxDone => 7,
            LoraEvent::RxTimeout => 8,
            LoraEvent::RxError => 9,
            LoraEvent::JoinFailure => 10,
            LoraEvent::UplinkRequired => 11,
            LoraEvent::Unknown(code) => *code,
        }
    }
}

impl From<u8> for LoraEvent {
    fn from(code: u8) -> Self {
        match code {
            0 => LoraEvent::Connected,
            1 => LoraEvent::Disconnected,
            2 => LoraEvent::TxDone,
            3 => LoraEvent::TxTimeout,
            4 => LoraEvent::TxError,
            5 => LoraEvent::TxCryptoError,
            6 => LoraEvent::TxSchedulingError,
            7 => LoraEvent::RxDone,
            8 => LoraEvent::RxTimeout,
            9 => LoraEvent::RxError,
            10 => LoraEvent::JoinFailure,
            11 => LoraEvent::UplinkRequired,
            code => LoraEvent::Unknown(code),
        }
    }
}

/// Stack status codes.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StackError {
    #[error("stack busy")]
    Busy,
    #[error("operation would block")]
    WouldBlock,
    #[error("invalid parameter")]
    ParameterInvalid,
    #[error("invalid port")]
    PortInvalid,
    #[error("invalid payload length")]
    LengthError,
    #[error("no active session")]
    NoActiveSessions,
    #[error("stack not initialized")]
    NotInitialized,
    #[error("unsupported operation")]
    Unsupported,
    #[error("already connected")]
    AlreadyConnected,
    #[error("device I/O error: {0}")]
    Io(String),
}

impl StackError {
    pub fn code(&self) -> i16 {
        match self {
            StackError::Busy => -1000,
            StackError::WouldBlock => -1001,
            StackError::ParameterInvalid => -1003,
            StackError::PortInvalid => -1004,
            StackError::LengthError => -1008,
            StackError::NoActiveSessions => -1017,
            StackError::NotInitialized => -1010,
            StackError::Unsupported => -1011,
            StackError::AlreadyConnected => -1019,
            StackError::Io(_) => -1012,
        }
    }
}

impl From<std::io::Error> for StackError {
    fn from(e: std::io::Error) -> Self {
        StackError::Io(e.to_string())
    }
}

/// Outcome of a non-blocking send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendResult {
    /// The frame was queued. Carries the number of payload bytes scheduled.
    Accepted(usize),
    /// Duty-cycle restriction. Try again later.
    Backpressure,
    Error(StackError),
}

/// Message type flags for send and receive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgFlags(u8);

impl MsgFlags {
    pub const UNCONFIRMED: MsgFlags = MsgFlags(0x01);
    pub const CONFIRMED: MsgFlags = MsgFlags(0x02);

    pub fn contains(&self, other: MsgFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MsgFlags {
    type Output = MsgFlags;

    fn bitor(self, rhs: MsgFlags) -> MsgFlags {
        MsgFlags(self.0 | rhs.0)
    }
}

/// OTAA join parameters.
#[derive(Clone)]
pub struct ConnectParams {
    pub dev_eui: [u8; 8],
    pub app_eui: [u8; 8],
    pub app_key: [u8; 16],
    /// Number of join attempts before reporting [`LoraEvent::JoinFailure`].
    pub nb_trials: u8,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("dev_eui", &hex::encode(self.dev_eui))
            .field("app_eui", &hex::encode(self.app_eui))
            .field("nb_trials", &self.nb_trials)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectStatus {
    InProgress,
}

/// Non-blocking data path. Outcomes of accepted frames arrive later as [`LoraEvent`]s.
pub trait Transport {
    fn send(&mut self, port: u8, data: &[u8], flags: MsgFlags) -> SendResult;

    /// Reads at most one queued downlink into `buf` and returns its length.
    fn receive(&mut self, port: u8, buf: &mut [u8], flags: MsgFlags) -> Result<usize, StackError>;
}

/// Network stack lifecycle operations.
pub trait Stack: Transport {
    /// Prepares the stack. Events are reported through `events` from here on.
    fn initialize(&mut self, events: EventPoster<Task>) -> Result<(), StackError>;

    fn set_confirmed_msg_retries(&mut self, count: u8) -> Result<(), StackError>;

    fn set_adaptive_datarate(&mut self, enabled: bool) -> Result<(), StackError>;

    /// Starts joining the network. Completion is reported with [`LoraEvent::Connected`] or
    /// [`LoraEvent::JoinFailure`].
    fn connect(&mut self, params: &ConnectParams) -> Result<ConnectStatus, StackError>;
}
