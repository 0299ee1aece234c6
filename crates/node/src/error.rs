use std::fmt;

use basalt_chain::ChainError;
use basalt_primitives::DecodeError;

// Protocol offense and close-reason codes. The numeric values travel on the
// wire as close reasons, so they are stable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    Checksum = 2001,
    NoInit = 2002,
    InvInit = 2003,
    Timeout = 2004,
    LowPriority = 2005,
    BatchSize = 2006,
    Empty = 2007,
    BadRollback = 2008,
    BadRollbackLen = 2009,
    NotFound = 2010,
    BlockSize = 2011,
    BodyParse = 2012,
    ChainMismatch = 2013,
    BadProbe = 2014,
    Restart = 2015,
    DuplicateCon = 2016,
    MsgType = 2017,
    Unsolicited = 2018,
    BlockRange = 2019,
    Malformed = 2020,
    PingFloor = 2021,
    AppendMismatch = 2022,
    BadShrink = 2023,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::Checksum => "CHECKSUM",
            ErrorCode::NoInit => "NOINIT",
            ErrorCode::InvInit => "INVINIT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::LowPriority => "LOWPRIORITY",
            ErrorCode::BatchSize => "BATCHSIZE",
            ErrorCode::Empty => "EMPTY",
            ErrorCode::BadRollback => "BADROLLBACK",
            ErrorCode::BadRollbackLen => "BADROLLBACKLEN",
            ErrorCode::NotFound => "NOTFOUND",
            ErrorCode::BlockSize => "BLOCKSIZE",
            ErrorCode::BodyParse => "BODYPARSE",
            ErrorCode::ChainMismatch => "CHAINMISMATCH",
            ErrorCode::BadProbe => "BADPROBE",
            ErrorCode::Restart => "RESTART",
            ErrorCode::DuplicateCon => "DUPLICATECON",
            ErrorCode::MsgType => "MSGTYPE",
            ErrorCode::Unsolicited => "UNSOLICITED",
            ErrorCode::BlockRange => "BLOCKRANGE",
            ErrorCode::Malformed => "MALFORMED",
            ErrorCode::PingFloor => "PINGFLOOR",
            ErrorCode::AppendMismatch => "APPENDMISMATCH",
            ErrorCode::BadShrink => "BADSHRINK",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

impl std::error::Error for ErrorCode {}

impl From<ChainError> for ErrorCode {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::ForkRangeContradiction => ErrorCode::ChainMismatch,
            ChainError::NonMonotonicAppend => ErrorCode::AppendMismatch,
            ChainError::BadShrink => ErrorCode::BadShrink,
        }
    }
}

impl From<DecodeError> for ErrorCode {
    fn from(_: DecodeError) -> Self {
        ErrorCode::Malformed
    }
}

// A peer whose message violated the protocol, slated for close.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Offender {
    pub conn_id: u64,
    pub code: ErrorCode,
}

pub fn close_reason_name(code: i32) -> String {
    const ALL: &[ErrorCode] = &[
        ErrorCode::Checksum,
        ErrorCode::NoInit,
        ErrorCode::InvInit,
        ErrorCode::Timeout,
        ErrorCode::LowPriority,
        ErrorCode::BatchSize,
        ErrorCode::Empty,
        ErrorCode::BadRollback,
        ErrorCode::BadRollbackLen,
        ErrorCode::NotFound,
        ErrorCode::BlockSize,
        ErrorCode::BodyParse,
        ErrorCode::ChainMismatch,
        ErrorCode::BadProbe,
        ErrorCode::Restart,
        ErrorCode::DuplicateCon,
        ErrorCode::MsgType,
        ErrorCode::Unsolicited,
        ErrorCode::BlockRange,
        ErrorCode::Malformed,
        ErrorCode::PingFloor,
        ErrorCode::AppendMismatch,
        ErrorCode::BadShrink,
    ];
    ALL.iter()
        .find(|candidate| candidate.code() == code)
        .map(|candidate| candidate.name().to_string())
        .unwrap_or_else(|| code.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::Checksum.code(), 2001);
        assert_eq!(ErrorCode::Timeout.code(), 2004);
        assert_eq!(ErrorCode::BatchSize.code(), 2006);
        assert_eq!(ErrorCode::BadShrink.code(), 2023);
    }

    #[test]
    fn chain_errors_map_to_offense_codes() {
        assert_eq!(
            ErrorCode::from(ChainError::ForkRangeContradiction),
            ErrorCode::ChainMismatch
        );
        assert_eq!(
            ErrorCode::from(ChainError::NonMonotonicAppend),
            ErrorCode::AppendMismatch
        );
    }
}
