//! Error types shared across the consensus core.

use std::borrow::Cow;
use thiserror::Error;

/// Reason a script evaluation was rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptErrorCode {
    /// Push length runs past the end of the script.
    BadPushData,
    /// Stack smaller than the opcode requires.
    InvalidStackOperation,
    /// More than 1000 stack items.
    StackSize,
    /// More than 20 nested conditionals.
    ConditionDepth,
    /// ELSE/ENDIF without IF, or IF left open.
    UnbalancedConditional,
    /// Opcode from the disabled set.
    DisabledOpcode,
    /// Byte that is not a defined opcode.
    UnknownOpcode,
    /// Arithmetic operand wider than 4 bytes.
    NumberOverflow,
    /// Negative or malformed lock-time/sequence operand.
    BadLockTimeOperand,
    /// Pushed element larger than 520 bytes.
    ElementSize,
    /// Script longer than 10,000 bytes.
    ScriptSize,
}

impl std::fmt::Display for ScriptErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ScriptErrorCode::BadPushData => "push data past end of script",
            ScriptErrorCode::InvalidStackOperation => "stack too small for operation",
            ScriptErrorCode::StackSize => "stack size limit exceeded",
            ScriptErrorCode::ConditionDepth => "conditional depth limit exceeded",
            ScriptErrorCode::UnbalancedConditional => "unbalanced conditional",
            ScriptErrorCode::DisabledOpcode => "disabled opcode",
            ScriptErrorCode::UnknownOpcode => "unknown opcode",
            ScriptErrorCode::NumberOverflow => "arithmetic operand too large",
            ScriptErrorCode::BadLockTimeOperand => "bad lock-time operand",
            ScriptErrorCode::ElementSize => "stack element too large",
            ScriptErrorCode::ScriptSize => "script too large",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("invalid header: {0}")]
    InvalidHeader(Cow<'static, str>),

    #[error("invalid block: {0}")]
    InvalidBlock(Cow<'static, str>),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(Cow<'static, str>),

    #[error("script rejected: {0}")]
    Script(ScriptErrorCode),

    #[error("output not found: {0}")]
    OutputNotFound(crate::types::OutPoint),

    #[error("immature coinbase spend: produced at {produced}, spent at {spent}")]
    ImmatureCoinbase { produced: u32, spent: u32 },

    #[error("serialization error: {0}")]
    Serialization(Cow<'static, str>),

    #[error("proof of work error: {0}")]
    ProofOfWork(Cow<'static, str>),

    #[error("storage integrity error: {0}")]
    Integrity(Cow<'static, str>),

    #[error("stop requested")]
    Stopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChainError {
    /// Consensus failures black-list the block; policy and integrity
    /// failures do not.
    pub fn is_consensus(&self) -> bool {
        matches!(
            self,
            ChainError::InvalidHeader(_)
                | ChainError::InvalidBlock(_)
                | ChainError::InvalidTransaction(_)
                | ChainError::Script(_)
                | ChainError::OutputNotFound(_)
                | ChainError::ImmatureCoinbase { .. }
                | ChainError::ProofOfWork(_)
        )
    }
}

impl From<ScriptErrorCode> for ChainError {
    fn from(code: ScriptErrorCode) -> Self {
        ChainError::Script(code)
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
