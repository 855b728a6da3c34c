//! Domain error types.

use crate::domain::account::AccountId;
use crate::domain::auto_trading::RuleId;

/// Top-level error type for papertrader.
#[derive(Debug, thiserror::Error)]
pub enum PapertraderError {
    #[error("insufficient funds: need {required:.2}, have {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("insufficient position: hold {held}, requested {requested}")]
    InsufficientPosition { held: i64, requested: i64 },

    #[error("account {account_id} not found")]
    AccountNotFound { account_id: AccountId },

    #[error("rule {rule_id} not found")]
    RuleNotFound { rule_id: RuleId },

    #[error("no data: {reason}")]
    NoData { reason: String },

    #[error("invalid parameters: {reason}")]
    InvalidParameters { reason: String },

    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PapertraderError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        PapertraderError::InvalidParameters {
            reason: reason.into(),
        }
    }

    pub fn no_data(reason: impl Into<String>) -> Self {
        PapertraderError::NoData {
            reason: reason.into(),
        }
    }

    /// Ledger rejections leave state untouched and are reported to the caller
    /// as a failed order rather than a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            PapertraderError::InsufficientFunds { .. }
                | PapertraderError::InsufficientPosition { .. }
                | PapertraderError::AccountNotFound { .. }
                | PapertraderError::InvalidParameters { .. }
        )
    }
}

impl From<&PapertraderError> for std::process::ExitCode {
    fn from(err: &PapertraderError) -> Self {
        let code: u8 = match err {
            PapertraderError::Io(_) => 1,
            PapertraderError::ConfigParse { .. }
            | PapertraderError::ConfigMissing { .. }
            | PapertraderError::ConfigInvalid { .. } => 2,
            PapertraderError::Database { .. } | PapertraderError::DatabaseQuery { .. } => 3,
            PapertraderError::InvalidParameters { .. } => 4,
            PapertraderError::NoData { .. } | PapertraderError::RuleNotFound { .. } => 5,
            PapertraderError::InsufficientFunds { .. }
            | PapertraderError::InsufficientPosition { .. }
            | PapertraderError::AccountNotFound { .. } => 6,
        };
        std::process::ExitCode::from(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_funds_message() {
        let err = PapertraderError::InsufficientFunds {
            required: 10_001.5,
            available: 500.0,
        };
        assert_eq!(
            err.to_string(),
            "insufficient funds: need 10001.50, have 500.00"
        );
    }

    #[test]
    fn rejections_are_classified() {
        assert!(
            PapertraderError::InsufficientPosition {
                held: 0,
                requested: 5
            }
            .is_rejection()
        );
        assert!(PapertraderError::invalid("quantity must be positive").is_rejection());
        assert!(!PapertraderError::no_data("empty").is_rejection());
        assert!(
            !PapertraderError::Database {
                reason: "locked".into()
            }
            .is_rejection()
        );
    }

    #[test]
    fn missing_rule_is_not_a_rejection() {
        let err = PapertraderError::RuleNotFound { rule_id: 3 };
        assert_eq!(err.to_string(), "rule 3 not found");
        assert!(!err.is_rejection());
        assert_eq!(
            format!("{:?}", std::process::ExitCode::from(&err)),
            format!("{:?}", std::process::ExitCode::from(5))
        );
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PapertraderError = io.into();
        assert!(matches!(err, PapertraderError::Io(_)));
    }
}
