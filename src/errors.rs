use thiserror::Error;
use virt::error::ErrorNumber;

#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("Hypervisor connection error: {0}")]
    Connection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Resource is protected: {0}")]
    Protected(String),

    #[error("Resource operation failed: {0}")]
    Resource(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Mandatory handler {script} for event {event} failed: {reason}")]
    HandlerFailed {
        event: String,
        script: String,
        reason: String,
    },
}

impl ComputeError {
    /// Classifies a libvirt error, prefixing it with caller context
    /// (vm id, node, volume path).
    pub fn from_libvirt(context: impl AsRef<str>, err: virt::error::Error) -> Self {
        Self::classify(err.code(), format!("{}: {}", context.as_ref(), err))
    }

    /// Duplicate rejections are validation errors whatever code the daemon
    /// attached to them; a duplicate disk target comes back as
    /// `OperationInvalid`.
    pub fn classify(code: ErrorNumber, message: String) -> Self {
        if message.contains("already exists") {
            return ComputeError::Validation(message);
        }
        match code {
            ErrorNumber::NoDomain
            | ErrorNumber::NoStoragePool
            | ErrorNumber::NoStorageVolume
            | ErrorNumber::NoNetwork => ComputeError::NotFound(message),
            ErrorNumber::OperationInvalid
            | ErrorNumber::OperationUnsupported
            | ErrorNumber::NoSupport => ComputeError::Unsupported(message),
            ErrorNumber::NoConnect | ErrorNumber::InvalidConn | ErrorNumber::SystemError | ErrorNumber::Rpc => {
                ComputeError::Connection(message)
            }
            _ => ComputeError::Resource(message),
        }
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ComputeError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, ComputeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_errors_are_retryable() {
        assert!(ComputeError::Connection("refused".into()).is_retryable());
        assert!(!ComputeError::NotFound("vm".into()).is_retryable());
        assert!(!ComputeError::Validation("dup".into()).is_retryable());
    }

    #[test]
    fn duplicate_target_is_a_validation_error_despite_its_code() {
        let err = ComputeError::classify(
            ErrorNumber::OperationInvalid,
            "attach vdb to web: target vdb already exists".into(),
        );
        assert!(matches!(err, ComputeError::Validation(_)));
    }

    #[test]
    fn classifies_by_error_code() {
        let classify = |code| ComputeError::classify(code, "web: failed".to_string());
        assert!(matches!(classify(ErrorNumber::NoDomain), ComputeError::NotFound(_)));
        assert!(matches!(classify(ErrorNumber::NoStoragePool), ComputeError::NotFound(_)));
        assert!(matches!(classify(ErrorNumber::OperationInvalid), ComputeError::Unsupported(_)));
        assert!(matches!(classify(ErrorNumber::Rpc), ComputeError::Connection(_)));
        assert!(matches!(classify(ErrorNumber::InternalError), ComputeError::Resource(_)));
    }

    #[test]
    fn handler_failure_names_script_and_event() {
        let err = ComputeError::HandlerFailed {
            event: "vm_created".into(),
            script: "/usr/local/bin/notify".into(),
            reason: "exit status 3".into(),
        };
        let text = err.to_string();
        assert!(text.contains("vm_created"));
        assert!(text.contains("/usr/local/bin/notify"));
        assert!(text.contains("exit status 3"));
    }
}
