use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid service record: {0}")]
    Validation(String),

    #[error("No registered path matches: {0}")]
    PathNotFound(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service {service_id} is not registered under path {path}")]
    PathMismatch { path: String, service_id: String },
}

impl CoreError {
    /// True for every lookup failure (unknown path, unknown id, wrong path for id).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoreError::PathNotFound(_)
                | CoreError::ServiceNotFound(_)
                | CoreError::PathMismatch { .. }
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, CoreError::Validation(_))
    }
}
