use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid package name: {0}")]
    InvalidPackageName(String),

    #[error("invalid wheel filename: {0}")]
    InvalidWheelFilename(String),

    #[error("invalid dependency tool: {0}")]
    InvalidDependencyTool(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
