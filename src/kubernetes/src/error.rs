use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid label selector operator {operator} for key {key}")]
    InvalidSelectorOperator { key: String, operator: String },

    #[error("label selector operator {operator} for key {key} requires values")]
    MissingSelectorValues { key: String, operator: String },

    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("status write rejected: {0}")]
    StatusWrite(String),
}
