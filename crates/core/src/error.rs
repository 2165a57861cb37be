//! Error taxonomy shared by every corral crate.

/// Boxed error returned by user callbacks such as mutators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Optimistic-concurrency failure; the object changed since it was read.
    #[error("conflict: {kind} {name:?} was modified concurrently")]
    Conflict { kind: String, name: String },

    /// A wait or slot acquisition ended because the cancellation signal fired.
    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Configuration(String),

    #[error("checking {condition} failed, status: {status} message: {message} reason: {reason}")]
    ConditionFailed { condition: String, status: String, reason: String, message: String },

    #[error("couldn't delete the {kind} with the name {name:?}: {source}")]
    Delete {
        kind: String,
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// One failed task of a bulk execution.
    #[error("{}: {source}", child_label(.namespace, .name))]
    ChildTask {
        namespace: Option<String>,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("mutation failed: {0}")]
    Mutator(#[source] BoxError),

    #[error("template: {0}")]
    Template(String),

    #[error("command {command:?} failed: {reason}")]
    Exec { command: String, reason: String },

    #[error("encoding object: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal: {0}")]
    Internal(String),

    #[error("gateway: {0}")]
    Gateway(String),
}

fn child_label(namespace: &Option<String>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("[namespace={ns} name={name}]"),
        _ => format!("[name={name}]"),
    }
}

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound { kind: kind.into(), name: name.into() }
    }

    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict { kind: kind.into(), name: name.into() }
    }

    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists { kind: kind.into(), name: name.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_task_identifies_namespace_and_resource() {
        let err = Error::ChildTask {
            namespace: Some("ns1".into()),
            name: "app1".into(),
            source: Box::new(Error::Exec { command: "false".into(), reason: "exit status: 1".into() }),
        };
        assert_eq!(err.to_string(), "[namespace=ns1 name=app1]: command \"false\" failed: exit status: 1");

        let cluster = Error::ChildTask { namespace: None, name: "n".into(), source: Box::new(Error::Template("bad".into())) };
        assert_eq!(cluster.to_string(), "[name=n]: template: bad");
    }

    #[test]
    fn classification_helpers() {
        assert!(Error::not_found("App", "a").is_not_found());
        assert!(Error::conflict("App", "a").is_conflict());
        assert!(!Error::conflict("App", "a").is_not_found());
        assert!(Error::Timeout("x".into()).is_timeout());
    }
}
