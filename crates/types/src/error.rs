use thiserror::Error;

use crate::workflow::TaskKind;

/// Problems with a workflow document that are detectable without touching
/// the network.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("malformed workflow: {0}")]
    Malformed(String),

    #[error("task #{sequence}: unknown task kind '{kind}'")]
    UnknownTaskKind { sequence: usize, kind: String },

    #[error("task #{sequence} ({kind}): invalid options: {message}")]
    InvalidOptions { sequence: usize, kind: TaskKind, message: String },

    #[error("unresolved parameter '{{{name}}}' in {location}")]
    UnresolvedParameter { name: String, location: String },

    #[error("parameter '{name}' is bound more than once")]
    AmbiguousBinding { name: String },

    #[error("invalid write disposition: {0}")]
    InvalidDisposition(String),

    #[error("task #{sequence}: {source}")]
    Task {
        sequence: usize,
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    /// Attach a task sequence to an error raised without one.
    ///
    /// Errors that already name their task are returned unchanged.
    pub fn in_task(self, sequence: usize) -> Self {
        match self {
            Self::UnknownTaskKind { .. } | Self::InvalidOptions { .. } | Self::Task { .. } => self,
            other => Self::Task {
                sequence,
                source: Box::new(other),
            },
        }
    }

    pub fn invalid_options(sequence: usize, kind: TaskKind, message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            sequence,
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_task_wraps_once() {
        let err = ConfigError::AmbiguousBinding { name: "x".into() }.in_task(3);
        assert_eq!(err.to_string(), "task #3: parameter 'x' is bound more than once");
        let again = err.clone().in_task(4);
        assert_eq!(again, err);
    }

    #[test]
    fn unresolved_parameter_message_shows_braces() {
        let err = ConfigError::UnresolvedParameter {
            name: "advertisers".into(),
            location: "from.query".into(),
        };
        assert_eq!(err.to_string(), "unresolved parameter '{advertisers}' in from.query");
    }
}
