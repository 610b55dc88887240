#[derive(Debug, thiserror::Error)]
pub enum XdsError {
    #[error("missing node info")]
    MissingNode,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("client rejected {type_url} nonce={nonce}: code={code} {message}")]
    Nack {
        type_url: String,
        nonce: String,
        code: i32,
        message: String,
    },

    #[error("event listener failed: {0}")]
    Listener(anyhow::Error),
}

impl XdsError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn is_nack(&self) -> bool {
        matches!(self, XdsError::Nack { .. })
    }

    pub fn into_status(self) -> tonic::Status {
        match self {
            XdsError::Listener(_) => tonic::Status::internal(self.to_string()),
            _ => tonic::Status::invalid_argument(self.to_string()),
        }
    }
}

/// Runs every step of a teardown or a notification, even if some fail, and
/// reports the first failure.
#[derive(Default)]
pub(crate) struct Teardown {
    errors: Vec<anyhow::Error>,
}

impl Teardown {
    pub(crate) fn run(&mut self, step: &'static str, f: impl FnOnce() -> anyhow::Result<()>) {
        if let Err(e) = f() {
            self.errors.push(e.context(step));
        }
    }

    pub(crate) fn finish(self) -> anyhow::Result<()> {
        let mut errors = self.errors.into_iter();
        let Some(first) = errors.next() else {
            return Ok(());
        };

        let mut suppressed = 0;
        for e in errors {
            tracing::warn!(err = %format!("{e:#}"), "suppressed error");
            suppressed += 1;
        }

        match suppressed {
            0 => Err(first),
            n => Err(first.context(format!("{n} more teardown errors suppressed"))),
        }
    }
}
