use smol_str::SmolStr;
use tracing::{debug, error, trace};

use crate::xds::{next_nonce, ResourceType, XdsError};

/// Tracks the versions sent to and accepted by a SOTW client for a single
/// resource type.
///
/// Versions are a counter that only goes up, so a client that has accepted a
/// version has also accepted everything before it.
#[derive(Debug)]
pub(crate) struct VersionTracker {
    rtype: ResourceType,
    current: u64,
    nonce: Option<SmolStr>,
    sent: Option<u64>,
    accepted: Option<u64>,
}

impl VersionTracker {
    pub(crate) fn new(rtype: ResourceType) -> Self {
        Self::starting_at(rtype, 1)
    }

    pub(crate) fn starting_at(rtype: ResourceType, current: u64) -> Self {
        Self {
            rtype,
            current,
            nonce: None,
            sent: None,
            accepted: None,
        }
    }

    /// Allocate the version for the next response.
    pub(crate) fn next_version(&mut self) -> u64 {
        self.current = self
            .current
            .checked_add(1)
            .expect("version counter overflowed. this is a bug");
        self.current
    }

    /// Record that `version` is being sent and return the nonce to send it
    /// with.
    pub(crate) fn pushed(&mut self, version: u64) -> SmolStr {
        let nonce = next_nonce();
        self.sent = Some(version);
        self.nonce = Some(nonce.clone());
        nonce
    }

    pub(crate) fn has_accepted(&self, version: u64) -> bool {
        self.accepted.is_some_and(|accepted| accepted >= version)
    }

    /// Handle the version and nonce from a request. Returns `false` if the
    /// request is stale and should be ignored.
    pub(crate) fn process_request(
        &mut self,
        response_nonce: &str,
        version_info: &str,
    ) -> Result<bool, XdsError> {
        let Some(sent) = self.sent else {
            if response_nonce.is_empty() {
                trace!(ty = %self.rtype, "initial request");
            } else {
                debug!(
                    ty = %self.rtype,
                    nonce = response_nonce,
                    "request with a nonce before anything was sent, probably a reconnect",
                );
            }
            return Ok(true);
        };

        if self.nonce.as_deref() != Some(response_nonce) {
            trace!(
                ty = %self.rtype,
                nonce = response_nonce,
                expected = ?self.nonce,
                "ignoring stale request",
            );
            return Ok(false);
        }

        if version_info.is_empty() {
            error!(
                ty = %self.rtype,
                sent,
                "client rejected update and has no previous version to fall back to",
            );
            return Ok(true);
        }

        let version: u64 = version_info.parse().map_err(|_| {
            XdsError::protocol(format!(
                "{} request has an invalid version: {version_info:?}",
                self.rtype
            ))
        })?;

        if version == sent {
            self.accepted = Some(version);
        } else {
            error!(
                ty = %self.rtype,
                sent,
                version,
                "client rejected update and rolled back",
            );
        }

        Ok(true)
    }
}
