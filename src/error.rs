use thiserror::Error;

/// Failures the agent can hit while probing or talking to the controller.
///
/// Only `ConfigMissing` is fatal; everything else is recovered at the
/// granularity of the packet, cycle, or session that produced it.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{0} env var required but not set")]
    ConfigMissing(&'static str),

    #[error("unable to fetch targets from controller: {0}")]
    ControllerFetch(String),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// Expected outcome for unresponsive hops; recorded as unanswered.
    #[error("response lookup timed out: {0}")]
    ResponseLookupTimeout(String),

    #[error("result publish failed: {0}")]
    Publish(String),

    #[error("malformed ICMP datagram: {0}")]
    Parse(&'static str),

    #[error("unsupported probe protocol: {0}")]
    UnsupportedProtocol(String),
}
