pub mod backoff;
pub mod classify;
pub mod error;
pub mod identity;
pub mod proxy;
pub mod result;
pub mod session;

pub use backoff::BackoffPolicy;
pub use classify::{classify_response, is_bot_challenge};
pub use error::ScanError;
pub use proxy::ProxyConfig;
pub use result::{FetchOutcome, FetchResponse, ResponseClass};
pub use session::{
    Admission, DomainSessionState, FailureKind, HostSession, SessionCallback, SessionConfig,
    SessionCoordinator, SessionEvent, host_key,
};
