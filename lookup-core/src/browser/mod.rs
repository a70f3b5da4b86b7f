mod automation;
mod error;
mod fingerprint;
mod metrics;
mod session;

pub use automation::{BrowserAutomation, BrowserLauncher, ChromiumContext};
pub use error::{BrowserError, BrowserResult};
pub use fingerprint::{DeviceProfile, FingerprintGenerator, PoolFingerprintGenerator};
pub use metrics::{SessionCounters, SessionMetrics};
pub use session::{
    BrowserSession, CaptureContext, InterceptedResponse, ResponseStream, SessionCookie,
    SessionLauncher,
};
