// SSH模块入口
pub mod async_session;
pub mod client;
pub mod known_hosts;
pub mod session;
pub mod transport;

pub use async_session::AsyncSession;
pub use client::{SshClient, SshConnector};
pub use known_hosts::{HostFingerprint, HostKey, HostKeyStatus, HostTrustStore};
pub use session::{SessionManager, SessionState};
pub use transport::{Connector, Transport};
