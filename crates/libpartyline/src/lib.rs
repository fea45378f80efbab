pub mod config;
pub mod credentials;
pub mod dedupe;
pub mod error;
pub mod merge;
pub mod process;
pub mod registry;
pub mod session;
pub mod summary;

pub use config::{PartyConfig, SessionMode};
pub use credentials::CredentialStore;
pub use error::PartyError;
pub use registry::PeerRegistry;
pub use session::PartySession;
