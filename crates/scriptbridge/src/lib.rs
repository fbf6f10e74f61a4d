//! scriptbridge: drive a long-lived script interpreter over its stdio pipes.
//!
//! ```no_run
//! # async fn demo() -> scriptbridge::Result<()> {
//! use scriptbridge::{Script, Session, SessionConfig, Value};
//!
//! let config = SessionConfig::new("scriptbridge-peer");
//! let script = Script::new("func Greet concat\n");
//! let mut session = Session::start(config, script).await?;
//!
//! session.set("count", 3).await?;
//! let greeting = session.f("Greet", &["hello, ".into(), "world".into()]).await?;
//! assert_eq!(greeting, Value::from("hello, world"));
//!
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod version;

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod peer;
pub mod script;
pub mod session;
pub mod value;

pub use bridge::protocol::ErrorDescriptor;
pub use bridge::transport::{CommandSpawner, PeerSpawner, SpawnError, SpawnSpec};
pub use config::SessionConfig;
pub use error::{
    BridgeError, ConfigError, ExitCode, PeerException, Result, Warning, WarningHandler,
};
pub use script::Script;
pub use session::{Session, SessionId};
pub use value::{PrecisionLossWarning, UnsupportedValueError, Value};
pub use version::{SCRIPTBRIDGE_VERSION, VersionInfo};
