//! Chat core: the store that owns conversation, message, typing and call
//! state, plus the services it coordinates.

pub mod calls;
pub mod config;
pub mod conversations;
pub mod events;
pub mod presence;
pub mod render;
pub mod session;
pub mod state;
pub mod store;
pub mod subscriptions;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::ChatConfig;
pub use session::Session;
pub use state::ChatState;
pub use store::ChatStore;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("parley_client_lib=debug,parley_transport=info,parley_cache=info,warn")
    });

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();

    if installed.is_ok() {
        tracing::info!("Parley chat core tracing initialised");
    }
}
