//! Reference peer interpreter. Speaks the scriptbridge protocol on stdio.

use std::process;

use scriptbridge::logging::init_tracing;
use scriptbridge::peer::run_peer;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();

    let code = match run_peer().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Peer failed");
            1
        }
    };

    // The blocking stdin reader cannot be cancelled; exit instead of waiting
    // for the runtime to wind down.
    process::exit(code);
}
