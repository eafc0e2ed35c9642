//! Process exit codes. Part of the CLI contract.

use ref_core::RefError;

pub const SUCCESS: i32 = 0;
pub const CONFIG_ERROR: i32 = 1; // Bad config, provider reference or catalog
pub const RUN_ERROR: i32 = 2; // Anything else that stopped the run

/// Exit code for an error that escaped a command.
pub fn for_error(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<RefError>()
        .map_or(RUN_ERROR, RefError::exit_code)
}
