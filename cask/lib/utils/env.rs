//! Utility functions for working with environment variables.

use std::path::PathBuf;

use crate::config::DEFAULT_CASK_HOME;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable for the cask home directory.
pub const CASK_HOME_ENV_VAR: &str = "CASK_HOME";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the path to the cask home directory.
/// If the CASK_HOME environment variable is set, returns that path.
/// Otherwise, returns the default cask home path.
pub fn get_cask_home_path() -> PathBuf {
    if let Ok(cask_home) = std::env::var(CASK_HOME_ENV_VAR) {
        PathBuf::from(cask_home)
    } else {
        DEFAULT_CASK_HOME.to_owned()
    }
}
