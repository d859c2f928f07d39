//! Built-in transports selected by URI scheme.
//!
//! | scheme | in | out |
//! |---|---|---|
//! | `memory://<queue>` | yes | yes |
//! | `file://<dir>` | yes | yes |
//! | `log://<target>?level=..` | | yes |
//! | `channel://<name>` | | yes |

pub mod channel;
pub mod file;
pub mod log;
pub mod memory;

use {
    switchyard_common::{Error, Result},
    url::Url,
};

/// The addressed name of a URI: its host, else its path without slashes.
pub(crate) fn target(uri: &Url) -> Result<String> {
    let host = uri.host_str().unwrap_or_default();
    let name = if host.is_empty() {
        uri.path().trim_matches('/')
    } else {
        host
    };
    if name.is_empty() {
        return Err(Error::adapter(uri.as_str(), "uri does not name a target"));
    }
    Ok(name.to_string())
}
