/*!
Configuration: resolving an archive from a URI, with the default taken
from the `ARCHIVE_URI` environment variable.
*/

use lazy_static::lazy_static;
use regex::Regex;

use crate::archive::{Archive, InMemoryArchive};
use crate::error::{ChroniclerError, Result};
use crate::historian::Historian;

/// The environment variable supplying the default archive URI.
pub const ARCHIVE_URI_ENV: &str = "ARCHIVE_URI";

/// The URI used when nothing else is configured.
pub const DEFAULT_ARCHIVE_URI: &str = "memory://";

/// The archive URI from the environment, falling back to the default.
pub fn default_archive_uri() -> String {
    std::env::var(ARCHIVE_URI_ENV).unwrap_or_else(|_| DEFAULT_ARCHIVE_URI.to_string())
}

/// Create an archive from a URI string.
pub fn connect(uri: &str) -> Result<Box<dyn Archive>> {
    lazy_static! {
        static ref SCHEME: Regex = Regex::new(r"^(?P<scheme>[a-z][a-z0-9+.-]*)://").unwrap();
    }
    let caps = SCHEME
        .captures(uri)
        .ok_or_else(|| ChroniclerError::Connection(format!("not an archive uri: '{}'", uri)))?;
    match &caps["scheme"] {
        "memory" => Ok(Box::new(InMemoryArchive::new())),
        scheme => Err(ChroniclerError::Connection(format!(
            "unknown archive scheme: '{}'",
            scheme
        ))),
    }
}

/// Create a historian directly from an archive URI.
pub fn historian(uri: &str) -> Result<Historian> {
    Ok(Historian::new(connect(uri)?))
}

/// Create a historian over the archive configured in the environment.
pub fn default_historian() -> Result<Historian> {
    historian(&default_archive_uri())
}
