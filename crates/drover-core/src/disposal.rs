//! Managed disposables released on owner destruction.

use crate::signal::Connection;

/// A resource released when its owning entity or machine is destroyed.
///
/// Owners release their managed resources in LIFO order, so later
/// acquisitions (which may depend on earlier ones) are released first.
pub enum Disposable {
    /// A signal connection to disconnect.
    Connection(Connection),
    /// An arbitrary teardown callback.
    Callback(Box<dyn FnOnce()>),
}

impl Disposable {
    /// Release the resource.
    pub fn dispose(self) {
        match self {
            Self::Connection(conn) => conn.disconnect(),
            Self::Callback(f) => f(),
        }
    }
}

impl From<Connection> for Disposable {
    fn from(conn: Connection) -> Self {
        Self::Connection(conn)
    }
}

impl std::fmt::Debug for Disposable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(c) => f.debug_tuple("Connection").field(&c.id()).finish(),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}
