//! Rendezvous sockets where a freshly spawned plugin connects to its host.
//!
//! The host binds a uniquely named Unix socket in the runtime directory
//! before spawning the plugin, passes its path as `--ipc <address>`, and
//! accepts exactly one connection. Stale socket files left by a crashed
//! host are removed on bind; a live listener on the same path is never
//! displaced.
//!
//! The plugin's shared-memory region sits beside the socket with the same
//! stem and an `.shm` extension, so `--ipc` names both.

use std::convert::Infallible;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::context::CallContext;
use crate::error::TransportError;
use crate::metadata::PluginType;
use crate::region::SharedRegion;
use crate::session::{Role, Session};

const RENDEZVOUS_TARGET: &str = "otelplug_ipc::rendezvous";

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);

#[cfg(target_os = "linux")]
const SOCKET_PATH_MAX: usize = 107;
#[cfg(not(target_os = "linux"))]
const SOCKET_PATH_MAX: usize = 103;

static ADDRESS_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Filesystem address of a rendezvous socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpcAddress {
    path: Utf8PathBuf,
}

impl IpcAddress {
    /// Allocates a fresh address for one load of `(plugin_type, name)`.
    ///
    /// The file name combines the type, the name, this process's pid, a
    /// process-wide sequence number and a random nonce, so repeated loads
    /// never collide.
    pub fn unique(
        runtime_dir: &Utf8Path,
        plugin_type: PluginType,
        name: &str,
    ) -> Result<Self, TransportError> {
        let sequence = ADDRESS_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let nonce = Uuid::new_v4().as_fields().0;
        let file_name = format!(
            "{plugin_type}-{}-{}-{sequence}-{nonce:08x}.sock",
            sanitise(name),
            process::id()
        );
        let path = runtime_dir.join(file_name);
        if path.as_str().len() > SOCKET_PATH_MAX {
            return Err(TransportError::AddressTooLong {
                path,
                max: SOCKET_PATH_MAX,
            });
        }
        Ok(Self { path })
    }

    /// Socket path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Path of the shared-memory region paired with this socket.
    #[must_use]
    pub fn region_path(&self) -> Utf8PathBuf {
        self.path.with_extension("shm")
    }
}

fn sanitise(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

impl fmt::Display for IpcAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path.as_str())
    }
}

impl From<Utf8PathBuf> for IpcAddress {
    fn from(path: Utf8PathBuf) -> Self {
        Self { path }
    }
}

impl FromStr for IpcAddress {
    type Err = Infallible;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(Utf8PathBuf::from(input)))
    }
}

/// Host-side listener awaiting a single plugin connection.
#[derive(Debug)]
pub struct RendezvousListener {
    listener: UnixListener,
    address: IpcAddress,
    region: Option<SharedRegion>,
}

impl RendezvousListener {
    /// Binds `address`, removing a stale socket file first.
    pub fn bind(address: &IpcAddress) -> Result<Self, TransportError> {
        let path = address.path();
        clear_stale_socket(path)?;
        let listener = UnixListener::bind(path.as_std_path()).map_err(|source| {
            TransportError::Bind {
                path: path.to_path_buf(),
                source: Arc::new(source),
            }
        })?;
        if let Err(source) = listener.set_nonblocking(true) {
            drop(listener);
            if let Err(error) = remove_socket_file(path) {
                debug!(target: RENDEZVOUS_TARGET, error = %error, "cleanup after bind failure failed");
            }
            return Err(TransportError::Bind {
                path: path.to_path_buf(),
                source: Arc::new(source),
            });
        }
        debug!(target: RENDEZVOUS_TARGET, path = %path, "rendezvous socket bound");
        Ok(Self {
            listener,
            address: address.clone(),
            region: None,
        })
    }

    /// Hands `region` to the session this listener accepts.
    #[must_use]
    pub fn with_region(mut self, region: SharedRegion) -> Self {
        self.region = Some(region);
        self
    }

    /// Bound address.
    #[must_use]
    pub const fn address(&self) -> &IpcAddress {
        &self.address
    }

    /// Waits for the plugin to connect.
    ///
    /// `peer_alive` is polled between attempts; once it reports the peer has
    /// gone, the wait fails with [`TransportError::PeerExited`].
    pub fn accept<F>(&self, ctx: &CallContext, mut peer_alive: F) -> Result<UnixStream, TransportError>
    where
        F: FnMut() -> bool,
    {
        let mut backoff = Duration::from_millis(1);
        loop {
            ctx.check()?;
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream
                        .set_nonblocking(false)
                        .map_err(|source| TransportError::io("configuring plugin connection", source))?;
                    return Ok(stream);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    if !peer_alive() {
                        return Err(TransportError::PeerExited);
                    }
                    thread::sleep(backoff.min(ctx.wait_slice()));
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(TransportError::io("accepting plugin connection", error)),
            }
        }
    }

    /// Waits for the plugin to connect and wraps the connection in a host
    /// session, carrying the attached region if there is one. The listener
    /// is consumed; the socket file stays until removed.
    pub fn accept_session<F>(self, ctx: &CallContext, peer_alive: F) -> Result<Session, TransportError>
    where
        F: FnMut() -> bool,
    {
        let stream = self.accept(ctx, peer_alive)?;
        match self.region {
            Some(region) => Session::with_region(stream, Role::Host, region),
            None => Session::new(stream, Role::Host),
        }
    }
}

/// Plugin side: maps the host's shared-memory region, when one exists, and
/// connects to the rendezvous socket.
pub fn connect(address: &IpcAddress) -> Result<Session, TransportError> {
    let region = open_region(address)?;
    let path = address.path();
    let stream = UnixStream::connect(path.as_std_path()).map_err(|source| {
        TransportError::Connect {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    })?;
    match region {
        Some(region) => Session::with_region(stream, Role::Plugin, region),
        None => Session::new(stream, Role::Plugin),
    }
}

fn open_region(address: &IpcAddress) -> Result<Option<SharedRegion>, TransportError> {
    match SharedRegion::open(&address.region_path()) {
        Ok(region) => Ok(Some(region)),
        Err(TransportError::Region { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            debug!(target: RENDEZVOUS_TARGET, address = %address, "no shared-memory region; payloads go inline");
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

/// Removes a rendezvous file; returns whether a file was removed.
pub fn remove_socket_file(path: &Utf8Path) -> Result<bool, TransportError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(TransportError::Cleanup {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }),
    }
}

fn clear_stale_socket(path: &Utf8Path) -> Result<(), TransportError> {
    let metadata = match fs::symlink_metadata(path.as_std_path()) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(TransportError::Bind {
                path: path.to_path_buf(),
                source: Arc::new(source),
            });
        }
    };
    if !metadata.file_type().is_socket() {
        return Err(TransportError::NotSocket {
            path: path.to_path_buf(),
        });
    }
    match UnixStream::connect(path.as_std_path()) {
        Ok(_stream) => Err(TransportError::InUse {
            path: path.to_path_buf(),
        }),
        Err(error)
            if error.kind() == io::ErrorKind::ConnectionRefused
                || error.kind() == io::ErrorKind::NotFound =>
        {
            debug!(target: RENDEZVOUS_TARGET, path = %path, "removing stale rendezvous socket");
            remove_socket_file(path).map(|_| ())
        }
        Err(source) => Err(TransportError::Connect {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }),
    }
}
