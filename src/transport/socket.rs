//! Unix Domain Socket listener and dialer.
//!
//! # Example
//!
//! ```ignore
//! use poseidon::transport::{generate_socket_path, SocketListener};
//!
//! let path = generate_socket_path();
//! let listener = SocketListener::bind(&path)?;
//! let stream = listener.accept().await?;
//! ```

use std::path::Path;

use tokio::net::{UnixListener, UnixStream};

use crate::error::Result;

/// Generate a unique socket path for this process.
///
/// Format: `/tmp/poseidon-{pid}-{random}.sock`
pub fn generate_socket_path() -> String {
    let pid = std::process::id();
    format!("/tmp/poseidon-{}-{:x}.sock", pid, rand_u64())
}

/// Simple random u64 using system time, process ID and a per-process counter.
fn rand_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let pid = std::process::id() as u64;
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    nanos.wrapping_mul(0x517cc1b727220a95) ^ pid ^ n.rotate_left(32)
}

/// Unix Domain Socket listener that removes its socket file on drop.
pub struct SocketListener {
    listener: UnixListener,
    path: String,
}

impl SocketListener {
    /// Bind to a Unix socket path.
    ///
    /// Removes any stale socket file at the path before binding.
    pub fn bind(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_string(),
        })
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Get the socket path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connect to a Unix socket.
pub async fn connect_unix(path: &str) -> Result<UnixStream> {
    Ok(UnixStream::connect(path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_generate_socket_path_format() {
        let path = generate_socket_path();
        assert!(path.starts_with("/tmp/poseidon-"));
        assert!(path.ends_with(".sock"));
        assert!(path.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_generate_socket_path_uniqueness() {
        let paths: Vec<String> = (0..10).map(|_| generate_socket_path()).collect();

        for (i, p1) in paths.iter().enumerate() {
            for p2 in &paths[i + 1..] {
                assert_ne!(p1, p2);
            }
        }
    }

    #[tokio::test]
    async fn test_bind_accept_and_cleanup() {
        let path = generate_socket_path();
        let listener = SocketListener::bind(&path).unwrap();
        assert_eq!(listener.path(), path);

        let (client, server) = tokio::join!(connect_unix(&path), listener.accept());
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(listener);
        assert!(!Path::new(&path).exists());
    }
}
