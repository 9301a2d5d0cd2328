//! Cross-platform IPC transport layer
//!
//! Abstracts Unix domain sockets (Unix/macOS) and named pipes (Windows)
//! using the interprocess crate. Every frame is a 4-byte little-endian
//! length followed by that many bytes of JSON.

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::paths;

/// Maximum message size (10 MB)
const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

// Platform-specific imports and type aliases
#[cfg(unix)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{
        prelude::*,
        Listener, Stream,
    };
    pub use interprocess::local_socket::{
        GenericFilePath, ListenerOptions,
    };
}

#[cfg(windows)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{
        prelude::*,
        Listener, Stream,
    };
    pub use interprocess::local_socket::{
        GenericNamespaced, ListenerOptions,
    };
}

use platform::*;

/// Re-export Stream for use in other modules
pub use platform::Stream;

/// Create a listener for incoming IPC connections
pub async fn create_listener() -> io::Result<Listener> {
    // Ensure socket directory exists (Unix) and clean up stale socket
    paths::ensure_socket_dir()?;
    paths::remove_socket()?;

    let name = paths::socket_name();

    #[cfg(unix)]
    let listener = {
        let name = name.to_fs_name::<GenericFilePath>()?;
        ListenerOptions::new()
            .name(name)
            .create_tokio()?
    };

    #[cfg(windows)]
    let listener = {
        let name = name.to_ns_name::<GenericNamespaced>()?;
        ListenerOptions::new()
            .name(name)
            .create_tokio()?
    };

    // Set socket permissions on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let path = paths::socket_path();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

/// Connect to the bridge daemon's IPC socket
pub async fn connect() -> io::Result<Stream> {
    let name = paths::socket_name();

    #[cfg(unix)]
    let stream = {
        let name = name.to_fs_name::<GenericFilePath>()?;
        Stream::connect(name).await?
    };

    #[cfg(windows)]
    let stream = {
        let name = name.to_ns_name::<GenericNamespaced>()?;
        Stream::connect(name).await?
    };

    Ok(stream)
}

/// Send a length-prefixed message
pub async fn send_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> io::Result<()> {
    if data.len() > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Message too large",
        ));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a length-prefixed message
pub async fn recv_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

/// Serialize `value` and send it as one frame
pub async fn send_json<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    send_message(writer, &data).await
}

/// Receive one frame and decode it
pub async fn recv_json<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let data = recv_message(reader).await?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Check if the daemon socket exists
pub fn socket_exists() -> bool {
    #[cfg(unix)]
    {
        paths::socket_path().exists()
    }

    #[cfg(windows)]
    {
        // On Windows, we can't easily check if a named pipe exists
        // We'll rely on connection attempts instead
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{PushMessage, SessionStatus};

    #[tokio::test]
    async fn test_frames_are_length_prefixed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        send_message(&mut a, b"{}").await.unwrap();

        let mut header = [0u8; 4];
        b.read_exact(&mut header).await.unwrap();
        assert_eq!(u32::from_le_bytes(header), 2);
    }

    #[tokio::test]
    async fn test_json_frames_arrive_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        for id in ["s1", "s2"] {
            let msg = PushMessage::Resumed {
                session_id: id.to_string(),
            };
            send_json(&mut a, &msg).await.unwrap();
        }
        send_json(
            &mut a,
            &PushMessage::Status {
                session_id: "s2".to_string(),
                status: SessionStatus::Stopped,
                exit_code: Some(0),
                error: None,
            },
        )
        .await
        .unwrap();

        for expected in ["s1", "s2"] {
            match recv_json::<_, PushMessage>(&mut b).await.unwrap() {
                PushMessage::Resumed { session_id } => assert_eq!(session_id, expected),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert!(matches!(
            recv_json::<_, PushMessage>(&mut b).await.unwrap(),
            PushMessage::Status { status: SessionStatus::Stopped, .. }
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_MESSAGE_SIZE + 1).to_le_bytes()).await.unwrap();
        let err = recv_message(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
