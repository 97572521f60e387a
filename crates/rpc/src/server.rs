//! Unix domain socket listener.

use anyhow::Result;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use terminal::TerminalManager;

/// Accept clients on `path` until `shutdown` resolves.
///
/// Refuses to start when another daemon already answers on the socket. A
/// leftover socket file with nobody listening is replaced.
#[cfg(unix)]
pub async fn serve(
    path: &Path,
    manager: Arc<TerminalManager>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    use anyhow::{bail, Context};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tokio::net::{UnixListener, UnixStream};

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory {:?}", parent))?;
        if let Err(e) = fs::set_permissions(parent, fs::Permissions::from_mode(0o700)) {
            tracing::warn!("Failed to restrict {:?}: {}", parent, e);
        }
    }

    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            bail!("Another termhost daemon is listening on {:?}", path);
        }
        tracing::info!("Removing stale socket {:?}", path);
        fs::remove_file(path).with_context(|| format!("Failed to remove stale socket {:?}", path))?;
    }

    let listener =
        UnixListener::bind(path).with_context(|| format!("Failed to bind {:?}", path))?;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!("Failed to restrict {:?}: {}", path, e);
    }
    tracing::info!("Listening on {:?}", path);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutting down listener");
                break;
            }
            accept = listener.accept() => match accept {
                Ok((stream, _)) => {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        let (reader, writer) = stream.into_split();
                        if let Err(e) = crate::serve_connection(manager, reader, writer).await {
                            tracing::warn!("Client connection ended with error: {:#}", e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            },
        }
    }

    drop(listener);
    if let Err(e) = fs::remove_file(path) {
        tracing::debug!("Failed to remove socket {:?}: {}", path, e);
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn serve(
    path: &Path,
    _manager: Arc<TerminalManager>,
    _shutdown: impl Future<Output = ()>,
) -> Result<()> {
    anyhow::bail!("Unix socket transport is not available on this platform ({:?})", path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::time::Duration;
    use terminal::test_support::FakePtySpawner;
    use terminal::ManagerOptions;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;
    use tokio::sync::oneshot;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn manager() -> Arc<TerminalManager> {
        Arc::new(
            TerminalManager::new(ManagerOptions::default())
                .with_spawner(Arc::new(FakePtySpawner::new())),
        )
    }

    async fn connect(path: &Path) -> UnixStream {
        for _ in 0..100 {
            if let Ok(stream) = UnixStream::connect(path).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("server never started listening on {:?}", path);
    }

    #[tokio::test]
    async fn serves_requests_and_cleans_up_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run").join("termhost.sock");
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn({
            let path = path.clone();
            let manager = manager();
            async move {
                serve(&path, manager, async {
                    stop_rx.await.ok();
                })
                .await
            }
        });

        let stream = connect(&path).await;
        let mode = std::fs::metadata(&path).expect("socket exists").permissions();
        assert_eq!(std::os::unix::fs::PermissionsExt::mode(&mode) & 0o777, 0o600);

        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(b"{\"requestId\":1,\"method\":\"createOrAttach\",\"params\":{\"id\":\"pane\"}}\n")
            .await
            .expect("write");
        let mut lines = BufReader::new(reader).lines();
        let line = tokio::time::timeout(TIMEOUT, lines.next_line())
            .await
            .expect("reply in time")
            .expect("read")
            .expect("line");
        let reply: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(reply["result"]["isNew"], json!(true));

        stop_tx.send(()).expect("server running");
        tokio::time::timeout(TIMEOUT, server)
            .await
            .expect("server stops")
            .expect("no panic")
            .expect("clean exit");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn replaces_stale_socket_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("termhost.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).expect("bind stale"));
        assert!(path.exists());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn({
            let path = path.clone();
            let manager = manager();
            async move {
                serve(&path, manager, async {
                    stop_rx.await.ok();
                })
                .await
            }
        });

        drop(connect(&path).await);
        stop_tx.send(()).expect("server running");
        tokio::time::timeout(TIMEOUT, server)
            .await
            .expect("server stops")
            .expect("no panic")
            .expect("clean exit");
    }

    #[tokio::test]
    async fn refuses_to_start_when_daemon_is_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("termhost.sock");
        let _live = tokio::net::UnixListener::bind(&path).expect("bind live");

        let error = serve(&path, manager(), std::future::pending())
            .await
            .expect_err("second daemon must not start");
        assert!(format!("{:#}", error).contains("daemon is listening"));
    }
}
