//! Fixtures shared by the lifecycle tests: a fake server binary driven through
//! `/bin/sh -c` and a tiny HTTP responder standing in for its health endpoint.

use std::{path::Path, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task::JoinHandle,
};

use crate::settings::Settings;

/// Answers `--version` and `--install-extension` like the real binary.
const FAKE_CLI: &str = r#"case "$1" in
  --version) echo "4.0.0-fake"; exit 0 ;;
  --install-extension) echo "installed $2"; exit 0 ;;
esac
"#;

/// Server body that stays up until signaled.
pub(crate) const SLEEPER: &str = "exec sleep 300";

/// Server body that dies right away with a diagnostic on stderr.
pub(crate) const CRASHER: &str = "echo 'boom: EADDRINUSE' >&2; exit 3";

/// Binds an ephemeral port and releases it.
pub(crate) fn free_port() -> u16 {
    let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    l.local_addr().unwrap().port()
}

/// Serves `status` for every request on an ephemeral local port.
pub(crate) async fn serve_http(status: u16) -> (u16, JoinHandle<()>) {
    serve_http_on(0, status).await
}

/// Like [`serve_http`], on a chosen port.
pub(crate) async fn serve_http_on(port: u16, status: u16) -> (u16, JoinHandle<()>) {
    serve_http_at("127.0.0.1", port, status).await.unwrap()
}

/// Like [`serve_http_on`], on a chosen host. Fails if the host cannot be bound.
pub(crate) async fn serve_http_at(
    host: &str,
    port: u16,
    status: u16,
) -> std::io::Result<(u16, JoinHandle<()>)> {
    let listener = TcpListener::bind((host, port)).await?;
    let port = listener.local_addr()?.port();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => seen.extend_from_slice(&buf[..n]),
                    }
                }
                let reason = if status == 200 { "OK" } else { "Unavailable" };
                let resp = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    Ok((port, handle))
}

/// Settings running `body` as the server, with short timings for tests.
pub(crate) fn fake_settings(root: &Path, body: &str, base_port: u16) -> Settings {
    let mut s = Settings::with_data_root(root);
    s.server_bin = "/bin/sh".to_string();
    s.server_args = vec![
        "-c".to_string(),
        format!("{FAKE_CLI}{body}"),
        "code-server".to_string(),
    ];
    s.install_command = "exit 1".to_string();
    s.extensions = Vec::new();
    s.base_port = base_port;
    s.launch_grace = Duration::from_millis(300);
    s.ready_interval = Duration::from_millis(50);
    s.ready_timeout = Duration::from_secs(5);
    s.probe_timeout = Duration::from_millis(500);
    s.stop_grace = Duration::from_secs(3);
    s.version_check_timeout = Duration::from_secs(5);
    s.extension_timeout = Duration::from_secs(5);
    s
}

/// Polls `cond` every 25ms for up to `limit`.
pub(crate) async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}

#[cfg(unix)]
pub(crate) fn pid_alive(pid: u32) -> bool {
    // Zombies still answer kill(0); treat them as gone.
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        if let Some(state) = stat.rsplit(')').next().and_then(|r| r.split_whitespace().next()) {
            return state != "Z";
        }
    }
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
