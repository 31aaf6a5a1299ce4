//! Line echo server on top of the prefork core.
//!
//! Reads `prefork.toml` from the working directory when it exists, otherwise
//! listens on 127.0.0.1:7070 with a small pool. Try it with `nc 127.0.0.1 7070`
//! and steer it with signals:
//!
//! ```text
//! kill -HUP  <pid>   # full restart, rereads the configuration
//! kill -USR1 <pid>   # graceful restart, in-flight lines are answered first
//! kill -TERM <pid>   # stop
//! ```

use proc_prefork::{
    BoxFuture, Config, Connection, FileSource, LogLevel, Protocol, RequestInfo, Result, Server,
    WorkerStatus, DEFAULT_CONFIG_FILE,
};
use std::path::Path;
use std::time::Duration;
use tracing::info;

struct LineEcho;

impl Protocol for LineEcho {
    type Request = String;

    fn read_request<'a>(&'a self, conn: &'a mut Connection) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let mut line = String::new();
            if conn.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            Ok(Some(line.trim_end().to_string()))
        })
    }

    fn handle_request<'a>(&'a self, request: String, conn: &'a mut Connection) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if request.eq_ignore_ascii_case("quit") {
                conn.set_keep_alive(false);
                conn.write_all(b"bye\n").await?;
                return Ok(());
            }
            // simulate slow work so restarts can be observed mid-request
            if let Some(secs) = request.strip_prefix("slow ") {
                let secs = secs.trim().parse().unwrap_or(1);
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
            conn.write_all(request.as_bytes()).await?;
            conn.write_all(b"\n").await?;
            Ok(())
        })
    }

    fn describe(&self, request: &String, conn: &Connection) -> RequestInfo {
        RequestInfo::new(conn.peer_addr().to_string(), request.as_str(), "")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let server = if Path::new(DEFAULT_CONFIG_FILE).exists() {
        Server::builder(FileSource::default(), LineEcho).build()?
    } else {
        let config = Config::builder()
            .name("line-echo")
            .listen("127.0.0.1:7070".parse().expect("valid address"))
            .worker_limit(16)
            .idle_workers(2, 4)
            .start_workers(3)
            .keep_alive_timeout(Duration::from_secs(30))?
            .log_level(LogLevel::Info)
            .build()?;
        Server::builder(config, LineEcho).build()?
    };

    let control = server.control();
    let board = server.scoreboard();
    tokio::spawn(async move {
        let Ok(addrs) = control.listening().await else {
            return;
        };
        info!(?addrs, "line echo ready");
        loop {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let snapshot = board.snapshot();
            info!(
                generation = control.generation(),
                ready = snapshot.count(WorkerStatus::Ready),
                busy = snapshot.slots.iter().filter(|slot| slot.status.is_busy()).count(),
                "pool status"
            );
        }
    });

    server.run().await
}
