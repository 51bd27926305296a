//! Log process - collects log lines from the other processes

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;

use flotilla::config::Configuration;

pub async fn run(config_path: &str, debug: bool) -> Result<()> {
    let config = Configuration::load(config_path)?;
    super::init_tracing(&config, debug, false);

    std::fs::create_dir_all(&config.server_log.log_dir)?;
    let log_path = config.server_log.log_dir.join("server.log");
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await?;
    let file = Arc::new(Mutex::new(file));

    let bind = format!(
        "{}:{}",
        config.server_log.bind_host, config.server_log.bind_port
    );
    let listener = TcpListener::bind(&bind).await?;
    info!("Log collector listening on {}, writing {:?}", bind, log_path);

    let suppress_stdout = config.server_log.suppress_stdout;

    loop {
        let (stream, _) = listener.accept().await?;
        let file = file.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !suppress_stdout {
                    println!("{}", line);
                }
                let mut file = file.lock().await;
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
        });
    }
}
