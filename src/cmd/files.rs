//! Files process - serves input and result files over HTTP

use anyhow::Result;
use axum::Router;
use tower_http::services::ServeDir;
use tracing::info;

use flotilla::config::Configuration;

pub async fn run(config_path: &str, debug: bool) -> Result<()> {
    let config = Configuration::load(config_path)?;
    super::init_tracing(&config, debug, false);

    std::fs::create_dir_all(&config.server_files.input_files_dir)?;
    std::fs::create_dir_all(&config.server_files.result_files_dir)?;

    let app = Router::new()
        .nest_service(
            "/input-files",
            ServeDir::new(&config.server_files.input_files_dir),
        )
        .nest_service(
            "/result-files",
            ServeDir::new(&config.server_files.result_files_dir),
        );

    let bind = format!(
        "{}:{}",
        config.server_files.bind_host, config.server_files.bind_port
    );
    info!("File server listening on {}", bind);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
