use std::sync::Arc;

use advisor::{
    advice_router, init_logging, log_app_bind, log_app_start, logging_config_from_env,
    pipeline_config_from_env, server_addr_from_env, AdviceSource, FileAdviceSource,
    ReportSource, WorkspaceReportSource,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    let cfg = pipeline_config_from_env()?;
    log_app_start("advice_server", &logging_cfg, &cfg);

    let addr = server_addr_from_env()?;
    let advice: Arc<dyn AdviceSource> = Arc::new(FileAdviceSource::new(cfg.advice_path()));
    let reports: Arc<dyn ReportSource> =
        Arc::new(WorkspaceReportSource::new(cfg.workspace_path()));
    let app = advice_router(advice, reports);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
