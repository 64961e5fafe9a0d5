use advisor::{
    init_logging, log_app_start, logging_config_from_env, pipeline_config_from_env,
    run_monitoring_flow, run_prediction_flow, run_training_flow, ReqwestBlockingFetcher,
};
use chrono::Utc;

const USAGE: &str = "usage: advisor_pipeline [train|predict|monitor|all]";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let command = std::env::args().nth(1).unwrap_or_else(|| "all".to_string());
    if !matches!(command.as_str(), "train" | "predict" | "monitor" | "all") {
        return Err(format!("unknown command '{command}'\n{USAGE}").into());
    }

    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    let cfg = pipeline_config_from_env()?;
    log_app_start("advisor_pipeline", &logging_cfg, &cfg);

    let run_date = Utc::now().date_naive();

    if matches!(command.as_str(), "train" | "all") {
        let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
        let summary = run_training_flow(&cfg, &fetcher, run_date)?;
        println!(
            "Trained {} candidates in {} | best n_lags_used={} mape={:.6} | registered {} v{} ({})",
            summary.candidates,
            summary.experiment,
            summary.best_n_lags_used,
            summary.best_mape,
            summary.registered.name,
            summary.registered.version,
            summary.registered.stage
        );
    }

    if matches!(command.as_str(), "predict" | "all") {
        let document = run_prediction_flow(&cfg, run_date)?;
        println!(
            "Advice for {} entities written to {}",
            document.len(),
            cfg.advice_path().display()
        );
    }

    if matches!(command.as_str(), "monitor" | "all") {
        let report = run_monitoring_flow(&cfg, run_date)?;
        println!(
            "Drift report stored in {} | drift share={:.3} dataset_drift={} mape={:.6}",
            cfg.workspace_path().display(),
            report.share_of_drifted_columns,
            report.dataset_drift,
            report.regression.mape
        );
    }

    Ok(())
}
